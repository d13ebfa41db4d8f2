//! # EPD Protocol Driver
//!
//! Driver for the panel controller's command/response protocol over a
//! synchronous serial bus. Every command is a fixed 3-byte header
//! (`instruction, p1, p2`), optionally followed by a length-prefixed data
//! payload (251 bytes at most, per the datasheet) and an expected-response
//! length byte. Every response ends in a 2-byte big-endian status word;
//! `0x9000` is the only success value.
//!
//! Bus parameters, from the datasheet: up to 12 MHz, CPOL = 1, CPHA = 1,
//! MSB first, chip select active low. The driver also owns two control
//! lines, both active low: power enable, and the busy line (high at boot,
//! low during init, high again once idle).

use log::trace;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::platform::Watchdog;

/// Largest data payload one command frame may carry.
pub const MAX_PAYLOAD: usize = 251;

/// Chunk size used when feeding framebuffer data.
pub const UPLOAD_CHUNK: usize = 250;

/// Scratch size for variable, null-terminated responses.
const MAX_READ: usize = 45;

/// Default framebuffer slot: always the oldest, so the controller can
/// wear-level across slots.
pub const DEFAULT_SLOT: u8 = 0;

// Status words from the controller's documented table.
const SW_NORMAL_PROCESSING: u16 = 0x9000;
const EP_FRAMEBUFFER_SLOT_OVERRUN: u16 = 0x6a84; // too much data fed in
const EP_SW_INVALID_LE: u16 = 0x6c00; // wrong expected length
const EP_SW_INSTRUCTION_NOT_SUPPORTED: u16 = 0x6d00; // bad instruction
const EP_SW_WRONG_PARAMETERS_P1P2: u16 = 0x6a00;
const EP_SW_WRONG_LENGTH: u16 = 0x6700;

/// Settle time after a framebuffer chunk. 450 µs and the busy line never
/// comes back.
const CHUNK_SETTLE: Duration = Duration::from_micros(1000);

/// Interval between busy-line polls.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Default poll budget (~5 s at [`POLL_INTERVAL`]).
const DEFAULT_POLL_BUDGET: u32 = 10_000;

/// Errors from the protocol driver.
#[derive(Error, Debug)]
pub enum EpdError {
    /// The underlying bus or control line failed.
    #[error("bus fault: {0}")]
    Bus(String),

    /// Status `0x6a84`: framebuffer slot overrun.
    #[error("framebuffer slot overrun")]
    SlotOverrun,

    /// Status `0x6c00`: invalid expected length.
    #[error("invalid expected length")]
    InvalidLength,

    /// Status `0x6d00`: instruction not supported.
    #[error("instruction not supported")]
    UnsupportedInstruction,

    /// Status `0x6a00`: wrong P1/P2 parameters.
    #[error("wrong parameters P1/P2")]
    WrongParameters,

    /// Status `0x6700`: wrong length.
    #[error("wrong length")]
    WrongLength,

    /// A status word outside the documented table.
    #[error("bad status word {0:#06x}")]
    BadStatus(u16),

    /// A variable-length response did not contain a usable terminator.
    #[error("response framing mismatch")]
    Framing,

    /// The busy line never reported ready within the poll budget.
    #[error("device not ready after {0} polls")]
    NotReady(u32),

    /// A multi-chunk upload stopped early; `position` is the count of
    /// bytes already accepted by the controller.
    #[error("upload stopped at byte {position}: {source}")]
    UploadStopped {
        position: usize,
        #[source]
        source: Box<EpdError>,
    },
}

fn status_to_error(word: u16) -> EpdError {
    match word {
        EP_FRAMEBUFFER_SLOT_OVERRUN => EpdError::SlotOverrun,
        EP_SW_INVALID_LE => EpdError::InvalidLength,
        EP_SW_INSTRUCTION_NOT_SUPPORTED => EpdError::UnsupportedInstruction,
        EP_SW_WRONG_PARAMETERS_P1P2 => EpdError::WrongParameters,
        EP_SW_WRONG_LENGTH => EpdError::WrongLength,
        other => EpdError::BadStatus(other),
    }
}

/// Synchronous serial bus carrying command frames and responses.
pub trait SerialBus {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), EpdError>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EpdError>;
}

/// Output control line.
pub trait OutputPin {
    fn set_high(&mut self) -> Result<(), EpdError>;
    fn set_low(&mut self) -> Result<(), EpdError>;
}

/// Input control line.
pub trait InputPin {
    fn is_high(&self) -> Result<bool, EpdError>;
}

/// Response framing for a command.
///
/// `Fixed(n)` reads `2 + n` bytes back. `Text` performs a full
/// [`MAX_READ`]-byte scratch read and extracts the string up to its null
/// terminator, reattaching the 2 status bytes that trail it. `StatusOnly`
/// reads the bare 2-byte status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expect {
    StatusOnly,
    Fixed(u8),
    Text,
}

/// The panel controller link.
///
/// State machine: `Disabled -> Enabling -> Ready <-> Busy -> Disabled`.
/// [`EpdLink::enable`] powers the controller and blocks until the busy line
/// reports idle; [`EpdLink::disable`] just cuts power, nothing is awaited.
pub struct EpdLink<BUS, EN, BUSY> {
    bus: BUS,
    enable_pin: EN,
    busy_pin: BUSY,
    poll_budget: u32,
}

impl<BUS, EN, BUSY> EpdLink<BUS, EN, BUSY>
where
    BUS: SerialBus,
    EN: OutputPin,
    BUSY: InputPin,
{
    pub fn new(bus: BUS, enable_pin: EN, busy_pin: BUSY) -> Self {
        Self {
            bus,
            enable_pin,
            busy_pin,
            poll_budget: DEFAULT_POLL_BUDGET,
        }
    }

    /// Override the busy-line poll budget. Mostly for tests, where nobody
    /// wants to wait out the full window against a double.
    pub fn with_poll_budget(mut self, budget: u32) -> Self {
        self.poll_budget = budget;
        self
    }

    /// Power the controller and wait for it to come up.
    ///
    /// The busy line goes high at boot, low during init, then high once
    /// idle; the controller documents that commands must wait for that
    /// final high.
    pub fn enable(&mut self) -> Result<(), EpdError> {
        self.enable_pin.set_low()?; // power enable is active low
        thread::sleep(Duration::from_millis(5));
        self.wait_ready()
    }

    /// Cut power. No response is awaited; the controller is simply off.
    pub fn disable(&mut self) -> Result<(), EpdError> {
        self.enable_pin.set_high()
    }

    /// Poll the busy line until the controller reports idle.
    fn wait_ready(&mut self) -> Result<(), EpdError> {
        for _ in 0..self.poll_budget {
            if self.busy_pin.is_high()? {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(EpdError::NotReady(self.poll_budget))
    }

    /// Frame and send one command, returning the response payload with the
    /// status word stripped.
    ///
    /// A non-success status word maps to its named error; unrecognized
    /// words surface as [`EpdError::BadStatus`] carrying the raw value.
    ///
    /// # Panics
    /// If `data` exceeds [`MAX_PAYLOAD`] bytes. That is a programming
    /// error, not a runtime condition.
    pub fn send_command(
        &mut self,
        ins: u8,
        p1: u8,
        p2: u8,
        data: Option<&[u8]>,
        expect: Expect,
    ) -> Result<Vec<u8>, EpdError> {
        let mut frame = Vec::with_capacity(3 + data.map_or(0, |d| d.len() + 1) + 1);
        frame.extend_from_slice(&[ins, p1, p2]);
        if let Some(data) = data {
            assert!(data.len() <= MAX_PAYLOAD, "command payload exceeds protocol ceiling");
            frame.push(data.len() as u8);
            frame.extend_from_slice(data);
        }
        match expect {
            Expect::StatusOnly => {}
            Expect::Fixed(n) => frame.push(n),
            Expect::Text => frame.push(0),
        }

        trace!("epd tx {frame:02x?}");
        self.bus.write_frame(&frame)?;

        // the controller takes at most ~14.5 us before the busy line means
        // anything
        thread::sleep(Duration::from_micros(15));
        self.wait_ready()?;

        let mut response = match expect {
            Expect::StatusOnly => {
                let mut buf = vec![0u8; 2];
                self.bus.read_exact(&mut buf)?;
                buf
            }
            Expect::Fixed(n) => {
                let mut buf = vec![0u8; 2 + n as usize];
                self.bus.read_exact(&mut buf)?;
                buf
            }
            Expect::Text => {
                let mut buf = vec![0u8; MAX_READ];
                self.bus.read_exact(&mut buf)?;
                let strlen = buf
                    .iter()
                    .position(|&b| b == 0)
                    .filter(|&p| p + 3 <= MAX_READ)
                    .ok_or(EpdError::Framing)?;
                let mut trimmed = buf[..strlen].to_vec();
                trimmed.extend_from_slice(&buf[strlen + 1..strlen + 3]);
                trimmed
            }
        };
        trace!("epd rx {response:02x?}");

        let status = u16::from_be_bytes([response[response.len() - 2], response[response.len() - 1]]);
        if status != SW_NORMAL_PROCESSING {
            return Err(status_to_error(status));
        }

        response.truncate(response.len() - 2);
        Ok(response)
    }

    /// Read the panel's onboard sensor (temperature).
    pub fn get_sensor_reading(&mut self) -> Result<u16, EpdError> {
        let raw = self.send_command(0xe5, 1, 0, None, Expect::Fixed(2))?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Controller device identifier, 20 bytes.
    pub fn get_device_id(&mut self) -> Result<Vec<u8>, EpdError> {
        self.send_command(0x30, 2, 1, None, Expect::Fixed(0x14))
    }

    /// Controller system information string.
    pub fn get_system_info(&mut self) -> Result<String, EpdError> {
        let raw = self.send_command(0x31, 1, 1, None, Expect::Text)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Controller version code, 16 bytes.
    pub fn get_system_version_code(&mut self) -> Result<Vec<u8>, EpdError> {
        self.send_command(0x31, 2, 1, None, Expect::Fixed(0x10))
    }

    /// Refresh the panel from a framebuffer slot. `full_flash` runs the
    /// full waveform; otherwise the faster partial update.
    pub fn refresh(&mut self, slot: u8, full_flash: bool) -> Result<(), EpdError> {
        let ins = if full_flash { 0x24 } else { 0x86 };
        self.send_command(ins, 1, slot, None, Expect::StatusOnly)
            .map(drop)
    }

    /// Rewind the controller's data pointer to the start of the slot.
    pub fn reset_data_pointer(&mut self) -> Result<(), EpdError> {
        self.send_command(0x20, 0x0d, 0, None, Expect::StatusOnly)
            .map(drop)
    }

    /// Blank a framebuffer slot.
    pub fn erase_framebuffer(&mut self, slot: u8) -> Result<(), EpdError> {
        self.send_command(0x20, 0x0e, slot, None, Expect::StatusOnly)
            .map(drop)
    }

    /// The controller's checksum over a framebuffer slot.
    pub fn checksum(&mut self, slot: u8) -> Result<u16, EpdError> {
        let raw = self.send_command(0x2e, 1, slot, None, Expect::Fixed(2))?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Feed one framebuffer chunk (at most [`UPLOAD_CHUNK`] bytes).
    pub fn upload_chunk(&mut self, data: &[u8], slot: u8) -> Result<(), EpdError> {
        self.send_command(0x20, 1, slot, Some(data), Expect::StatusOnly)?;
        thread::sleep(CHUNK_SETTLE);
        Ok(())
    }

    /// Chop an arbitrary-length image into chunks and feed them all.
    ///
    /// The watchdog is fed after every chunk; a full-panel transfer takes
    /// longer than the watchdog timeout. Any protocol error aborts the
    /// remaining chunks and reports the byte position reached, so the
    /// caller can decide whether to retry or give up.
    pub fn upload_whole_image(
        &mut self,
        img: &[u8],
        slot: u8,
        wdt: &mut dyn Watchdog,
    ) -> Result<(), EpdError> {
        let mut position = 0usize;
        for chunk in img.chunks(UPLOAD_CHUNK) {
            self.upload_chunk(chunk, slot)
                .map_err(|err| EpdError::UploadStopped {
                    position,
                    source: Box::new(err),
                })?;
            position += chunk.len();
            wdt.feed();
        }
        Ok(())
    }
}

/// Checksum over image data, reproducing the controller's own algorithm
/// bit for bit (the on-device result must match).
///
/// Initial accumulator `0x6363`; per byte: XOR in, byte-swap, then three
/// self-XOR shift-mix steps. `skip` ignores a fixed header prefix.
pub fn frame_checksum(data: &[u8], skip: usize) -> u16 {
    let mut acc: u16 = 0x6363;
    for &byte in data.iter().skip(skip) {
        acc ^= u16::from(byte);
        acc = acc.swap_bytes();
        acc ^= (acc & 0xff00) << 4;
        acc ^= (acc >> 8) >> 4;
        acc ^= (acc & 0xff00) >> 5;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fixed_reply, status_reply, MockBusyLine, MockOutputPin, MockWatchdog, ScriptedBus};

    fn link(bus: ScriptedBus) -> EpdLink<ScriptedBus, MockOutputPin, MockBusyLine> {
        EpdLink::new(bus, MockOutputPin::new(), MockBusyLine::ready()).with_poll_budget(16)
    }

    #[test]
    fn command_frame_layout_and_fixed_response() {
        let bus = ScriptedBus::new();
        let spy = bus.clone();
        let payload = [0x11u8; 10];
        // 4-byte reply plus success status
        bus.push_reply(fixed_reply(&[0xde, 0xad, 0xbe, 0xef], 0x9000));
        let mut epd = link(bus);

        let got = epd
            .send_command(0x20, 1, 3, Some(&payload), Expect::Fixed(4))
            .unwrap();
        assert_eq!(got, vec![0xde, 0xad, 0xbe, 0xef]);

        let frames = spy.frames();
        let frame = &frames[0];
        assert_eq!(&frame[..3], &[0x20, 1, 3]);
        assert_eq!(frame[3], 10); // length prefix
        assert_eq!(&frame[4..14], &payload);
        assert_eq!(frame[14], 4); // expected-response byte
        assert_eq!(frame.len(), 15);
    }

    #[test]
    fn status_only_command_has_no_trailing_expect_byte() {
        let bus = ScriptedBus::new();
        let spy = bus.clone();
        bus.push_reply(status_reply(0x9000));
        let mut epd = link(bus);

        epd.send_command(0x20, 0x0e, 0, None, Expect::StatusOnly)
            .unwrap();
        assert_eq!(spy.frames()[0], vec![0x20, 0x0e, 0]);
    }

    #[test]
    fn documented_status_words_map_to_named_errors() {
        let cases = [
            (0x6a84, "framebuffer slot overrun"),
            (0x6c00, "invalid expected length"),
            (0x6d00, "instruction not supported"),
            (0x6a00, "wrong parameters P1/P2"),
            (0x6700, "wrong length"),
        ];
        for (word, text) in cases {
            let bus = ScriptedBus::new();
            bus.push_reply(status_reply(word));
            let err = link(bus)
                .send_command(0x20, 1, 0, None, Expect::StatusOnly)
                .unwrap_err();
            assert_eq!(err.to_string(), text);
        }
    }

    #[test]
    fn unknown_status_word_carries_raw_value() {
        let bus = ScriptedBus::new();
        bus.push_reply(status_reply(0x1234));
        let err = link(bus)
            .send_command(0x20, 1, 0, None, Expect::StatusOnly)
            .unwrap_err();
        assert!(matches!(err, EpdError::BadStatus(0x1234)));
    }

    #[test]
    fn text_response_extracts_up_to_null() {
        let bus = ScriptedBus::new();
        let mut scratch = vec![0u8; 45];
        scratch[..5].copy_from_slice(b"EPD 9");
        // null terminator already at index 5; status follows it
        scratch[6] = 0x90;
        scratch[7] = 0x00;
        bus.push_reply(scratch);
        let mut epd = link(bus);

        assert_eq!(epd.get_system_info().unwrap(), "EPD 9");
    }

    #[test]
    fn text_response_without_terminator_is_a_framing_error() {
        let bus = ScriptedBus::new();
        bus.push_reply(vec![0xaa; 45]);
        let err = link(bus).get_system_info().unwrap_err();
        assert!(matches!(err, EpdError::Framing));
    }

    #[test]
    fn sensor_reading_is_big_endian() {
        let bus = ScriptedBus::new();
        bus.push_reply(fixed_reply(&[0x01, 0x42], 0x9000));
        assert_eq!(link(bus).get_sensor_reading().unwrap(), 0x0142);
    }

    #[test]
    #[should_panic(expected = "protocol ceiling")]
    fn oversize_payload_is_a_programming_error() {
        let bus = ScriptedBus::new();
        let _ = link(bus).send_command(0x20, 1, 0, Some(&[0u8; 252]), Expect::StatusOnly);
    }

    #[test]
    fn whole_image_upload_chunks_and_feeds_watchdog() {
        let bus = ScriptedBus::new();
        let spy = bus.clone();
        bus.auto_status(0x9000);
        let mut epd = link(bus);
        let mut wdt = MockWatchdog::new();

        let img = vec![0x55u8; 600];
        epd.upload_whole_image(&img, 0, &mut wdt).unwrap();

        let frames = spy.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][3] as usize, 250);
        assert_eq!(frames[1][3] as usize, 250);
        assert_eq!(frames[2][3] as usize, 100);
        assert_eq!(wdt.feeds(), 3);
    }

    #[test]
    fn upload_abort_reports_position_reached() {
        let bus = ScriptedBus::new();
        bus.push_reply(status_reply(0x9000));
        bus.push_reply(status_reply(0x6700));
        let mut epd = link(bus);
        let mut wdt = MockWatchdog::new();

        let img = vec![0u8; 600];
        let err = epd.upload_whole_image(&img, 0, &mut wdt).unwrap_err();
        match err {
            EpdError::UploadStopped { position, source } => {
                assert_eq!(position, 250);
                assert!(matches!(*source, EpdError::WrongLength));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(wdt.feeds(), 1);
    }

    #[test]
    fn enable_waits_for_busy_line() {
        let bus = ScriptedBus::new();
        let enable_pin = MockOutputPin::new();
        let pin_spy = enable_pin.clone();
        let busy = MockBusyLine::after_polls(3);
        let mut epd = EpdLink::new(bus, enable_pin, busy).with_poll_budget(16);

        epd.enable().unwrap();
        assert!(!pin_spy.is_high()); // power enable held low
        epd.disable().unwrap();
        assert!(pin_spy.is_high());
    }

    #[test]
    fn enable_gives_up_after_poll_budget() {
        let bus = ScriptedBus::new();
        let busy = MockBusyLine::never_ready();
        let mut epd = EpdLink::new(bus, MockOutputPin::new(), busy).with_poll_budget(4);
        assert!(matches!(epd.enable(), Err(EpdError::NotReady(4))));
    }

    #[test]
    fn frame_checksum_is_deterministic() {
        let data: Vec<u8> = (0u8..=255).cycle().take(600).collect();
        assert_eq!(frame_checksum(&data, 16), frame_checksum(&data, 16));
    }

    #[test]
    fn frame_checksum_sees_every_unskipped_bit() {
        let data = vec![0xa5u8; 64];
        let base = frame_checksum(&data, 16);
        for i in 16..64 {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[i] ^= 1 << bit;
                assert_ne!(
                    frame_checksum(&flipped, 16),
                    base,
                    "flip at byte {i} bit {bit} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn frame_checksum_ignores_skipped_prefix() {
        let data = vec![0x00u8; 64];
        let mut altered = data.clone();
        altered[3] = 0xff;
        assert_eq!(frame_checksum(&data, 16), frame_checksum(&altered, 16));
        assert_ne!(frame_checksum(&data, 0), frame_checksum(&altered, 0));
    }
}
