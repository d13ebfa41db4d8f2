//! # Test Doubles
//!
//! In-memory implementations of every hardware-facing trait, shared by the
//! unit tests and the orchestrator scenario tests. Each double is a cheap
//! `Clone` around shared interior state, so a test can keep an observer
//! handle after moving the double into the code under test.
//!
//! Single-threaded by design, like the device itself.

use chrono::{NaiveDate, NaiveDateTime};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use crate::battery::AdcChannel;
use crate::epd::{EpdError, InputPin, OutputPin, SerialBus};
use crate::http::Dialer;
use crate::platform::{ResetCause, Rtc, SystemControl, Watchdog, Wireless};

// ---------------------------------------------------------------- battery

/// Fixed-value ADC channel.
#[derive(Clone)]
pub struct MockAdc {
    value: Rc<Cell<u16>>,
}

impl MockAdc {
    pub fn new(value: u16) -> Self {
        Self {
            value: Rc::new(Cell::new(value)),
        }
    }

    pub fn set(&self, value: u16) {
        self.value.set(value);
    }
}

impl AdcChannel for MockAdc {
    fn read(&mut self) -> u16 {
        self.value.get()
    }
}

// -------------------------------------------------------------------- epd

/// Build a fixed-length reply: payload followed by a big-endian status word.
pub fn fixed_reply(payload: &[u8], status: u16) -> Vec<u8> {
    let mut reply = payload.to_vec();
    reply.extend_from_slice(&status.to_be_bytes());
    reply
}

/// Build a bare 2-byte status reply.
pub fn status_reply(status: u16) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}

#[derive(Default)]
struct BusState {
    frames: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    auto_status: Option<u16>,
}

/// Scripted serial bus: records written frames, serves queued replies.
///
/// With [`ScriptedBus::auto_status`] set, reads past the end of the queue
/// are served as an all-zero payload ending in the given status word, which
/// keeps long happy-path scripts short.
#[derive(Clone, Default)]
pub struct ScriptedBus {
    inner: Rc<RefCell<BusState>>,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: Vec<u8>) {
        self.inner.borrow_mut().replies.push_back(reply);
    }

    pub fn auto_status(&self, status: u16) {
        self.inner.borrow_mut().auto_status = Some(status);
    }

    /// Every frame written so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().frames.clone()
    }
}

impl SerialBus for ScriptedBus {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), EpdError> {
        self.inner.borrow_mut().frames.push(frame.to_vec());
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EpdError> {
        let mut state = self.inner.borrow_mut();
        match state.replies.pop_front() {
            Some(reply) => {
                if reply.len() != buf.len() {
                    return Err(EpdError::Bus(format!(
                        "scripted reply is {} bytes, read wants {}",
                        reply.len(),
                        buf.len()
                    )));
                }
                buf.copy_from_slice(&reply);
                Ok(())
            }
            None => match state.auto_status {
                Some(status) => {
                    buf.fill(0);
                    let n = buf.len();
                    buf[n - 2..].copy_from_slice(&status.to_be_bytes());
                    Ok(())
                }
                None => Err(EpdError::Bus("no scripted reply left".into())),
            },
        }
    }
}

/// Output line that remembers its level. Lines idle high.
#[derive(Clone)]
pub struct MockOutputPin {
    high: Rc<Cell<bool>>,
}

impl MockOutputPin {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            high: Rc::new(Cell::new(true)),
        }
    }

    pub fn is_high(&self) -> bool {
        self.high.get()
    }
}

impl OutputPin for MockOutputPin {
    fn set_high(&mut self) -> Result<(), EpdError> {
        self.high.set(true);
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), EpdError> {
        self.high.set(false);
        Ok(())
    }
}

/// Busy line that reports ready after a configured number of polls.
#[derive(Clone)]
pub struct MockBusyLine {
    polls_left: Rc<Cell<u32>>,
    ever_ready: bool,
}

impl MockBusyLine {
    /// Ready from the first poll.
    pub fn ready() -> Self {
        Self::after_polls(0)
    }

    /// Ready after `n` not-ready polls.
    pub fn after_polls(n: u32) -> Self {
        Self {
            polls_left: Rc::new(Cell::new(n)),
            ever_ready: true,
        }
    }

    /// Never ready; exercises the poll budget.
    pub fn never_ready() -> Self {
        Self {
            polls_left: Rc::new(Cell::new(0)),
            ever_ready: false,
        }
    }
}

impl InputPin for MockBusyLine {
    fn is_high(&self) -> Result<bool, EpdError> {
        if !self.ever_ready {
            return Ok(false);
        }
        let left = self.polls_left.get();
        if left > 0 {
            self.polls_left.set(left - 1);
            return Ok(false);
        }
        Ok(true)
    }
}

// ------------------------------------------------------------------- http

#[derive(Default)]
struct WireState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    dials: usize,
    fail_next_write: bool,
}

/// Scripted network: a dialer whose streams read from a shared byte queue
/// and append writes to a shared transcript.
#[derive(Clone, Default)]
pub struct MockWire {
    inner: Rc<RefCell<WireState>>,
}

impl MockWire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the client to read.
    pub fn push_response(&self, bytes: &[u8]) {
        self.inner.borrow_mut().rx.extend(bytes.iter().copied());
    }

    /// Everything the client has written.
    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().tx.clone()
    }

    pub fn dials(&self) -> usize {
        self.inner.borrow().dials
    }

    /// Make the next stream write fail, simulating a dropped keep-alive
    /// socket.
    pub fn fail_next_write(&self) {
        self.inner.borrow_mut().fail_next_write = true;
    }
}

impl Dialer for MockWire {
    type Stream = MockStream;

    fn dial(&mut self, _host: &str, _port: u16) -> io::Result<MockStream> {
        self.inner.borrow_mut().dials += 1;
        Ok(MockStream {
            inner: Rc::clone(&self.inner),
        })
    }
}

pub struct MockStream {
    inner: Rc<RefCell<WireState>>,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.borrow_mut();
        let mut n = 0;
        while n < buf.len() {
            match state.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.borrow_mut();
        if state.fail_next_write {
            state.fail_next_write = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        state.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// --------------------------------------------------------------- platform

/// Watchdog that counts its feeds.
#[derive(Clone, Default)]
pub struct MockWatchdog {
    feeds: Rc<Cell<usize>>,
}

impl MockWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feeds(&self) -> usize {
        self.feeds.get()
    }
}

impl Watchdog for MockWatchdog {
    fn feed(&mut self) {
        self.feeds.set(self.feeds.get() + 1);
    }
}

#[derive(Debug)]
struct RtcState {
    now: NaiveDateTime,
    time_set_to: Option<NaiveDateTime>,
    alarm_at: Option<NaiveDateTime>,
    alarm_in_ms: Option<u64>,
    alarm_left_ms: u64,
}

impl Default for RtcState {
    fn default() -> Self {
        Self {
            // arbitrary but deterministic boot time
            now: NaiveDate::from_ymd_opt(2016, 1, 31)
                .unwrap()
                .and_hms_opt(14, 0, 0)
                .unwrap(),
            time_set_to: None,
            alarm_at: None,
            alarm_in_ms: None,
            alarm_left_ms: 0,
        }
    }
}

/// RTC double with an inspectable alarm register.
#[derive(Clone, Default)]
pub struct MockRtc {
    inner: Rc<RefCell<RtcState>>,
}

impl MockRtc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate waking with time still left on the alarm.
    pub fn set_alarm_left_ms(&self, ms: u64) {
        self.inner.borrow_mut().alarm_left_ms = ms;
    }

    pub fn time_set_to(&self) -> Option<NaiveDateTime> {
        self.inner.borrow().time_set_to
    }

    pub fn alarm_at(&self) -> Option<NaiveDateTime> {
        self.inner.borrow().alarm_at
    }

    pub fn alarm_in_ms(&self) -> Option<u64> {
        self.inner.borrow().alarm_in_ms
    }
}

impl Rtc for MockRtc {
    fn now(&self) -> NaiveDateTime {
        self.inner.borrow().now
    }

    fn set_time(&mut self, t: NaiveDateTime) {
        let mut state = self.inner.borrow_mut();
        state.now = t;
        state.time_set_to = Some(t);
    }

    fn set_alarm_at(&mut self, t: NaiveDateTime) {
        let mut state = self.inner.borrow_mut();
        state.alarm_at = Some(t);
        let delta = t.signed_duration_since(state.now).num_milliseconds();
        state.alarm_left_ms = if delta > 0 { delta as u64 } else { 0 };
    }

    fn set_alarm_in_ms(&mut self, ms: u64) {
        let mut state = self.inner.borrow_mut();
        state.alarm_in_ms = Some(ms);
        state.alarm_left_ms = ms;
    }

    fn alarm_left_ms(&self) -> u64 {
        self.inner.borrow().alarm_left_ms
    }
}

#[derive(Default)]
struct WirelessState {
    visible: Vec<String>,
    connected: bool,
    joins: Vec<(String, String)>,
    scans: usize,
}

/// Wireless double: joins always associate.
#[derive(Clone, Default)]
pub struct MockWireless {
    inner: Rc<RefCell<WirelessState>>,
}

impl MockWireless {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visible(&self, ssids: &[&str]) {
        self.inner.borrow_mut().visible = ssids.iter().map(|s| s.to_string()).collect();
    }

    pub fn scans(&self) -> usize {
        self.inner.borrow().scans
    }

    pub fn joins(&self) -> Vec<(String, String)> {
        self.inner.borrow().joins.clone()
    }
}

impl Wireless for MockWireless {
    fn scan(&mut self) -> Vec<String> {
        let mut state = self.inner.borrow_mut();
        state.scans += 1;
        state.visible.clone()
    }

    fn join(&mut self, ssid: &str, passphrase: &str) {
        let mut state = self.inner.borrow_mut();
        state.joins.push((ssid.to_string(), passphrase.to_string()));
        state.connected = true;
    }

    fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }
}

#[derive(Default)]
struct SystemState {
    cause: Option<ResetCause>,
    heartbeat_on: Option<bool>,
    idles: usize,
    sleep_requests: usize,
}

/// System control double; deep sleep is recorded, not performed.
#[derive(Clone, Default)]
pub struct MockSystem {
    inner: Rc<RefCell<SystemState>>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reset_cause(&self, cause: ResetCause) {
        self.inner.borrow_mut().cause = Some(cause);
    }

    pub fn heartbeat_on(&self) -> Option<bool> {
        self.inner.borrow().heartbeat_on
    }

    pub fn sleep_requests(&self) -> usize {
        self.inner.borrow().sleep_requests
    }
}

impl SystemControl for MockSystem {
    fn reset_cause(&self) -> ResetCause {
        self.inner.borrow().cause.unwrap_or(ResetCause::DeepSleepWake)
    }

    fn heartbeat(&mut self, on: bool) {
        self.inner.borrow_mut().heartbeat_on = Some(on);
    }

    fn idle(&mut self) {
        self.inner.borrow_mut().idles += 1;
    }

    fn deep_sleep(&mut self) {
        self.inner.borrow_mut().sleep_requests += 1;
    }
}
