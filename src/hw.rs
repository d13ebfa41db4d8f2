//! Hardware bindings for the Linux host: character-device GPIO for the
//! panel control lines, spidev for the serial bus.
//!
//! Datasheet bus parameters: up to 12 MHz, CPOL = 1 / CPHA = 1 (mode 3),
//! MSB first, chip select active low (handled by the kernel driver). The
//! conservative 100 kHz default has proven reliable on long leads.

use gpio_cdev::{Chip, LineRequestFlags};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use std::io::Write;
use tide_panel_lib::epd::{EpdError, InputPin, OutputPin, SerialBus};

const SPI_SPEED_HZ: u32 = 100_000;

pub struct CdevOutputPin {
    line: gpio_cdev::LineHandle,
}

impl CdevOutputPin {
    /// Request an output line, idling high (both control lines are active
    /// low, so high means released).
    pub fn new(chip: &mut Chip, offset: u32) -> Result<Self, EpdError> {
        let line = chip
            .get_line(offset)
            .map_err(|e| EpdError::Bus(e.to_string()))?
            .request(LineRequestFlags::OUTPUT, 1, "tide-panel")
            .map_err(|e| EpdError::Bus(e.to_string()))?;
        Ok(Self { line })
    }
}

impl OutputPin for CdevOutputPin {
    fn set_high(&mut self) -> Result<(), EpdError> {
        self.line
            .set_value(1)
            .map_err(|e| EpdError::Bus(e.to_string()))
    }

    fn set_low(&mut self) -> Result<(), EpdError> {
        self.line
            .set_value(0)
            .map_err(|e| EpdError::Bus(e.to_string()))
    }
}

pub struct CdevInputPin {
    line: gpio_cdev::LineHandle,
}

impl CdevInputPin {
    pub fn new(chip: &mut Chip, offset: u32) -> Result<Self, EpdError> {
        let line = chip
            .get_line(offset)
            .map_err(|e| EpdError::Bus(e.to_string()))?
            .request(LineRequestFlags::INPUT, 0, "tide-panel")
            .map_err(|e| EpdError::Bus(e.to_string()))?;
        Ok(Self { line })
    }
}

impl InputPin for CdevInputPin {
    fn is_high(&self) -> Result<bool, EpdError> {
        Ok(self
            .line
            .get_value()
            .map_err(|e| EpdError::Bus(e.to_string()))?
            == 1)
    }
}

/// Kernel SPI device carrying command frames and responses.
pub struct SpidevBus {
    dev: Spidev,
}

impl SpidevBus {
    pub fn new(path: &str) -> Result<Self, EpdError> {
        let mut dev = Spidev::open(path).map_err(|e| EpdError::Bus(e.to_string()))?;
        let opts = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(SPI_SPEED_HZ)
            .mode(SpiModeFlags::SPI_MODE_3)
            .build();
        dev.configure(&opts)
            .map_err(|e| EpdError::Bus(e.to_string()))?;
        Ok(Self { dev })
    }
}

impl SerialBus for SpidevBus {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), EpdError> {
        self.dev
            .write_all(frame)
            .map_err(|e| EpdError::Bus(e.to_string()))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EpdError> {
        let tx = vec![0u8; buf.len()]; // dummy clocks
        let mut tr = SpidevTransfer::read_write(&tx, buf);
        self.dev
            .transfer(&mut tr)
            .map_err(|e| EpdError::Bus(e.to_string()))
    }
}
