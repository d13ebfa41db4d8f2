//! # Tide Panel Entry Point
//!
//! Wires the library to a Linux SBC host and runs exactly one wake cycle:
//! the process either ends in deep sleep (suspend with the RTC alarm
//! armed) or stays up where the failure policy demands intervention.
//!
//! Hardware access (GPIO character device, spidev) sits behind the
//! `hardware` cargo feature; without it the binary explains itself and
//! exits, which keeps the library testable everywhere.

// Test modules
#[cfg(test)]
mod tests;

#[cfg(all(target_os = "linux", feature = "hardware"))]
mod board;
#[cfg(all(target_os = "linux", feature = "hardware"))]
mod hw;

use anyhow::Result;
use std::env;
use std::path::PathBuf;

use tide_panel_lib::config::{PRIMARY_CONFIG_PATH, SECONDARY_CONFIG_PATH};

/// Default notice-image directory.
const IMG_DIR: &str = "/flash/imgs";

/// GPIO offsets for the panel control lines.
#[cfg(all(target_os = "linux", feature = "hardware"))]
const EPD_ENABLE_GPIO: u32 = 4;
#[cfg(all(target_os = "linux", feature = "hardware"))]
const EPD_BUSY_GPIO: u32 = 5;

/// IIO channel carrying the battery divider.
#[cfg(all(target_os = "linux", feature = "hardware"))]
const BATTERY_ADC_PATH: &str = "/sys/bus/iio/devices/iio:device0/in_voltage0_raw";

#[cfg_attr(not(all(target_os = "linux", feature = "hardware")), allow(dead_code))]
struct Options {
    image_dir: PathBuf,
    primary: PathBuf,
    secondary: PathBuf,
    stay_awake: bool,
    retry_upload: bool,
}

impl Options {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let value_of = |flag: &str| -> Option<PathBuf> {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from)
        };
        Options {
            image_dir: value_of("--images").unwrap_or_else(|| PathBuf::from(IMG_DIR)),
            primary: value_of("--primary").unwrap_or_else(|| PathBuf::from(PRIMARY_CONFIG_PATH)),
            secondary: value_of("--secondary")
                .unwrap_or_else(|| PathBuf::from(SECONDARY_CONFIG_PATH)),
            stay_awake: args.iter().any(|a| a == "--stay-awake"),
            retry_upload: args.iter().any(|a| a == "--retry-upload"),
        }
    }
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
fn run_device(opts: Options) -> Result<()> {
    use anyhow::Context;
    use tide_panel_lib::battery::BatteryGauge;
    use tide_panel_lib::config::ConfigStore;
    use tide_panel_lib::cycle::{Platform, WakeCycle};
    use tide_panel_lib::epd::EpdLink;
    use tide_panel_lib::http::TcpDialer;

    let mut chip = gpio_cdev::Chip::new("/dev/gpiochip0").context("open gpiochip0")?;
    let enable = hw::CdevOutputPin::new(&mut chip, EPD_ENABLE_GPIO).context("request enable line")?;
    let busy = hw::CdevInputPin::new(&mut chip, EPD_BUSY_GPIO).context("request busy line")?;
    let bus = hw::SpidevBus::new("/dev/spidev0.0").context("open SPI device")?;

    let platform = Platform {
        rtc: Box::new(board::SystemRtc::new()),
        wdt: Box::new(board::LinuxWatchdog::open()),
        wireless: Box::new(board::HostWireless),
        system: Box::new(board::HostSystem::default()),
    };

    let mut cycle = WakeCycle::new(
        BatteryGauge::new(board::IioAdc::new(BATTERY_ADC_PATH)),
        EpdLink::new(bus, enable, busy),
        ConfigStore::new(&opts.primary, &opts.secondary),
        TcpDialer,
        platform,
        &opts.image_dir,
    )
    .with_user_wake(opts.stay_awake)
    .with_upload_retry(opts.retry_upload);

    cycle.run_to_sleep();
    Ok(())
}

/// Main application entry point.
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Options::from_args();

    #[cfg(all(target_os = "linux", feature = "hardware"))]
    {
        return run_device(opts);
    }

    #[cfg(not(all(target_os = "linux", feature = "hardware")))]
    {
        let _ = opts;
        anyhow::bail!(
            "hardware support not enabled; rebuild with --features hardware on the target board"
        );
    }
}
