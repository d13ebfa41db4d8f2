//! Host platform services for a Linux SBC target.
//!
//! The RTC wake alarm goes through the kernel's `wakealarm` interface and
//! deep sleep through `/sys/power/state`, so an armed alarm genuinely
//! wakes the board. WiFi association is delegated to the host's
//! supplicant; the cycle only observes link state.

use chrono::{NaiveDateTime, Utc};
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tide_panel_lib::battery::{AdcChannel, CHARGED};
use tide_panel_lib::platform::{ResetCause, Rtc, SystemControl, Watchdog, Wireless};

const WAKEALARM_PATH: &str = "/sys/class/rtc/rtc0/wakealarm";
const SLEEP_STATE_PATH: &str = "/sys/power/state";
const WATCHDOG_PATH: &str = "/dev/watchdog";
const LINK_STATE_PATH: &str = "/sys/class/net/wlan0/operstate";

/// Battery sense via an IIO ADC channel. Boards without one (bench
/// setups on mains power) read as fully charged.
pub struct IioAdc {
    path: PathBuf,
}

impl IioAdc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AdcChannel for IioAdc {
    fn read(&mut self) -> u16 {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse().unwrap_or(CHARGED),
            Err(_) => CHARGED,
        }
    }
}

/// System clock plus the kernel RTC wake alarm.
pub struct SystemRtc {
    deadline: Option<NaiveDateTime>,
}

impl SystemRtc {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    fn arm(&mut self, deadline: NaiveDateTime) {
        self.deadline = Some(deadline);
        let epoch = deadline.and_utc().timestamp();
        // the kernel requires a clear before a re-arm
        let _ = fs::write(WAKEALARM_PATH, "0");
        if let Err(err) = fs::write(WAKEALARM_PATH, epoch.to_string()) {
            warn!("couldn't arm wakealarm: {err}");
        }
    }
}

impl Default for SystemRtc {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtc for SystemRtc {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn set_time(&mut self, t: NaiveDateTime) {
        // the host clock is NTP-disciplined; note the skew, don't fight it
        let skew = t.signed_duration_since(self.now()).num_seconds();
        debug!("server time {t}, local skew {skew}s");
    }

    fn set_alarm_at(&mut self, t: NaiveDateTime) {
        self.arm(t);
    }

    fn set_alarm_in_ms(&mut self, ms: u64) {
        let deadline = self.now() + chrono::Duration::milliseconds(ms as i64);
        self.arm(deadline);
    }

    fn alarm_left_ms(&self) -> u64 {
        match self.deadline {
            Some(deadline) => {
                let left = deadline.signed_duration_since(self.now()).num_milliseconds();
                if left > 0 {
                    left as u64
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

/// `/dev/watchdog` feeder. Opening the device starts the timer; from then
/// on the cycle's feeds are load-bearing.
pub struct LinuxWatchdog {
    dev: Option<File>,
}

impl LinuxWatchdog {
    pub fn open() -> Self {
        let dev = OpenOptions::new().write(true).open(WATCHDOG_PATH);
        match dev {
            Ok(dev) => Self { dev: Some(dev) },
            Err(err) => {
                info!("no hardware watchdog ({err}), running without");
                Self { dev: None }
            }
        }
    }
}

impl Watchdog for LinuxWatchdog {
    fn feed(&mut self) {
        if let Some(dev) = self.dev.as_mut() {
            let _ = dev.write_all(b"1");
        }
    }
}

/// Link-state wireless: the host's supplicant owns association, the cycle
/// only polls whether the link is up.
#[derive(Default)]
pub struct HostWireless;

impl Wireless for HostWireless {
    fn scan(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn join(&mut self, ssid: &str, _passphrase: &str) {
        debug!("association to {ssid} is delegated to the supplicant");
    }

    fn is_connected(&self) -> bool {
        fs::read_to_string(LINK_STATE_PATH)
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }
}

/// Reset cause, LED heartbeat and suspend for the host.
pub struct HostSystem {
    cause: ResetCause,
    led: PathBuf,
}

impl HostSystem {
    pub fn new(cause: ResetCause, led: impl Into<PathBuf>) -> Self {
        Self {
            cause,
            led: led.into(),
        }
    }
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new(ResetCause::PowerOn, "/sys/class/leds/ACT/brightness")
    }
}

impl SystemControl for HostSystem {
    fn reset_cause(&self) -> ResetCause {
        self.cause
    }

    fn heartbeat(&mut self, on: bool) {
        let _ = fs::write(&self.led, if on { "1" } else { "0" });
    }

    fn idle(&mut self) {
        std::thread::yield_now();
    }

    fn deep_sleep(&mut self) {
        info!("entering deep sleep");
        if let Err(err) = fs::write(SLEEP_STATE_PATH, "mem") {
            warn!("suspend failed ({err}), exiting instead");
            std::process::exit(0);
        }
    }
}
