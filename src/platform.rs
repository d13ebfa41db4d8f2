//! # Platform Collaborators
//!
//! The hardware services the wake cycle depends on but does not implement:
//! the watchdog timer, the real-time clock and its wake alarm, the wireless
//! interface, and miscellaneous system control. Each is a trait so the
//! orchestrator can be exercised end-to-end against the doubles in
//! [`crate::mock`]; the binary supplies the real implementations.
//!
//! These were module-level singletons in earlier firmware; here each is an
//! explicit owned resource handed to the orchestrator at construction and
//! released before deep sleep.

use chrono::NaiveDateTime;

/// Hardware watchdog. Failing to feed it within its timeout resets the
/// device; that reset is the system's only timeout mechanism.
pub trait Watchdog {
    fn feed(&mut self);
}

impl<T: Watchdog + ?Sized> Watchdog for Box<T> {
    fn feed(&mut self) {
        (**self).feed()
    }
}

/// Why the device booted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetCause {
    PowerOn,
    HardReset,
    WatchdogReset,
    DeepSleepWake,
    SoftReset,
}

impl ResetCause {
    /// Short token reported in telemetry uploads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetCause::PowerOn => "power",
            ResetCause::HardReset => "hard",
            ResetCause::WatchdogReset => "wdt",
            ResetCause::DeepSleepWake => "sleep",
            ResetCause::SoftReset => "soft",
        }
    }
}

/// Real-time clock with a single wake alarm register.
///
/// The alarm register is the only state that survives deep sleep besides
/// the filesystem.
pub trait Rtc {
    fn now(&self) -> NaiveDateTime;

    /// Set the wall clock, normally from the server's `Date` header (GMT).
    fn set_time(&mut self, t: NaiveDateTime);

    /// Arm the wake alarm for an absolute time. Arming a time that is
    /// already past leaves nothing pending; check [`Self::alarm_left_ms`].
    fn set_alarm_at(&mut self, t: NaiveDateTime);

    /// Arm the wake alarm relative to now.
    fn set_alarm_in_ms(&mut self, ms: u64);

    /// Milliseconds until the pending alarm fires; 0 when nothing pending.
    fn alarm_left_ms(&self) -> u64;
}

/// Station-mode wireless interface.
pub trait Wireless {
    /// One scan pass; returns the visible SSIDs.
    fn scan(&mut self) -> Vec<String>;

    /// Begin associating. Completion is observed via [`Self::is_connected`].
    fn join(&mut self, ssid: &str, passphrase: &str);

    fn is_connected(&self) -> bool;
}

/// Everything else the cycle needs from the platform.
pub trait SystemControl {
    fn reset_cause(&self) -> ResetCause;

    /// Drive the status LED: steady blink when `true`, dark when `false`.
    fn heartbeat(&mut self, on: bool);

    /// Yield the CPU while busy-waiting on external state.
    fn idle(&mut self);

    /// Request deep sleep. On real hardware this does not return; the
    /// device restarts from firmware boot when the alarm fires. Test
    /// doubles record the request and return.
    fn deep_sleep(&mut self);
}
