//! # Tide Panel Core Library
//!
//! Device logic for a battery-powered e-paper tide panel. The device spends
//! almost all of its life in deep sleep; once per wake episode it checks its
//! power budget, fetches a pre-rendered panel image and a wake schedule from
//! a remote server over WiFi/HTTP, drives the image onto the panel through
//! the controller's command protocol, arms the next wake alarm and goes back
//! to sleep.
//!
//! ## Design Philosophy
//!
//! ### One wake episode, one owner
//! Every resource (serial bus, socket, watchdog, RTC) is created at boot and
//! owned by the [`cycle::WakeCycle`] orchestrator for exactly one episode.
//! Deep sleep does not run destructors, so anything that must be released is
//! released explicitly before sleep is requested.
//!
//! ### Memory Efficiency
//! The target has a small heap and no swap. The HTTP client refuses bodies
//! it cannot bound, the panel image is streamed to the display controller in
//! 250-byte protocol chunks rather than buffered whole, and header parsing
//! works line-by-line.
//!
//! ### The watchdog is the only circuit-breaker
//! There are no software timeouts beyond the transport defaults. Every loop
//! whose duration is not bounded by hardware timing feeds the hardware
//! watchdog; if the device wedges, the watchdog resets it.
//!
//! ## Modules
//! - [`battery`]: raw ADC sample to safety flag and percentage
//! - [`config`]: removable-first configuration loading with fallback
//! - [`epd`]: the panel controller's command/response protocol driver
//! - [`http`]: minimal HTTP/1.0 client with keep-alive and streamed bodies
//! - [`platform`]: traits for the watchdog, RTC/alarm, wireless and system
//! - [`cycle`]: the wake-cycle state machine tying it all together
//! - [`mock`]: in-memory doubles for every hardware-facing trait

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;

// Module declarations
pub mod battery;
pub mod config;
pub mod cycle;
pub mod epd;
pub mod http;
pub mod mock;
pub mod platform;

/// Exact byte size of the pre-rendered panel payload.
///
/// The server renders for one fixed panel; any fetched image whose declared
/// length differs is treated as a failed fetch and never written out.
pub const PANEL_IMAGE_SIZE: usize = 15016;

/// Fallback wake interval in milliseconds, armed whenever the server's
/// schedule is missing or unusable. The device must never sleep without a
/// pending alarm.
pub const FALLBACK_WAKE_MS: u64 = 3_600_000;

/// Wake schedule decoded from the server's metadata document.
///
/// The metadata is a small JSON object whose `wakeup` field holds at least
/// six integers: `[year, month, day, hour, minute, second]`. Extra elements
/// are ignored. Decoding failure is not an error here; the orchestrator
/// arms the [`FALLBACK_WAKE_MS`] alarm instead.
///
/// # Example
/// ```
/// use tide_panel_lib::WakeSchedule;
///
/// let schedule = WakeSchedule::from_json(br#"{"wakeup": [2016, 1, 31, 15, 0, 0]}"#).unwrap();
/// assert_eq!(schedule.next_wake.to_string(), "2016-01-31 15:00:00");
///
/// assert!(WakeSchedule::from_json(b"not json").is_none());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeSchedule {
    /// Absolute wall-clock time of the next wake, server timezone (GMT).
    pub next_wake: NaiveDateTime,
}

#[derive(Deserialize)]
struct Metadata {
    wakeup: Vec<i64>,
}

impl WakeSchedule {
    /// Decode a schedule from the raw metadata body.
    ///
    /// Returns `None` when the document is not JSON, the `wakeup` field is
    /// missing or short, or the six values do not form a real timestamp.
    pub fn from_json(raw: &[u8]) -> Option<Self> {
        let meta: Metadata = serde_json::from_slice(raw).ok()?;
        let f = meta.wakeup;
        if f.len() < 6 {
            return None;
        }
        let date = NaiveDate::from_ymd_opt(f[0] as i32, f[1] as u32, f[2] as u32)?;
        let next_wake = date.and_hms_opt(f[3] as u32, f[4] as u32, f[5] as u32)?;
        Some(WakeSchedule { next_wake })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_decodes_six_fields() {
        let raw = br#"{"wakeup": [2016, 1, 31, 14, 16, 24], "other": "ignored"}"#;
        let schedule = WakeSchedule::from_json(raw).unwrap();
        assert_eq!(schedule.next_wake.to_string(), "2016-01-31 14:16:24");
    }

    #[test]
    fn schedule_ignores_trailing_fields() {
        let raw = br#"{"wakeup": [2016, 1, 31, 14, 16, 24, 0, 99]}"#;
        assert!(WakeSchedule::from_json(raw).is_some());
    }

    #[test]
    fn schedule_rejects_short_or_bad_input() {
        assert!(WakeSchedule::from_json(br#"{"wakeup": [2016, 1, 31]}"#).is_none());
        assert!(WakeSchedule::from_json(br#"{"wakeup": [2016, 13, 31, 0, 0, 0]}"#).is_none());
        assert!(WakeSchedule::from_json(b"{}").is_none());
        assert!(WakeSchedule::from_json(b"\x00\x01").is_none());
    }
}
