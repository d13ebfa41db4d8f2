//! # Wake Cycle Orchestrator
//!
//! The top-level state machine for one wake episode:
//!
//! ```text
//! BatteryCheck -> DisplaySelfTest -> ConfigLoad -> NetworkJoin
//!   -> Telemetry/MetadataFetch -> ImageFetch -> Render
//!   -> ScheduleNextWake -> Sleep
//! ```
//!
//! Every failure maps to one of a small set of user-visible states, each
//! backed by a pre-rendered notice image, and every path ends in either a
//! scheduled wake-and-sleep or a deliberate stay-awake idle loop. The
//! device must never power off without a pending alarm or an explicit
//! intent to stay up for intervention.
//!
//! The watchdog is fed at every state transition and inside every loop
//! whose duration hardware timing does not bound: the network scan loop,
//! the chunked framebuffer upload, the chunked body read.

use log::{error, info, warn};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::battery::{AdcChannel, BatteryGauge, BatteryReading};
use crate::config::{ConfigError, ConfigOrigin, ConfigStore, DeviceConfig};
use crate::epd::{self, EpdError, EpdLink, InputPin, OutputPin, SerialBus};
use crate::http::{Body, Dialer, HttpClient, HttpError};
use crate::platform::{Rtc, SystemControl, Watchdog, Wireless};
use crate::{WakeSchedule, FALLBACK_WAKE_MS, PANEL_IMAGE_SIZE};

/// Pre-rendered notice images under the image directory.
const IMG_LOW_BATTERY: &str = "low_battery.bin";
const IMG_NO_CONFIG: &str = "no_config.bin";
const IMG_NO_SERVER: &str = "no_server.bin";

/// Upper bound for the metadata document.
const METADATA_MAX: u32 = 1024;

/// Pause between scan passes while hunting for a known network.
const SCAN_RETRY: Duration = Duration::from_millis(2000);

/// How long the fast-blink fault notice holds before giving up the cycle.
const FAULT_HOLD: Duration = Duration::from_millis(15_000);

/// Settle time before the long framebuffer write. Makes the panel write
/// noticeably more reliable after the radio has been busy.
const PANEL_SETTLE: Duration = Duration::from_millis(1000);

/// How one wake episode ended. [`WakeCycle::run_to_sleep`] maps this to
/// the terminal action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Image rendered, next wake scheduled from the server's metadata.
    Completed,
    /// Woken with time still left on the alarm; panel refreshed only.
    RefreshOnly,
    /// Battery below operating voltage; notice shown, short wake armed.
    LowBattery,
    /// Panel self-test failed; the device should stay up for intervention.
    DisplayFault,
    /// No usable configuration on any medium; stay awake for provisioning.
    NoConfig,
    /// Remote fetch failed; notice shown, fallback wake armed.
    FetchFailed,
}

/// Everything that can go wrong between the server and the panel. One
/// failure policy covers the lot: show the can't-connect notice and arm
/// the fallback alarm.
#[derive(Error, Debug)]
enum RemoteError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Epd(#[from] EpdError),
    #[error("wrong data size for image: {0}")]
    WrongImageSize(u32),
}

/// The platform services the cycle borrows for its lifetime, as explicit
/// owned resources rather than globals.
pub struct Platform {
    pub rtc: Box<dyn Rtc>,
    pub wdt: Box<dyn Watchdog>,
    pub wireless: Box<dyn Wireless>,
    pub system: Box<dyn SystemControl>,
}

/// The wake-cycle orchestrator. Owns every device resource for exactly
/// one episode.
pub struct WakeCycle<A, BUS, EN, BUSY, D>
where
    A: AdcChannel,
    BUS: SerialBus,
    EN: OutputPin,
    BUSY: InputPin,
    D: Dialer + Clone,
{
    gauge: BatteryGauge<A>,
    epd: EpdLink<BUS, EN, BUSY>,
    store: ConfigStore,
    dialer: D,
    rtc: Box<dyn Rtc>,
    wdt: Box<dyn Watchdog>,
    wireless: Box<dyn Wireless>,
    system: Box<dyn SystemControl>,
    image_dir: PathBuf,
    /// Set when the user/debug line woke the device instead of the alarm.
    user_wake: bool,
    /// Retry a failed panel upload once. Off by default; the fallback
    /// alarm already bounds the damage of a bad transfer.
    retry_upload: bool,
    fault_hold: Duration,
}

impl<A, BUS, EN, BUSY, D> WakeCycle<A, BUS, EN, BUSY, D>
where
    A: AdcChannel,
    BUS: SerialBus,
    EN: OutputPin,
    BUSY: InputPin,
    D: Dialer + Clone,
{
    pub fn new(
        gauge: BatteryGauge<A>,
        epd: EpdLink<BUS, EN, BUSY>,
        store: ConfigStore,
        dialer: D,
        platform: Platform,
        image_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            gauge,
            epd,
            store,
            dialer,
            rtc: platform.rtc,
            wdt: platform.wdt,
            wireless: platform.wireless,
            system: platform.system,
            image_dir: image_dir.into(),
            user_wake: false,
            retry_upload: false,
            fault_hold: FAULT_HOLD,
        }
    }

    pub fn with_user_wake(mut self, user_wake: bool) -> Self {
        self.user_wake = user_wake;
        self
    }

    pub fn with_upload_retry(mut self, retry: bool) -> Self {
        self.retry_upload = retry;
        self
    }

    /// Shrink the fault-notice hold. Mostly for tests.
    pub fn with_fault_hold(mut self, hold: Duration) -> Self {
        self.fault_hold = hold;
        self
    }

    /// Run one wake episode and report how it ended. Does not sleep; see
    /// [`Self::run_to_sleep`].
    pub fn run(&mut self) -> CycleOutcome {
        info!("time left on the alarm: {}ms", self.rtc.alarm_left_ms());
        self.wdt.feed();

        let battery = self.gauge.sample();

        if let Err(err) = self.epd.enable() {
            error!("can't power up display: {err}");
            return self.display_fault();
        }

        if !battery.safe() {
            warn!("battery voltage low ({} raw), turning off", battery.raw);
            self.wdt.feed();
            self.show_notice(IMG_LOW_BATTERY);
            self.rtc.set_alarm_in_ms(FALLBACK_WAKE_MS);
            return CycleOutcome::LowBattery;
        }
        info!("battery value: {}%", battery.percent());

        // display self-test: one sensor read proves the link is alive
        let screen_temp = match self.epd.get_sensor_reading() {
            Ok(temp) => temp,
            Err(err) => {
                error!("can't communicate with display: {err}");
                return self.display_fault();
            }
        };

        if self.rtc.alarm_left_ms() > 0 {
            info!("woken up but the timer is still running, refreshing screen only");
            if let Err(err) = self.epd.refresh(epd::DEFAULT_SLOT, true) {
                warn!("refresh failed: {err}");
            }
            self.wdt.feed();
            return CycleOutcome::RefreshOnly;
        }

        let cfg = match self.store.load() {
            Ok(cfg) => cfg,
            Err(err) => return self.no_config(&err),
        };
        self.wdt.feed();

        self.join_network(&cfg);

        match self.fetch_and_render(&cfg, battery, screen_temp) {
            Ok(()) => {
                if cfg.source == ConfigOrigin::Secondary {
                    // a working card config graduates to internal storage
                    info!("transferring working config");
                    match self.store.transfer() {
                        Ok(()) => info!("config transfer SUCCESS"),
                        Err(err) => warn!("config transfer failed: {err}"),
                    }
                }
                CycleOutcome::Completed
            }
            Err(err) => {
                error!("failed to get remote info: {err}");
                self.show_notice(IMG_NO_SERVER);
                self.rtc.set_alarm_in_ms(FALLBACK_WAKE_MS);
                CycleOutcome::FetchFailed
            }
        }
    }

    /// Run one episode, then take the terminal action: deep sleep with a
    /// pending alarm, or stay awake where the failure policy demands it.
    ///
    /// Deep sleep does not run destructors, so the panel is powered down
    /// and handles released explicitly first.
    pub fn run_to_sleep(&mut self) {
        match self.run() {
            CycleOutcome::NoConfig => {
                // stay reachable until someone uploads a configuration
                info!("staying awake for configuration");
                loop {
                    thread::sleep(Duration::from_millis(10));
                    self.wdt.feed();
                }
            }
            CycleOutcome::DisplayFault => {
                info!("display fault, staying awake for intervention");
                return;
            }
            _ => {}
        }

        info!("going to sleep, waking in {}ms", self.rtc.alarm_left_ms());

        if let Err(err) = self.epd.disable() {
            warn!("couldn't power down panel: {err}");
        }
        self.system.heartbeat(false);

        if self.user_wake {
            info!("debug wake: staying awake");
            return;
        }
        self.system.deep_sleep();
    }

    // -- failure states --

    fn display_fault(&mut self) -> CycleOutcome {
        // signal visually; there is no panel to write a notice to
        self.system.heartbeat(true);
        thread::sleep(self.fault_hold);
        CycleOutcome::DisplayFault
    }

    fn no_config(&mut self, err: &ConfigError) -> CycleOutcome {
        error!("failed to load config: {err}");
        self.show_notice(IMG_NO_CONFIG);
        // one scan pass for debug visibility before settling in
        let visible = self.wireless.scan();
        info!("{} networks visible while unconfigured", visible.len());
        self.wdt.feed();
        CycleOutcome::NoConfig
    }

    // -- the happy path --

    /// Scan until a known SSID shows up, then associate. No retry cap:
    /// the device waits as long as it takes, and the watchdog is the only
    /// circuit-breaker.
    fn join_network(&mut self, cfg: &DeviceConfig) {
        let known: Vec<&str> = cfg.wifi.iter().map(|n| n.ssid.as_str()).collect();
        info!("starting WLAN, attempting to connect to {}", known.join(","));

        loop {
            if self.wireless.is_connected() {
                break;
            }
            let visible = self.wireless.scan();
            let hit = visible
                .iter()
                .find_map(|ssid| cfg.passphrase_for(ssid).map(|pass| (ssid.clone(), pass.to_string())));
            if let Some((ssid, passphrase)) = hit {
                info!("connecting to {ssid}");
                self.wdt.feed();
                self.wireless.join(&ssid, &passphrase);
                while !self.wireless.is_connected() {
                    self.system.idle();
                }
                continue;
            }
            self.wdt.feed();
            thread::sleep(SCAN_RETRY);
        }
        info!("network joined");
    }

    fn fetch_and_render(
        &mut self,
        cfg: &DeviceConfig,
        battery: BatteryReading,
        screen_temp: u16,
    ) -> Result<(), RemoteError> {
        info!("connecting to server {}:{}", cfg.host, cfg.port);
        let mut client = HttpClient::new(cfg.host.clone(), cfg.port, self.dialer.clone());
        self.wdt.feed();

        let cause = if self.user_wake {
            "user"
        } else {
            self.system.reset_cause().as_str()
        };
        info!("reset cause: {cause}");

        if !cfg.upload_path.is_empty() {
            client.post(
                &cfg.upload_path,
                &[
                    ("battery", battery.percent().to_string()),
                    ("reset", cause.to_string()),
                    ("screen", screen_temp.to_string()),
                ],
            )?;
        }

        info!("fetching metadata from {}", cfg.metadata_path);
        let metadata = client.get_quick(&cfg.metadata_path, "json", METADATA_MAX)?;

        // the server's Date header doubles as the device's time source (GMT)
        self.schedule_next_wake(client.last_fetch_time(), &metadata);
        self.wdt.feed();

        info!("fetching image from {}", cfg.image_path);
        let first = self.fetch_image_to_panel(&mut client, cfg);
        match first {
            Err(RemoteError::Epd(err)) if self.retry_upload => {
                warn!("panel write failed ({err}), retrying once");
                self.fetch_image_to_panel(&mut client, cfg)
            }
            other => other,
        }
    }

    /// Erase the slot, stream the image from the server straight into the
    /// panel, refresh. The image never exists in memory whole.
    fn fetch_image_to_panel(
        &mut self,
        client: &mut HttpClient<D>,
        cfg: &DeviceConfig,
    ) -> Result<(), RemoteError> {
        self.epd.erase_framebuffer(epd::DEFAULT_SLOT)?;
        self.wdt.feed();

        let mut body = client.get_stream(&cfg.image_path, "octet-stream", PANEL_IMAGE_SIZE as u32)?;
        if body.declared_len() != PANEL_IMAGE_SIZE {
            let length = body.declared_len() as u32;
            drop(body);
            client.close();
            return Err(RemoteError::WrongImageSize(length));
        }
        self.wdt.feed();

        thread::sleep(PANEL_SETTLE);
        self.wdt.feed();
        info!("uploading to display");
        match self.stream_to_panel(&mut body) {
            Ok(()) => {
                body.finish();
                Ok(())
            }
            Err(err) => {
                drop(body);
                client.close();
                Err(err)
            }
        }
    }

    fn stream_to_panel(&mut self, body: &mut Body<'_, D>) -> Result<(), RemoteError> {
        let mut remaining = body.declared_len();
        let mut chunk = [0u8; epd::UPLOAD_CHUNK];
        while remaining > 0 {
            let want = remaining.min(epd::UPLOAD_CHUNK);
            body.read_exact(&mut chunk[..want])
                .map_err(|err| RemoteError::Http(HttpError::Receive(err)))?;
            self.epd.upload_chunk(&chunk[..want], epd::DEFAULT_SLOT)?;
            self.wdt.feed();
            remaining -= want;
        }
        self.epd.refresh(epd::DEFAULT_SLOT, true)?;
        Ok(())
    }

    /// Arm the next wake from the fetched metadata, falling back to one
    /// hour when the schedule is unusable. The device never sleeps without
    /// a pending alarm.
    fn schedule_next_wake(&mut self, server_time: Option<chrono::NaiveDateTime>, metadata: &[u8]) {
        if let Some(t) = server_time {
            self.rtc.set_time(t);
        }

        match WakeSchedule::from_json(metadata) {
            Some(schedule) => {
                info!("setting alarm for {}", schedule.next_wake);
                self.rtc.set_alarm_at(schedule.next_wake);
                if self.rtc.alarm_left_ms() == 0 {
                    warn!("alarm failed, setting for +1 hour");
                    self.rtc.set_alarm_in_ms(FALLBACK_WAKE_MS);
                }
            }
            None => {
                warn!("can't decode wake schedule, setting for +1 hour");
                self.rtc.set_alarm_in_ms(FALLBACK_WAKE_MS);
            }
        }
    }

    /// Drive a pre-rendered notice image onto the panel. Best-effort: a
    /// notice failure must not mask the state that triggered it.
    fn show_notice(&mut self, name: &str) {
        info!("displaying {name}");
        let path = self.image_dir.join(name);
        let img = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("can't read notice image {}: {err}", path.display());
                return;
            }
        };
        if let Err(err) = self
            .epd
            .upload_whole_image(&img, epd::DEFAULT_SLOT, self.wdt.as_mut())
        {
            error!("can't write notice to panel: {err}");
            return;
        }
        if let Err(err) = self.epd.refresh(epd::DEFAULT_SLOT, true) {
            error!("can't refresh notice: {err}");
        }
    }
}
