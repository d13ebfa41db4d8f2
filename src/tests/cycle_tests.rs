//! Wake-cycle scenarios: the orchestrator run end-to-end against mocks,
//! with the wire, the panel bus, the RTC and the watchdog all observable.

use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use tide_panel_lib::battery::{BatteryGauge, MINIMUM};
use tide_panel_lib::config::ConfigStore;
use tide_panel_lib::cycle::{CycleOutcome, Platform, WakeCycle};
use tide_panel_lib::epd::EpdLink;
use tide_panel_lib::mock::{
    fixed_reply, status_reply, MockAdc, MockBusyLine, MockOutputPin, MockRtc, MockSystem,
    MockWatchdog, MockWire, MockWireless, ScriptedBus,
};
use tide_panel_lib::platform::Rtc;
use tide_panel_lib::{FALLBACK_WAKE_MS, PANEL_IMAGE_SIZE};

const CONFIG: &str = "Host: www.example.com\n\
                      WiFi: MySSID\n\
                      Pass: secret\n\
                      Image: /image.bin\n\
                      Meta: /metadata.json\n\
                      Up: /upload.php\n";

const METADATA: &[u8] = br#"{"wakeup": [2016, 2, 1, 9, 30, 0]}"#;

/// A complete device on the bench: every collaborator mocked and
/// observable after the cycle consumes it.
struct Rig {
    #[allow(dead_code)]
    dir: TempDir,
    bus: ScriptedBus,
    wire: MockWire,
    rtc: MockRtc,
    wdt: MockWatchdog,
    wireless: MockWireless,
    system: MockSystem,
    cycle: WakeCycle<MockAdc, ScriptedBus, MockOutputPin, MockBusyLine, MockWire>,
}

fn rig(battery_raw: u16, config: Option<&str>) -> Rig {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("imgs")).unwrap();
    for name in ["low_battery.bin", "no_config.bin", "no_server.bin"] {
        fs::write(dir.path().join("imgs").join(name), vec![0u8; 500]).unwrap();
    }
    if let Some(text) = config {
        fs::create_dir_all(dir.path().join("sd")).unwrap();
        fs::write(dir.path().join("sd/config.txt"), text).unwrap();
    }

    let bus = ScriptedBus::new();
    bus.auto_status(0x9000);
    let wire = MockWire::new();
    let rtc = MockRtc::new();
    let wdt = MockWatchdog::new();
    let wireless = MockWireless::new();
    wireless.set_visible(&["MySSID", "SomeoneElse"]);
    let system = MockSystem::new();

    let platform = Platform {
        rtc: Box::new(rtc.clone()),
        wdt: Box::new(wdt.clone()),
        wireless: Box::new(wireless.clone()),
        system: Box::new(system.clone()),
    };
    let cycle = WakeCycle::new(
        BatteryGauge::new(MockAdc::new(battery_raw)),
        EpdLink::new(bus.clone(), MockOutputPin::new(), MockBusyLine::ready()).with_poll_budget(8),
        ConfigStore::new(dir.path().join("flash/config.txt"), dir.path().join("sd/config.txt")),
        wire.clone(),
        platform,
        dir.path().join("imgs"),
    )
    .with_fault_hold(Duration::ZERO);

    Rig {
        dir,
        bus,
        wire,
        rtc,
        wdt,
        wireless,
        system,
        cycle,
    }
}

fn response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = format!(
        "HTTP/1.0 200 OK\r\n\
         Date: Sun, 31 Jan 2016 14:16:24 GMT\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Response head only, declaring a body that never needs to arrive.
fn header_only(content_type: &str, declared: usize) -> Vec<u8> {
    format!(
        "HTTP/1.0 200 OK\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {declared}\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Frames that fed framebuffer data (instruction 0x20, P1 1).
fn upload_frames(bus: &ScriptedBus) -> usize {
    bus.frames()
        .iter()
        .filter(|f| f.len() >= 3 && f[0] == 0x20 && f[1] == 1)
        .count()
}

#[test]
fn full_cycle_renders_schedules_and_migrates_config() {
    let mut rig = rig(MINIMUM + 400, Some(CONFIG));
    rig.wire.push_response(&response("text/html", b"ok")); // telemetry POST
    rig.wire.push_response(&response("application/json", METADATA));
    rig.wire
        .push_response(&response("application/octet-stream", &vec![0xa5u8; PANEL_IMAGE_SIZE]));

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::Completed);

    // one socket served all three exchanges
    assert_eq!(rig.wire.dials(), 1);
    let written = String::from_utf8(rig.wire.written()).unwrap();
    assert!(written.contains("POST /upload.php HTTP/1.0"));
    assert!(written.contains("reset=sleep"));
    assert!(written.contains("GET /metadata.json HTTP/1.0"));
    assert!(written.contains("GET /image.bin HTTP/1.0"));

    // the known network was joined with its passphrase
    assert_eq!(rig.wireless.joins(), vec![("MySSID".into(), "secret".into())]);

    // clock came from the Date header, alarm from the metadata
    assert_eq!(rig.rtc.time_set_to().unwrap().to_string(), "2016-01-31 14:16:24");
    assert_eq!(rig.rtc.alarm_at().unwrap().to_string(), "2016-02-01 09:30:00");
    assert!(rig.rtc.alarm_left_ms() > 0);

    // the image crossed the bus in 250-byte protocol chunks
    assert_eq!(upload_frames(&rig.bus), PANEL_IMAGE_SIZE.div_ceil(250));
    let frames = rig.bus.frames();
    assert_eq!(&frames.last().unwrap()[..3], &[0x24, 1, 0]); // full-flash refresh

    // the watchdog was fed throughout the transfer
    assert!(rig.wdt.feeds() > PANEL_IMAGE_SIZE / 250);

    // the card config graduated to internal storage
    assert!(rig.dir.path().join("flash/config.txt").exists());
    assert!(!rig.dir.path().join("sd/config.txt").exists());
}

#[test]
fn unsafe_battery_skips_network_and_shows_notice() {
    let mut rig = rig(MINIMUM - 1, Some(CONFIG));

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::LowBattery);

    // no network traffic of any kind
    assert_eq!(rig.wire.dials(), 0);
    assert_eq!(rig.wireless.scans(), 0);

    // the low-battery notice went to the panel (500 bytes = 2 chunks)
    assert_eq!(upload_frames(&rig.bus), 2);

    // a short default wake is pending
    assert_eq!(rig.rtc.alarm_in_ms(), Some(FALLBACK_WAKE_MS));
}

#[test]
fn unsafe_battery_cycle_ends_in_a_sleep_request() {
    let mut rig = rig(MINIMUM - 1, Some(CONFIG));

    rig.cycle.run_to_sleep();

    assert_eq!(rig.system.sleep_requests(), 1);
    assert_eq!(rig.system.heartbeat_on(), Some(false));
    assert!(rig.rtc.alarm_left_ms() > 0);
}

#[test]
fn wrong_image_size_arms_fallback_alarm_regardless_of_metadata() {
    let config = CONFIG.replace("Up: /upload.php\n", "");
    let mut rig = rig(MINIMUM + 400, Some(&config));
    rig.wire.push_response(&response("application/json", METADATA));
    rig.wire.push_response(&header_only("application/octet-stream", 14_000));

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::FetchFailed);

    // metadata armed its alarm first, but the failure overrode it
    assert_eq!(rig.rtc.alarm_in_ms(), Some(FALLBACK_WAKE_MS));

    // the can't-connect notice was the last thing rendered
    let frames = rig.bus.frames();
    assert_eq!(&frames.last().unwrap()[..3], &[0x24, 1, 0]);
}

#[test]
fn undecodable_metadata_still_completes_with_fallback_alarm() {
    let config = CONFIG.replace("Up: /upload.php\n", "");
    let mut rig = rig(MINIMUM + 400, Some(&config));
    rig.wire.push_response(&response("application/json", b"{}"));
    rig.wire
        .push_response(&response("application/octet-stream", &vec![0u8; PANEL_IMAGE_SIZE]));

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::Completed);
    assert_eq!(rig.rtc.alarm_at(), None);
    assert_eq!(rig.rtc.alarm_in_ms(), Some(FALLBACK_WAKE_MS));
}

#[test]
fn pending_alarm_refreshes_screen_without_network() {
    let mut rig = rig(MINIMUM + 400, Some(CONFIG));
    rig.rtc.set_alarm_left_ms(50_000);

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::RefreshOnly);

    assert_eq!(rig.wire.dials(), 0);
    assert_eq!(rig.wireless.scans(), 0);

    // sensor self-test then a bare refresh, nothing else on the bus
    let frames = rig.bus.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0][0], 0xe5);
    assert_eq!(&frames[1][..3], &[0x24, 1, 0]);
}

#[test]
fn missing_config_ends_in_stay_awake_state() {
    let mut rig = rig(MINIMUM + 400, None);

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::NoConfig);

    // the notice went up and a debug scan ran, but no server contact
    assert!(upload_frames(&rig.bus) > 0);
    assert_eq!(rig.wireless.scans(), 1);
    assert_eq!(rig.wire.dials(), 0);
}

#[test]
fn failed_self_test_signals_visually_and_aborts() {
    let mut rig = rig(MINIMUM + 400, Some(CONFIG));
    // the sensor read comes back "instruction not supported"
    rig.bus.push_reply(fixed_reply(&[0, 0], 0x6d00));

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::DisplayFault);

    assert_eq!(rig.system.heartbeat_on(), Some(true));
    assert_eq!(rig.wire.dials(), 0);
    assert_eq!(rig.wireless.scans(), 0);
}

#[test]
fn user_wake_reports_user_reset_cause() {
    let mut rig = rig(MINIMUM + 400, Some(CONFIG));
    rig.cycle = rig.cycle.with_user_wake(true);
    rig.wire.push_response(&response("text/html", b"ok"));
    rig.wire.push_response(&response("application/json", METADATA));
    rig.wire
        .push_response(&response("application/octet-stream", &vec![0u8; PANEL_IMAGE_SIZE]));

    assert_eq!(rig.cycle.run(), CycleOutcome::Completed);
    let written = String::from_utf8(rig.wire.written()).unwrap();
    assert!(written.contains("reset=user"));
}

#[test]
fn panel_write_failure_retries_once_when_policy_enabled() {
    let config = CONFIG.replace("Up: /upload.php\n", "");
    let mut rig = rig(MINIMUM + 400, Some(&config));
    rig.cycle = rig.cycle.with_upload_retry(true);

    rig.wire.push_response(&response("application/json", METADATA));
    rig.wire
        .push_response(&response("application/octet-stream", &vec![0u8; PANEL_IMAGE_SIZE]));

    // the first erase dies on the bus; the retry pass is clean
    rig.bus.push_reply(fixed_reply(&[0, 0], 0x9000)); // sensor self-test
    rig.bus.push_reply(status_reply(0x6a84)); // erase: slot overrun

    let outcome = rig.cycle.run();
    assert_eq!(outcome, CycleOutcome::Completed);

    // exactly one full upload went through, on the retry pass
    assert_eq!(upload_frames(&rig.bus), PANEL_IMAGE_SIZE.div_ceil(250));
    assert_eq!(rig.wire.dials(), 1);
}
