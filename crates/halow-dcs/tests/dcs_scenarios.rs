//! End-to-end controller scenarios over scripted backends.
//!
//! These tests build a real `Dcs` instance and engine, replacing only the
//! transports: a scripted AP control socket, a scripted vendor command
//! channel, and an nl80211 stand-in whose event queue the other mocks
//! feed. Measurement timing is collapsed (`sec_per_scan = 0`) so rounds
//! run as fast as the rendezvous allows.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use halow_dcs::{Backends, Dcs};
use halow_dcs_backend::commands::{
    encode_available_channels, ChannelInfo, OcsDoneEvent, CMD_GET_AVAILABLE_CHANNELS,
};
use halow_dcs_backend::nl80211::{
    NL80211_ATTR_VENDOR_DATA, NL80211_ATTR_VENDOR_ID, NL80211_ATTR_VENDOR_SUBCMD,
    NL80211_ATTR_WIPHY_FREQ, NL80211_CMD_CH_SWITCH_NOTIFY, NL80211_CMD_VENDOR,
};
use halow_dcs_backend::vendor::{VENDOR_ATTR_DATA, VENDOR_EVENT_OCS_DONE, VENDOR_OUI};
use halow_dcs_core::config::{
    AlgoType, BackendsConfig, Config, DatalogConfig, DcsConfig, EwmaConfig, HostapdConfig,
    ReplayConfig, SinkConfig,
};
use halow_dcs_core::{Backend, BackendError, DataItem, ItemList, Key};
use halow_dcs_engine::{Engine, HaltSignal};

// ---------------------------------------------------------------------------
// Event fabrication
// ---------------------------------------------------------------------------

type EventQueue = Arc<Mutex<VecDeque<ItemList>>>;

fn ocs_done_event(metric: u8) -> ItemList {
    let payload = OcsDoneEvent {
        metric,
        noise: -90,
        time_listen_us: 100_000,
        time_rx_us: 20_000,
    }
    .encode();

    let mut data = DataItem::with_bytes(NL80211_ATTR_VENDOR_DATA, payload.clone());
    data.children = vec![DataItem::with_bytes(VENDOR_ATTR_DATA, payload)];

    let mut event = DataItem::new(NL80211_CMD_VENDOR);
    event.children = vec![
        DataItem::with_u32(NL80211_ATTR_VENDOR_ID, VENDOR_OUI),
        DataItem::with_u32(NL80211_ATTR_VENDOR_SUBCMD, VENDOR_EVENT_OCS_DONE),
        data,
    ];
    vec![event]
}

fn switch_notify_event(freq_mhz: u32) -> ItemList {
    let mut event = DataItem::new(NL80211_CMD_CH_SWITCH_NOTIFY);
    event.children = vec![DataItem::with_u32(NL80211_ATTR_WIPHY_FREQ, freq_mhz)];
    vec![event]
}

// ---------------------------------------------------------------------------
// Mock backends
// ---------------------------------------------------------------------------

/// nl80211 stand-in: only pumps the shared event queue.
struct MockNl80211 {
    events: EventQueue,
}

impl Backend for MockNl80211 {
    fn name(&self) -> &'static str {
        "nl80211"
    }

    fn pump_async(&self, _timeout: Duration) -> Result<Option<ItemList>, BackendError> {
        let next = self.events.lock().pop_front();
        if next.is_none() {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(next)
    }
}

/// What the scripted AP currently reports over `STATUS`.
#[derive(Clone, Copy)]
struct ApReport {
    s1g_freq: i64,
    s1g_bw: u8,
    freq_5g: u32,
}

/// Scripted AP control socket.
struct MockHostapd {
    report: Mutex<ApReport>,
    chan_switch_count: AtomicUsize,
    /// Hook run on every accepted `CHAN_SWITCH`; receives the mock itself
    /// so it can flip the report and queue the completion event.
    on_chan_switch: Box<dyn Fn(&MockHostapd) + Send + Sync>,
}

impl MockHostapd {
    fn new(report: ApReport, on_chan_switch: Box<dyn Fn(&MockHostapd) + Send + Sync>) -> Self {
        Self {
            report: Mutex::new(report),
            chan_switch_count: AtomicUsize::new(0),
            on_chan_switch,
        }
    }
}

impl Backend for MockHostapd {
    fn name(&self) -> &'static str {
        "hostapd"
    }

    fn submit_blocking(&self, request: &ItemList) -> Result<ItemList, BackendError> {
        let line = request
            .first()
            .and_then(DataItem::value_str)
            .ok_or_else(|| BackendError::protocol("hostapd", "empty request"))?;

        if line == "STATUS" {
            let report = *self.report.lock();
            return Ok(vec![
                DataItem::with_str("state", "ENABLED"),
                DataItem::with_str("freq", &report.freq_5g.to_string()),
                DataItem::with_str("s1g_freq", &report.s1g_freq.to_string()),
                DataItem::with_str("s1g_bw", &report.s1g_bw.to_string()),
                DataItem::with_str("s1g_prim_chwidth", "1"),
                DataItem::with_str("s1g_prim_1mhz_chan_index", "0"),
                DataItem::with_str("beacon_int", "100"),
                DataItem::with_str("dtim_period", "1"),
            ]);
        }

        if line.starts_with("CHAN_SWITCH ") {
            self.chan_switch_count.fetch_add(1, Ordering::SeqCst);
            (self.on_chan_switch)(self);
            return Ok(vec![DataItem::new("OK")]);
        }

        Err(BackendError::protocol(
            "hostapd",
            format!("unexpected command: {line}"),
        ))
    }
}

/// Scripted vendor command channel. Off-channel scan results are pushed
/// onto the nl80211 event queue, the way the real driver reports them.
struct MockVendor {
    channels: Vec<ChannelInfo>,
    events: EventQueue,
    /// Per-frequency raw metric; a missing entry fails the request.
    metrics: HashMap<u32, u8>,
    ocs_requests: Mutex<HashMap<u32, usize>>,
}

impl MockVendor {
    fn ocs_request_count(&self, freq_khz: u32) -> usize {
        self.ocs_requests.lock().get(&freq_khz).copied().unwrap_or(0)
    }
}

impl Backend for MockVendor {
    fn name(&self) -> &'static str {
        "vendor"
    }

    fn submit_blocking(&self, request: &ItemList) -> Result<ItemList, BackendError> {
        let record = request
            .first()
            .ok_or_else(|| BackendError::protocol("vendor", "empty batch"))?;
        let message_id = match &record.key {
            Key::U32(message_id) => *message_id,
            Key::Str(_) => return Err(BackendError::protocol("vendor", "unkeyed record")),
        };

        if message_id == u32::from(CMD_GET_AVAILABLE_CHANNELS) {
            return Ok(vec![DataItem::with_bytes(
                message_id,
                encode_available_channels(&self.channels),
            )]);
        }

        // OCS request: record header (6 bytes) + subcmd (4) + freq_hz (4).
        let body = record
            .value_bytes()
            .ok_or_else(|| BackendError::protocol("vendor", "record carries no body"))?;
        let freq_hz = u32::from_le_bytes(body[10..14].try_into().expect("sized"));
        let freq_khz = freq_hz / 1000;
        *self.ocs_requests.lock().entry(freq_khz).or_insert(0) += 1;

        let Some(&metric) = self.metrics.get(&freq_khz) else {
            return Err(BackendError::CommandFailed {
                command: message_id,
                status: -22,
            });
        };
        self.events.lock().push_back(ocs_done_event(metric));
        Ok(vec![DataItem::with_bytes(message_id, Vec::new())])
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn ch(freq_khz: u32, s1g: u8, bw: u8) -> ChannelInfo {
    ChannelInfo {
        frequency_khz: freq_khz,
        channel_s1g: s1g,
        bandwidth_mhz: bw,
    }
}

/// Two scannable 4 MHz channels plus the 1 MHz channels their primaries
/// land on.
fn permitted_channels() -> Vec<ChannelInfo> {
    vec![
        ch(915_500, 37, 4),
        ch(919_500, 45, 4),
        ch(914_000, 34, 1),
        ch(918_000, 42, 1),
    ]
}

fn ewma_config(datalog_root: &Path, rounds_for_csa: u32) -> Config {
    let mut sinks = HashMap::new();
    sinks.insert("dcs".to_owned(), SinkConfig { enabled: true });
    Config {
        interface_name: "wlan0".to_owned(),
        backends: BackendsConfig {
            hostapd: HostapdConfig {
                control_path: "/var/run/hostapd".into(),
            },
        },
        dcs: DcsConfig {
            trigger_csa: true,
            dtims_for_csa: 3,
            algo_type: AlgoType::Ewma,
            ewma: Some(EwmaConfig {
                ewma_alpha: 100,
                threshold_percentage: 0,
                rounds_for_csa,
                sec_per_scan: 0,
                sec_per_round: 0,
            }),
            sample_and_hold: None,
            test: ReplayConfig::default(),
        },
        datalog: DatalogConfig {
            root_dir: datalog_root.to_owned(),
            sinks,
        },
    }
}

/// Reads the single run's `dcs.log` under the data-log root.
fn read_dcs_log(root: &Path) -> String {
    let run_dir = fs::read_dir(root)
        .expect("datalog root exists")
        .next()
        .expect("one run directory")
        .expect("readable entry")
        .path();
    fs::read_to_string(run_dir.join("dcs.log")).expect("dcs.log written")
}

fn last_column(line: &str) -> &str {
    line.rsplit(',').next().unwrap_or("")
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A completion reporting the wrong frequency yields a mismatch: the
/// operating channel stays put, state is re-read, and scanning resumes.
#[test]
fn switch_mismatch_keeps_current_channel_and_resumes() {
    let tmp = TempDir::new().unwrap();
    let events: EventQueue = Arc::new(Mutex::new(VecDeque::new()));

    let hostapd = Arc::new(MockHostapd::new(
        ApReport {
            s1g_freq: 915_500,
            s1g_bw: 4,
            freq_5g: 5180,
        },
        {
            let events = Arc::clone(&events);
            // The AP never actually moves: the completion reports a stray
            // frequency and STATUS keeps naming the original channel.
            Box::new(move |_| events.lock().push_back(switch_notify_event(5300)))
        },
    ));
    let vendor = Arc::new(MockVendor {
        channels: permitted_channels(),
        events: Arc::clone(&events),
        metrics: HashMap::from([(915_500, 10), (919_500, 90)]),
        ocs_requests: Mutex::new(HashMap::new()),
    });
    let nl80211 = Arc::new(MockNl80211 {
        events: Arc::clone(&events),
    });

    let config = ewma_config(tmp.path(), 1);
    let engine = Engine::new();
    let dcs = Dcs::with_backends(
        &config,
        &engine,
        HaltSignal::new(),
        Backends {
            hostapd: hostapd.clone(),
            nl80211: nl80211,
            vendor: vendor.clone(),
        },
    )
    .unwrap();
    engine.start();

    // Two switch attempts prove the scheduler resumed after the mismatch.
    assert!(
        wait_until(Duration::from_secs(30), || {
            hostapd.chan_switch_count.load(Ordering::SeqCst) >= 2
        }),
        "scheduler did not keep running after the mismatch"
    );

    dcs.shutdown();
    engine.stop();

    let log = read_dcs_log(tmp.path());
    let last_row = log.lines().last().unwrap();
    assert_eq!(
        last_column(last_row),
        "37",
        "operating channel must remain the original after a mismatch"
    );
}

/// A completion matching the AP's new report lands the switch: the
/// current channel becomes the candidate and no further switch fires.
#[test]
fn switch_completes_and_updates_current_channel() {
    let tmp = TempDir::new().unwrap();
    let events: EventQueue = Arc::new(Mutex::new(VecDeque::new()));

    let hostapd = Arc::new(MockHostapd::new(
        ApReport {
            s1g_freq: 915_500,
            s1g_bw: 4,
            freq_5g: 5180,
        },
        {
            let events = Arc::clone(&events);
            Box::new(move |ap: &MockHostapd| {
                // The AP moves to channel 45 and the kernel confirms the
                // matching frequency.
                *ap.report.lock() = ApReport {
                    s1g_freq: 919_500,
                    s1g_bw: 4,
                    freq_5g: 5300,
                };
                events.lock().push_back(switch_notify_event(5300));
            })
        },
    ));
    let vendor = Arc::new(MockVendor {
        channels: permitted_channels(),
        events: Arc::clone(&events),
        metrics: HashMap::from([(915_500, 10), (919_500, 90)]),
        ocs_requests: Mutex::new(HashMap::new()),
    });
    let nl80211 = Arc::new(MockNl80211 {
        events: Arc::clone(&events),
    });

    let config = ewma_config(tmp.path(), 1);
    let engine = Engine::new();
    let dcs = Dcs::with_backends(
        &config,
        &engine,
        HaltSignal::new(),
        Backends {
            hostapd: hostapd.clone(),
            nl80211: nl80211,
            vendor: vendor.clone(),
        },
    )
    .unwrap();
    engine.start();

    assert!(
        wait_until(Duration::from_secs(30), || {
            hostapd.chan_switch_count.load(Ordering::SeqCst) >= 1
                && vendor.ocs_request_count(919_500) >= 3
        }),
        "switch did not complete"
    );

    dcs.shutdown();
    engine.stop();

    // Exactly one switch: once channel 45 is current and keeps winning,
    // the streak stays reset.
    assert_eq!(hostapd.chan_switch_count.load(Ordering::SeqCst), 1);

    let log = read_dcs_log(tmp.path());
    let last_row = log.lines().last().unwrap();
    assert_eq!(last_column(last_row), "45");
}

/// A channel failing three consecutive measurements leaves the scan list;
/// later rounds never visit it again.
#[test]
fn failing_channel_is_removed_after_three_strikes() {
    let tmp = TempDir::new().unwrap();
    let events: EventQueue = Arc::new(Mutex::new(VecDeque::new()));

    let mut channels = permitted_channels();
    channels.push(ch(923_500, 53, 4));
    channels.push(ch(922_000, 50, 1)); // primary for channel 53

    let hostapd = Arc::new(MockHostapd::new(
        ApReport {
            s1g_freq: 915_500,
            s1g_bw: 4,
            freq_5g: 5180,
        },
        Box::new(|_| {}),
    ));
    let vendor = Arc::new(MockVendor {
        channels,
        events: Arc::clone(&events),
        // 923 500 is absent: its requests fail outright.
        metrics: HashMap::from([(915_500, 90), (919_500, 50)]),
        ocs_requests: Mutex::new(HashMap::new()),
    });
    let nl80211 = Arc::new(MockNl80211 {
        events: Arc::clone(&events),
    });

    let config = ewma_config(tmp.path(), 5);
    let engine = Engine::new();
    let dcs = Dcs::with_backends(
        &config,
        &engine,
        HaltSignal::new(),
        Backends {
            hostapd: hostapd,
            nl80211: nl80211,
            vendor: vendor.clone(),
        },
    )
    .unwrap();
    engine.start();

    // Let the good channels run well past the failing channel's three
    // attempts.
    assert!(
        wait_until(Duration::from_secs(30), || {
            vendor.ocs_request_count(915_500) >= 6
        }),
        "scheduler made no progress"
    );

    dcs.shutdown();
    engine.stop();

    assert_eq!(
        vendor.ocs_request_count(923_500),
        3,
        "failing channel must be dropped after exactly three attempts"
    );
    assert!(vendor.ocs_request_count(919_500) >= 6);
}

// ---------------------------------------------------------------------------
// Replay scenarios
// ---------------------------------------------------------------------------

/// Inert transports for replay runs: nothing is ever requested.
struct InertBackend;

impl Backend for InertBackend {
    fn name(&self) -> &'static str {
        "inert"
    }

    fn pump_async(&self, timeout: Duration) -> Result<Option<ItemList>, BackendError> {
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }
}

fn replay_config(datalog_root: &Path, samples: &Path, trigger_csa: bool) -> Config {
    let mut config = ewma_config(datalog_root, 1);
    config.dcs.trigger_csa = trigger_csa;
    config.dcs.test = ReplayConfig {
        enabled: true,
        filepath: samples.to_owned(),
    };
    config
}

fn inert_backends() -> Backends {
    Backends {
        hostapd: Arc::new(InertBackend),
        nl80211: Arc::new(InertBackend),
        vendor: Arc::new(InertBackend),
    }
}

/// Replaying a file where the current channel stays best halts cleanly at
/// exhaustion and never moves the operating channel.
#[test]
fn replay_exhaustion_halts_without_switching() {
    let tmp = TempDir::new().unwrap();
    let samples = tmp.path().join("samples.csv");
    fs::write(
        &samples,
        format!(
            "{}\n\
             2024-03-09T10:00:00.00,902500,1,1,80,80,0,1\n\
             2024-03-09T10:00:05.00,906500,1,9,30,30,0,1\n\
             2024-03-09T10:00:10.00,902500,1,1,82,162,1,1\n\
             2024-03-09T10:00:15.00,906500,1,9,31,61,0,1\n\
             2024-03-09T10:00:20.00,902500,1,1,84,246,2,1\n\
             2024-03-09T10:00:25.00,906500,1,9,32,93,0,1\n",
            halow_dcs::replay::CSV_HEADER
        ),
    )
    .unwrap();

    let datalog_root = tmp.path().join("logs");
    let config = replay_config(&datalog_root, &samples, true);
    let halt = HaltSignal::new();
    let engine = Engine::new();
    let dcs = Dcs::with_backends(&config, &engine, halt.clone(), inert_backends()).unwrap();
    engine.start();

    assert!(
        halt.wait_timeout(Duration::from_secs(30)),
        "replay exhaustion must halt the process"
    );
    dcs.shutdown();
    engine.stop();

    let log = read_dcs_log(&datalog_root);
    let rows: Vec<&str> = log.lines().skip(1).collect();
    assert_eq!(rows.len(), 6, "one log row per replayed sample");
    assert!(
        rows.iter().all(|row| last_column(row) == "1"),
        "the operating channel must never move"
    );
}

/// With switching disabled, a dominant rival is logged but the operating
/// channel never changes and no AP command is issued.
#[test]
fn replay_with_disabled_csa_logs_but_does_not_switch() {
    let tmp = TempDir::new().unwrap();
    let samples = tmp.path().join("samples.csv");
    fs::write(
        &samples,
        format!(
            "{}\n\
             2024-03-09T10:00:00.00,902500,1,1,10,10,0,1\n\
             2024-03-09T10:00:05.00,906500,1,9,90,90,0,1\n\
             2024-03-09T10:00:10.00,902500,1,1,10,20,0,1\n\
             2024-03-09T10:00:15.00,906500,1,9,90,180,1,1\n",
            halow_dcs::replay::CSV_HEADER
        ),
    )
    .unwrap();

    let datalog_root = tmp.path().join("logs");
    let config = replay_config(&datalog_root, &samples, false);
    let halt = HaltSignal::new();
    let engine = Engine::new();
    let dcs = Dcs::with_backends(&config, &engine, halt.clone(), inert_backends()).unwrap();
    engine.start();

    assert!(halt.wait_timeout(Duration::from_secs(30)));
    dcs.shutdown();
    engine.stop();

    let log = read_dcs_log(&datalog_root);
    assert!(
        log.lines().skip(1).all(|row| last_column(row) == "1"),
        "a suppressed switch must leave the operating channel alone"
    );
}

/// A malformed replay file fails construction outright.
#[test]
fn replay_bad_header_fails_startup() {
    let tmp = TempDir::new().unwrap();
    let samples = tmp.path().join("samples.csv");
    fs::write(&samples, "time,wrong,header\n").unwrap();

    let config = replay_config(&tmp.path().join("logs"), &samples, false);
    let engine = Engine::new();
    let err =
        Dcs::with_backends(&config, &engine, HaltSignal::new(), inert_backends()).unwrap_err();
    assert!(err.to_string().contains("header"));
}
