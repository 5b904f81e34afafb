//! The DCS scheduler: initialisation and the measure/evaluate/switch loop.
//!
//! [`Dcs::create`] brings the controller up against a live AP: wait for
//! the AP to enable, enumerate the permitted channels from the driver,
//! resolve the operating channel from `STATUS`, filter the scan list, and
//! start the scheduler thread. In replay mode the channel set comes from
//! the recorded sample file instead and measurements are popped from its
//! per-channel queues.
//!
//! The scheduler thread walks the scan list one measurement per tick,
//! feeds each sample to the scoring algorithm, and evaluates once per
//! complete traversal. Measurements rendezvous with the driver's vendor
//! event through a single-slot mailbox under the scan mutex: at most one
//! measurement is ever in flight, and a completion that arrives after its
//! timeout is logged and dropped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use halow_dcs_backend::commands::{
    decode_available_channels, OcsDoneEvent, OcsDriverRequest, CMD_GET_AVAILABLE_CHANNELS,
    CMD_OCS_DRIVER,
};
use halow_dcs_backend::hostapd::text_request;
use halow_dcs_backend::nl80211::{NL80211_CMD_CH_SWITCH_NOTIFY, NL80211_CMD_VENDOR};
use halow_dcs_backend::vendor::{is_ocs_done_event, ocs_done_payload};
use halow_dcs_backend::{HostapdBackend, Nl80211Backend, VendorBackend, VendorRequest};
use halow_dcs_core::time::csv_timestamp;
use halow_dcs_core::{
    Backend, BackendError, Config, DataItem, DataLogFactory, DcsConfig, DcsError, DcsResult,
    ItemList, ItemLookup, LogSink,
};
use halow_dcs_engine::{Engine, HaltSignal};

use crate::algo::{self, Algorithm, RoundView};
use crate::channel::{build_scan_list, ChannelEntry, ChannelInfo, Measurement};
use crate::replay::{ReplayBank, CSV_HEADER};
use crate::switch::SwitchOutcome;

/// AP state required before channels can be enumerated.
const AP_STATE_ENABLED: &str = "ENABLED";

/// Spacing between AP readiness polls at startup.
const AP_WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// AP readiness polls before giving up.
const AP_WAIT_RETRIES: u32 = 10;

/// Retries while `STATUS` reports no valid channel.
pub(crate) const MAX_STATUS_RETRIES: u32 = 3;

/// Spacing between `STATUS` retries.
pub(crate) const STATUS_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// How long a measurement may stay in flight before it is failed.
const MEASUREMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive measurement failures before a channel leaves the scan
/// list.
const MAX_MEASUREMENT_ATTEMPTS: u32 = 3;

/// Operating state as reported by the AP, plus the switch rendezvous it
/// guards. Everything here is written by the scheduler thread and by the
/// channel-switch completion handler, always under the one mutex.
#[derive(Debug)]
pub(crate) struct OperState {
    /// Index of the current operating channel in the channel set.
    pub current: usize,
    /// The 5 GHz mapping frequency, used to validate a completed switch.
    pub current_5g_freq: u32,
    /// Primary channel width in MHz, 1 or 2.
    pub primary_width_mhz: u8,
    /// Primary 1 MHz sub-channel index.
    pub primary_index: u8,
    /// Beacon interval in TU.
    pub beacon_interval_tu: u16,
    /// DTIM period in beacons.
    pub dtim_period: u8,
    /// A channel switch is in flight.
    pub csa_in_progress: bool,
    /// The completion handler has run for the in-flight switch.
    pub csa_completed: bool,
    /// Frequency reported by the completion notification.
    pub csa_confirmed_freq: u32,
}

/// The single-slot measurement mailbox.
pub(crate) enum ScanSlot {
    /// No measurement in flight.
    Idle,
    /// A measurement was requested; the vendor event has not arrived.
    InFlight,
    /// The vendor event arrived: `Some` with the sample, `None` when the
    /// payload was unusable.
    Done(Option<Measurement>),
}

/// Shared state behind the scheduler thread, the event callbacks, and the
/// switch coordinator.
pub(crate) struct DcsInner {
    pub(crate) config: DcsConfig,
    pub(crate) hostapd: Arc<dyn Backend>,
    pub(crate) nl80211: Arc<dyn Backend>,
    pub(crate) vendor: Arc<dyn Backend>,
    /// All permitted channels. Immutable after initialisation.
    pub(crate) channels: Vec<ChannelInfo>,
    pub(crate) state: Mutex<OperState>,
    pub(crate) switch_done: Condvar,
    pub(crate) scan: Mutex<ScanSlot>,
    pub(crate) scan_done: Condvar,
    pub(crate) replay: Option<Mutex<ReplayBank>>,
    pub(crate) halt: HaltSignal,
    pub(crate) datalog: Arc<dyn LogSink>,
    stop: Mutex<bool>,
    stop_cond: Condvar,
}

/// The transports a DCS instance drives.
pub struct Backends {
    /// AP control socket.
    pub hostapd: Arc<dyn Backend>,
    /// Kernel 802.11 configuration layer; carries the event monitors.
    pub nl80211: Arc<dyn Backend>,
    /// Vendor command channel to the chip.
    pub vendor: Arc<dyn Backend>,
}

/// A running DCS instance. Dropping it stops and joins the scheduler
/// thread.
pub struct Dcs {
    inner: Arc<DcsInner>,
    scheduler: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Dcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcs").finish_non_exhaustive()
    }
}

impl Dcs {
    /// Creates a DCS instance wired to the real transports.
    ///
    /// # Errors
    ///
    /// Configuration violations, an AP that never becomes ready, an empty
    /// permitted set or scan list, or a replay file that fails to load.
    pub fn create(config: &Config, engine: &Engine, halt: HaltSignal) -> DcsResult<Self> {
        config.validate()?;
        let factory = DataLogFactory::new(&config.datalog);

        let hostapd: Arc<dyn Backend> = Arc::new(HostapdBackend::new(
            config.control_socket_path(),
            factory.create("hostapd"),
        ));
        let nl80211: Arc<dyn Backend> = Arc::new(Nl80211Backend::new(factory.create("nl80211")));
        let vendor_sink = factory.create("vendor");
        let vendor: Arc<dyn Backend> = Arc::new(VendorBackend::new(
            &config.interface_name,
            Arc::clone(&vendor_sink),
            vendor_sink,
        ));

        Self::with_backends(
            config,
            engine,
            halt,
            Backends {
                hostapd,
                nl80211,
                vendor,
            },
        )
    }

    /// Creates a DCS instance over caller-supplied transports. This is the
    /// full initialisation path; [`Dcs::create`] only adds the real-world
    /// wiring. Also the entry point for scripted-backend tests.
    pub fn with_backends(
        config: &Config,
        engine: &Engine,
        halt: HaltSignal,
        backends: Backends,
    ) -> DcsResult<Self> {
        config.validate()?;
        info!("initialising DCS");

        let dcs_config = config.dcs.clone();
        let algorithm = algo::create(&dcs_config)?;
        info!(algorithm = algorithm.name(), "algorithm selected");

        let factory = DataLogFactory::new(&config.datalog);
        let datalog = factory.create("dcs");

        let replay_bank = if dcs_config.test.enabled {
            Some(ReplayBank::load(&dcs_config.test.filepath)?)
        } else {
            None
        };

        let (channels, initial_state) = match &replay_bank {
            Some(bank) => initialise_from_replay(bank)?,
            None => initialise_from_driver(&backends)?,
        };

        let scan_list = match &replay_bank {
            Some(_) => (0..channels.len()).collect::<Vec<_>>(),
            None => build_scan_list(
                &channels,
                channels[initial_state.current].bandwidth_mhz,
                initial_state.primary_width_mhz,
                initial_state.primary_index,
            ),
        };
        for &index in &scan_list {
            info!(
                channel = channels[index].channel_s1g,
                freq_khz = channels[index].frequency_khz,
                bandwidth_mhz = channels[index].bandwidth_mhz,
                "channel added to scan list"
            );
        }
        if scan_list.is_empty() {
            return Err(DcsError::channel_setup("scan list is empty after filtering"));
        }

        let inner = Arc::new(DcsInner {
            config: dcs_config,
            hostapd: backends.hostapd,
            nl80211: backends.nl80211,
            vendor: backends.vendor,
            channels,
            state: Mutex::new(initial_state),
            switch_done: Condvar::new(),
            scan: Mutex::new(ScanSlot::Idle),
            scan_done: Condvar::new(),
            replay: replay_bank.map(Mutex::new),
            halt,
            datalog,
            stop: Mutex::new(false),
            stop_cond: Condvar::new(),
        });

        if inner.replay.is_none() {
            let watcher = Arc::clone(&inner);
            engine.monitor_pattern(
                &inner.nl80211,
                &vec![DataItem::new(NL80211_CMD_VENDOR)],
                Arc::new(move |_: &Arc<dyn Backend>, event: &ItemList| {
                    watcher.on_vendor_event(event);
                }),
            );
        }
        let watcher = Arc::clone(&inner);
        engine.monitor_pattern(
            &inner.nl80211,
            &vec![DataItem::new(NL80211_CMD_CH_SWITCH_NOTIFY)],
            Arc::new(move |_: &Arc<dyn Backend>, event: &ItemList| {
                watcher.on_switch_notify(event);
            }),
        );

        let entries: Vec<ChannelEntry> = inner
            .channels
            .iter()
            .copied()
            .map(ChannelEntry::new)
            .collect();
        let thread_inner = Arc::clone(&inner);
        let scheduler = thread::Builder::new()
            .name("dcs-scheduler".into())
            .spawn(move || run_scheduler(&thread_inner, entries, scan_list, algorithm))
            .expect("spawn scheduler thread");

        Ok(Self {
            inner,
            scheduler: Some(scheduler),
        })
    }

    /// Stops the scheduler thread and joins it. The thread exits at its
    /// next sleep or rendezvous boundary.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut stop = self.inner.stop.lock();
            *stop = true;
        }
        self.inner.stop_cond.notify_all();
        if let Some(handle) = self.scheduler.take() {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for Dcs {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

fn initialise_from_replay(bank: &ReplayBank) -> DcsResult<(Vec<ChannelInfo>, OperState)> {
    let channels = bank.channels();
    let current = channels
        .iter()
        .position(|ch| ch.channel_s1g == bank.initial_channel_s1g())
        .ok_or_else(|| {
            DcsError::channel_setup(format!(
                "initial channel {} not present in the sample file",
                bank.initial_channel_s1g()
            ))
        })?;
    info!(
        channel = channels[current].channel_s1g,
        "replay mode, initial channel loaded"
    );

    let state = OperState {
        current,
        current_5g_freq: 0,
        primary_width_mhz: 1,
        primary_index: 0,
        beacon_interval_tu: 0,
        dtim_period: 0,
        csa_in_progress: false,
        csa_completed: false,
        csa_confirmed_freq: 0,
    };
    Ok((channels, state))
}

fn initialise_from_driver(backends: &Backends) -> DcsResult<(Vec<ChannelInfo>, OperState)> {
    info!("waiting for the AP to start");
    if !wait_for_ap_state(
        &backends.hostapd,
        AP_STATE_ENABLED,
        AP_WAIT_INTERVAL,
        AP_WAIT_RETRIES,
    ) {
        return Err(DcsError::ap_not_ready(format!(
            "AP did not reach state {AP_STATE_ENABLED}"
        )));
    }

    let channels = enumerate_channels(&backends.vendor)?;

    let snapshot = {
        let mut attempt = 0;
        loop {
            match read_operating_state(&backends.hostapd, &channels) {
                Ok(snapshot) => break snapshot,
                Err(StatusError::NotReady) if attempt < MAX_STATUS_RETRIES => {
                    attempt += 1;
                    info!(attempt, "AP reports no valid channel yet, retrying");
                    thread::sleep(STATUS_RETRY_INTERVAL);
                }
                Err(StatusError::NotReady) => {
                    return Err(DcsError::ap_not_ready(
                        "AP never reported a valid operating channel",
                    ));
                }
                Err(StatusError::Failed) => {
                    return Err(DcsError::channel_setup(
                        "could not read the operating state from STATUS",
                    ));
                }
            }
        }
    };

    let state = OperState {
        current: snapshot.current,
        current_5g_freq: snapshot.current_5g_freq,
        primary_width_mhz: snapshot.primary_width_mhz,
        primary_index: snapshot.primary_index,
        beacon_interval_tu: snapshot.beacon_interval_tu,
        dtim_period: snapshot.dtim_period,
        csa_in_progress: false,
        csa_completed: false,
        csa_confirmed_freq: 0,
    };
    Ok((channels, state))
}

/// Polls `STATUS` until the AP reaches `desired`, with bounded retries.
fn wait_for_ap_state(
    hostapd: &Arc<dyn Backend>,
    desired: &str,
    interval: Duration,
    retries: u32,
) -> bool {
    for attempt in 1..=retries {
        let Ok(reply) = hostapd.submit_blocking(&text_request("STATUS")) else {
            return false;
        };
        let state = reply
            .find_str("state")
            .and_then(DataItem::value_str)
            .unwrap_or("unknown");
        if state == desired {
            return true;
        }
        info!(
            current = state,
            attempt, retries, "AP not in state {desired} yet"
        );
        thread::sleep(interval);
    }
    false
}

/// Enumerates the permitted channels from the chip.
fn enumerate_channels(vendor: &Arc<dyn Backend>) -> DcsResult<Vec<ChannelInfo>> {
    let request = VendorRequest::new()
        .command(CMD_GET_AVAILABLE_CHANNELS, &[])
        .build();
    let reply = vendor.submit_blocking(&request)?;
    let data = reply
        .find_u32(u32::from(CMD_GET_AVAILABLE_CHANNELS))
        .and_then(DataItem::value_bytes)
        .ok_or(BackendError::EmptyResponse { backend: "vendor" })?;

    let channels = decode_available_channels(data)?;
    if channels.is_empty() {
        return Err(DcsError::channel_setup("driver reports no permitted channels"));
    }
    for channel in &channels {
        debug!(
            channel = channel.channel_s1g,
            freq_khz = channel.frequency_khz,
            bandwidth_mhz = channel.bandwidth_mhz,
            "permitted channel"
        );
    }
    Ok(channels)
}

// ---------------------------------------------------------------------------
// STATUS parsing
// ---------------------------------------------------------------------------

/// Why an operating-state read did not apply.
#[derive(Debug)]
pub(crate) enum StatusError {
    /// The AP answered but has no valid channel yet (`s1g_freq == -1`).
    NotReady,
    /// The request failed, a field was missing or invalid, or the channel
    /// is not in the permitted set.
    Failed,
}

/// A successfully parsed operating state.
pub(crate) struct StatusSnapshot {
    pub current: usize,
    pub current_5g_freq: u32,
    pub primary_width_mhz: u8,
    pub primary_index: u8,
    pub beacon_interval_tu: u16,
    pub dtim_period: u8,
}

fn status_field<T: std::str::FromStr>(reply: &ItemList, key: &str) -> Result<T, StatusError> {
    reply
        .find_str(key)
        .and_then(DataItem::value_str)
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| {
            error!(key, "STATUS field missing or invalid");
            StatusError::Failed
        })
}

/// Reads `STATUS` and resolves the operating channel against the
/// permitted set.
pub(crate) fn read_operating_state(
    hostapd: &Arc<dyn Backend>,
    channels: &[ChannelInfo],
) -> Result<StatusSnapshot, StatusError> {
    let reply = hostapd
        .submit_blocking(&text_request("STATUS"))
        .map_err(|err| {
            error!(%err, "STATUS request failed");
            StatusError::Failed
        })?;
    parse_operating_state(&reply, channels)
}

/// Parses a `STATUS` reply. Split from the request for tests.
pub(crate) fn parse_operating_state(
    reply: &ItemList,
    channels: &[ChannelInfo],
) -> Result<StatusSnapshot, StatusError> {
    let s1g_freq: i64 = status_field(reply, "s1g_freq")?;
    if s1g_freq == -1 {
        return Err(StatusError::NotReady);
    }

    let current_5g_freq: u32 = status_field(reply, "freq")?;
    let s1g_bw: i64 = status_field(reply, "s1g_bw")?;
    let primary_width_mhz: u8 = status_field(reply, "s1g_prim_chwidth")?;
    if primary_width_mhz != 1 && primary_width_mhz != 2 {
        error!(primary_width_mhz, "unsupported primary channel width");
        return Err(StatusError::Failed);
    }
    let primary_index: u8 = status_field(reply, "s1g_prim_1mhz_chan_index")?;
    let beacon_interval_tu: u16 = status_field(reply, "beacon_int")?;
    let dtim_period: u8 = status_field(reply, "dtim_period")?;
    if beacon_interval_tu == 0 || dtim_period == 0 {
        error!(beacon_interval_tu, dtim_period, "invalid beacon timing");
        return Err(StatusError::Failed);
    }

    let current = channels
        .iter()
        .position(|ch| {
            i64::from(ch.frequency_khz) == s1g_freq && i64::from(ch.bandwidth_mhz) == s1g_bw
        })
        .ok_or_else(|| {
            error!(
                s1g_freq,
                s1g_bw, primary_width_mhz, primary_index, "channel not in the permitted set"
            );
            StatusError::Failed
        })?;

    info!(
        channel = channels[current].channel_s1g,
        freq_khz = channels[current].frequency_khz,
        "current channel resolved"
    );
    Ok(StatusSnapshot {
        current,
        current_5g_freq,
        primary_width_mhz,
        primary_index,
        beacon_interval_tu,
        dtim_period,
    })
}

// ---------------------------------------------------------------------------
// Shared state operations
// ---------------------------------------------------------------------------

impl DcsInner {
    pub(crate) fn current_index(&self) -> usize {
        self.state.lock().current
    }

    /// Re-reads `STATUS` into `state`. Must be called with the state mutex
    /// held (enforced by the `&mut OperState` borrow).
    pub(crate) fn refresh_operating_state_locked(
        &self,
        state: &mut OperState,
    ) -> Result<(), StatusError> {
        let snapshot = read_operating_state(&self.hostapd, &self.channels)?;
        state.current = snapshot.current;
        state.current_5g_freq = snapshot.current_5g_freq;
        state.primary_width_mhz = snapshot.primary_width_mhz;
        state.primary_index = snapshot.primary_index;
        state.beacon_interval_tu = snapshot.beacon_interval_tu;
        state.dtim_period = snapshot.dtim_period;
        Ok(())
    }

    /// Best-effort operating-state resync after a switch timeout or
    /// mismatch.
    pub(crate) fn resync_operating_state(&self) {
        let mut state = self.state.lock();
        let mut attempt = 0;
        loop {
            match self.refresh_operating_state_locked(&mut state) {
                Ok(()) => return,
                Err(StatusError::NotReady) if attempt < MAX_STATUS_RETRIES => {
                    attempt += 1;
                    parking_lot::MutexGuard::unlocked(&mut state, || {
                        thread::sleep(STATUS_RETRY_INTERVAL);
                    });
                }
                Err(_) => {
                    error!("could not re-synchronise the operating state");
                    return;
                }
            }
        }
    }

    /// Sleeps up to `duration`, returning early (and `true`) once shutdown
    /// is requested.
    fn stopped_within(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stop = self.stop.lock();
        while !*stop {
            if self.stop_cond.wait_until(&mut stop, deadline).timed_out() {
                break;
            }
        }
        *stop
    }

    /// Whether the replay bank (if any) has no samples left.
    fn replay_exhausted(&self) -> bool {
        self.replay
            .as_ref()
            .is_some_and(|bank| bank.lock().is_empty())
    }

    /// Fetches one measurement for `channel`, from the replay bank or the
    /// chip.
    fn measure(&self, channel: &ChannelInfo) -> Option<Measurement> {
        if let Some(bank) = &self.replay {
            return bank.lock().pop(channel.frequency_khz);
        }
        self.measure_from_chip(channel)
    }

    /// Requests an off-channel scan and waits for its vendor event.
    fn measure_from_chip(&self, channel: &ChannelInfo) -> Option<Measurement> {
        let (primary_width, primary_index) = {
            let state = self.state.lock();
            (state.primary_width_mhz, state.primary_index)
        };

        let mut slot = self.scan.lock();
        assert!(
            matches!(*slot, ScanSlot::Idle),
            "a measurement is already in flight"
        );
        *slot = ScanSlot::InFlight;

        let payload = OcsDriverRequest {
            op_channel_freq_hz: channel.frequency_khz.saturating_mul(1000),
            op_channel_bw_mhz: channel.bandwidth_mhz,
            pri_channel_bw_mhz: primary_width,
            pri_1mhz_channel_index: primary_index,
        }
        .encode();
        let request = VendorRequest::new().command(CMD_OCS_DRIVER, &payload).build();

        if let Err(err) = self.vendor.submit_blocking(&request) {
            warn!(%err, "off-channel scan request failed");
            *slot = ScanSlot::Idle;
            return None;
        }
        debug!(freq_khz = channel.frequency_khz, "measurement scheduled");

        let deadline = Instant::now() + MEASUREMENT_TIMEOUT;
        while matches!(*slot, ScanSlot::InFlight) {
            if self.scan_done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }

        match std::mem::replace(&mut *slot, ScanSlot::Idle) {
            ScanSlot::Done(result) => result,
            ScanSlot::InFlight => {
                error!(freq_khz = channel.frequency_khz, "measurement timed out");
                None
            }
            ScanSlot::Idle => None,
        }
    }

    /// Vendor-event callback: completes the in-flight measurement.
    pub(crate) fn on_vendor_event(&self, event: &ItemList) {
        if !is_ocs_done_event(event) {
            // Not our event.
            return;
        }

        let mut slot = self.scan.lock();
        if !matches!(*slot, ScanSlot::InFlight) {
            error!("measurement completed after it timed out");
            return;
        }

        let result = ocs_done_payload(event)
            .and_then(|data| OcsDoneEvent::decode(data).ok())
            .map(|done| Measurement {
                captured_at: Utc::now(),
                metric: done.metric,
                noise: done.noise,
                listen_time_us: done.time_listen_us,
                rx_time_us: done.time_rx_us,
            });
        if result.is_none() {
            warn!("OCS done event carried no usable payload");
        }

        *slot = ScanSlot::Done(result);
        self.scan_done.notify_one();
    }
}

// ---------------------------------------------------------------------------
// The scheduler loop
// ---------------------------------------------------------------------------

fn run_scheduler(
    inner: &Arc<DcsInner>,
    mut entries: Vec<ChannelEntry>,
    mut scan_list: Vec<usize>,
    mut algorithm: Box<dyn Algorithm>,
) {
    inner.datalog.write_line(CSV_HEADER);
    {
        let current = inner.current_index();
        let mut round = RoundView {
            entries: &mut entries,
            scan_list: &scan_list,
            current,
        };
        algorithm.start(&mut round);
    }

    let scan_period = inner.config.scan_period();
    let round_period = inner.config.round_period();
    let mut cursor = 0usize;
    let mut attempts = 0u32;

    loop {
        if inner.stopped_within(scan_period) {
            break;
        }
        if scan_list.is_empty() {
            error!("scan list drained, no channels left to measure");
            inner.halt.trigger();
            break;
        }

        let channel_index = scan_list[cursor];
        let info = entries[channel_index].info;

        match inner.measure(&info) {
            Some(measurement) => {
                algorithm.process_measurement(&measurement, &mut entries[channel_index]);
                let metric = entries[channel_index].metric;
                debug!(
                    channel = info.channel_s1g,
                    raw = measurement.metric,
                    noise = measurement.noise,
                    listen_us = measurement.listen_time_us,
                    rx_us = measurement.rx_time_us,
                    score = metric.accumulated_score,
                    "measurement done"
                );

                if inner.datalog.is_enabled() {
                    let current_s1g = entries[inner.current_index()].info.channel_s1g;
                    inner.datalog.write_line(&format!(
                        "{},{},{},{},{},{},{},{}",
                        csv_timestamp(measurement.captured_at),
                        info.frequency_khz,
                        info.bandwidth_mhz,
                        info.channel_s1g,
                        measurement.metric,
                        metric.accumulated_score,
                        metric.rounds_as_best,
                        current_s1g,
                    ));
                }

                cursor += 1;
                attempts = 0;
            }
            None => {
                attempts += 1;
                warn!(
                    channel = info.channel_s1g,
                    attempt = attempts,
                    "measurement failed"
                );
                if attempts >= MAX_MEASUREMENT_ATTEMPTS {
                    attempts = 0;
                    if channel_index == inner.current_index() {
                        warn!(
                            channel = info.channel_s1g,
                            "operating channel keeps failing measurements, keeping it on the scan list"
                        );
                    } else {
                        warn!(channel = info.channel_s1g, "removing channel from scan list");
                        scan_list.remove(cursor);
                    }
                }
            }
        }

        if cursor >= scan_list.len() {
            debug!("scan round complete, evaluating channels");
            let current = inner.current_index();
            let candidate = {
                let mut round = RoundView {
                    entries: &mut entries,
                    scan_list: &scan_list,
                    current,
                };
                algorithm.evaluate(&mut round)
            };
            if let Some(candidate) = candidate {
                if candidate != current {
                    run_switch(inner, &mut entries, &scan_list, algorithm.as_mut(), candidate);
                }
            }
            cursor = 0;

            if inner.replay_exhausted() {
                info!("replay samples exhausted, halting");
                inner.halt.trigger();
                break;
            }
            if inner.stopped_within(round_period) {
                break;
            }
        } else if inner.replay_exhausted() {
            info!("replay samples exhausted, halting");
            inner.halt.trigger();
            break;
        }
    }
}

fn run_switch(
    inner: &Arc<DcsInner>,
    entries: &mut [ChannelEntry],
    scan_list: &[usize],
    algorithm: &mut dyn Algorithm,
    candidate: usize,
) {
    let target = entries[candidate].info;
    match inner.switch_to(&target) {
        Ok(SwitchOutcome::Completed | SwitchOutcome::Disabled) => {
            let current = inner.current_index();
            let mut round = RoundView {
                entries,
                scan_list,
                current,
            };
            algorithm.post_switch(&mut round);
        }
        Ok(SwitchOutcome::Rejected) => {
            warn!(channel = target.channel_s1g, "AP rejected the channel switch");
        }
        Ok(outcome @ (SwitchOutcome::Timeout | SwitchOutcome::Mismatch)) => {
            warn!(?outcome, "channel switch did not complete, re-reading state");
            inner.resync_operating_state();
        }
        Err(err) => {
            warn!(%err, "channel switch request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<ChannelInfo> {
        vec![
            ChannelInfo {
                frequency_khz: 915_500,
                channel_s1g: 37,
                bandwidth_mhz: 4,
            },
            ChannelInfo {
                frequency_khz: 919_500,
                channel_s1g: 45,
                bandwidth_mhz: 4,
            },
        ]
    }

    fn status_reply(fields: &[(&str, &str)]) -> ItemList {
        fields
            .iter()
            .map(|(key, value)| DataItem::with_str(*key, value))
            .collect()
    }

    fn full_status(s1g_freq: &str) -> ItemList {
        status_reply(&[
            ("state", "ENABLED"),
            ("freq", "5180"),
            ("s1g_freq", s1g_freq),
            ("s1g_bw", "4"),
            ("s1g_prim_chwidth", "1"),
            ("s1g_prim_1mhz_chan_index", "0"),
            ("beacon_int", "100"),
            ("dtim_period", "3"),
        ])
    }

    #[test]
    fn status_parses_into_snapshot() {
        let snapshot = parse_operating_state(&full_status("915500"), &channels()).unwrap();
        assert_eq!(snapshot.current, 0);
        assert_eq!(snapshot.current_5g_freq, 5180);
        assert_eq!(snapshot.primary_width_mhz, 1);
        assert_eq!(snapshot.primary_index, 0);
        assert_eq!(snapshot.beacon_interval_tu, 100);
        assert_eq!(snapshot.dtim_period, 3);
    }

    #[test]
    fn status_not_ready_is_distinguished() {
        assert!(matches!(
            parse_operating_state(&full_status("-1"), &channels()),
            Err(StatusError::NotReady)
        ));
    }

    #[test]
    fn status_unknown_channel_fails() {
        assert!(matches!(
            parse_operating_state(&full_status("999999"), &channels()),
            Err(StatusError::Failed)
        ));
    }

    #[test]
    fn status_missing_field_fails() {
        let reply = status_reply(&[("s1g_freq", "915500")]);
        assert!(matches!(
            parse_operating_state(&reply, &channels()),
            Err(StatusError::Failed)
        ));
    }

    #[test]
    fn status_rejects_bad_primary_width() {
        let mut reply = full_status("915500");
        for item in reply.iter_mut() {
            if matches!(&item.key, halow_dcs_core::Key::Str(s) if s == "s1g_prim_chwidth") {
                *item = DataItem::with_str("s1g_prim_chwidth", "4");
            }
        }
        assert!(matches!(
            parse_operating_state(&reply, &channels()),
            Err(StatusError::Failed)
        ));
    }

    #[test]
    fn status_rejects_zero_beacon_timing() {
        let mut reply = full_status("915500");
        for item in reply.iter_mut() {
            if matches!(&item.key, halow_dcs_core::Key::Str(s) if s == "beacon_int") {
                *item = DataItem::with_str("beacon_int", "0");
            }
        }
        assert!(matches!(
            parse_operating_state(&reply, &channels()),
            Err(StatusError::Failed)
        ));
    }
}
