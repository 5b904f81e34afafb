//! The channel-switch coordinator.
//!
//! Issues the ECSA through the AP control socket, waits for the kernel's
//! `CH_SWITCH_NOTIFY` completion under a deadline derived from the beacon
//! timing, and verifies the landing frequency. The completion handler
//! runs on the nl80211 dispatcher thread with the switch mutex held; it
//! re-reads `STATUS` (with bounded retries while the AP lags the kernel
//! event) and wakes the coordinator.

use std::thread;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use halow_dcs_backend::hostapd::text_request;
use halow_dcs_backend::nl80211::{NL80211_ATTR_WIPHY_FREQ, NL80211_CMD_CH_SWITCH_NOTIFY};
use halow_dcs_core::{DataItem, DcsResult, ItemList, ItemLookup, Key};

use crate::channel::{primary_centre_khz, sec_channel_offset, ChannelInfo};
use crate::scheduler::{DcsInner, StatusError, MAX_STATUS_RETRIES, STATUS_RETRY_INTERVAL};

/// Extra wait beyond the announced switch time, covering beacon update,
/// BSS change notification, and event delivery.
const SWITCH_GRACE: Duration = Duration::from_secs(5);

/// How a channel-switch attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The AP confirmed landing on the requested channel.
    Completed,
    /// Switching is disabled by configuration; nothing was sent.
    Disabled,
    /// The AP refused the `CHAN_SWITCH` command.
    Rejected,
    /// No completion notification arrived within the deadline.
    Timeout,
    /// The completion notification reported a different frequency.
    Mismatch,
}

/// One TU is 1024 µs.
fn tu_to_seconds(tu: u64) -> u64 {
    tu * 1024 / 1_000_000
}

impl DcsInner {
    /// Switches the AP to `candidate` and waits for confirmation.
    ///
    /// # Errors
    ///
    /// Transport failures submitting the command. Refusals, timeouts, and
    /// landing mismatches are outcomes, not errors.
    pub(crate) fn switch_to(&self, candidate: &ChannelInfo) -> DcsResult<SwitchOutcome> {
        if !self.config.trigger_csa {
            info!(
                channel = candidate.channel_s1g,
                "better channel found, but switching is disabled by configuration"
            );
            return Ok(SwitchOutcome::Disabled);
        }

        let mut state = self.state.lock();
        assert!(!state.csa_in_progress, "a channel switch is already in flight");

        info!(
            freq_khz = candidate.frequency_khz,
            channel = candidate.channel_s1g,
            "triggering channel switch"
        );

        let command = format!(
            "CHAN_SWITCH {} {} prim_bandwidth={} sec_channel_offset={} center_freq1={} bandwidth={}",
            self.config.dtims_for_csa,
            primary_centre_khz(candidate, state.primary_width_mhz, state.primary_index),
            state.primary_width_mhz,
            sec_channel_offset(candidate, state.primary_index),
            candidate.frequency_khz,
            candidate.bandwidth_mhz,
        );

        let reply = self.hostapd.submit_blocking(&text_request(&command))?;
        let accepted = matches!(
            reply.first().map(|item| &item.key),
            Some(Key::Str(head)) if head == "OK"
        );
        if !accepted {
            let refusal = reply
                .first()
                .map_or_else(|| "empty reply".to_owned(), |item| item.key.to_string());
            warn!(%refusal, "ECSA refused");
            return Ok(SwitchOutcome::Rejected);
        }

        let switch_secs = tu_to_seconds(
            u64::from(state.beacon_interval_tu)
                * u64::from(state.dtim_period)
                * u64::from(self.config.dtims_for_csa),
        );
        info!(
            switch_secs,
            beacon_interval = state.beacon_interval_tu,
            dtim_period = state.dtim_period,
            dtims_for_csa = self.config.dtims_for_csa,
            "channel switch announced"
        );
        let deadline = Instant::now() + Duration::from_secs(switch_secs) + SWITCH_GRACE;

        state.csa_in_progress = true;
        let mut timed_out = false;
        while !state.csa_completed {
            if self.switch_done.wait_until(&mut state, deadline).timed_out() {
                timed_out = true;
                break;
            }
        }

        let outcome = if timed_out {
            warn!("channel switch timed out");
            SwitchOutcome::Timeout
        } else if state.csa_confirmed_freq != 0
            && state.csa_confirmed_freq == state.current_5g_freq
        {
            info!("channel switched successfully");
            SwitchOutcome::Completed
        } else {
            warn!(
                confirmed = state.csa_confirmed_freq,
                current = state.current_5g_freq,
                "switch completion does not match the current frequency"
            );
            SwitchOutcome::Mismatch
        };

        state.csa_in_progress = false;
        state.csa_completed = false;
        state.csa_confirmed_freq = 0;
        Ok(outcome)
    }

    /// `CH_SWITCH_NOTIFY` callback: records the confirmed frequency,
    /// refreshes the operating state, and wakes the coordinator.
    ///
    /// Spurious notifications (no switch in flight) are logged and
    /// dropped without touching the operating channel.
    pub(crate) fn on_switch_notify(&self, event: &ItemList) {
        let mut state = self.state.lock();

        match event
            .find_path(&[NL80211_CMD_CH_SWITCH_NOTIFY, NL80211_ATTR_WIPHY_FREQ])
            .and_then(DataItem::value_u32)
        {
            Some(freq) => {
                debug!(freq, "channel switch completion received");
                state.csa_confirmed_freq = freq;
            }
            None => {
                error!("channel switch completion carries no frequency");
                state.csa_confirmed_freq = 0;
            }
        }

        // The AP may not have caught up with the kernel event yet; retry
        // while it still reports no valid channel.
        let mut attempt = 0;
        loop {
            match self.refresh_operating_state_locked(&mut state) {
                Ok(()) => break,
                Err(StatusError::NotReady) if attempt < MAX_STATUS_RETRIES => {
                    attempt += 1;
                    MutexGuard::unlocked(&mut state, || thread::sleep(STATUS_RETRY_INTERVAL));
                }
                Err(_) => {
                    error!("could not retrieve the new channel");
                    state.csa_confirmed_freq = 0;
                    break;
                }
            }
        }
        if attempt > 0 {
            debug!(tries = attempt, "operating-state refresh needed retries");
        }

        if state.csa_in_progress {
            state.csa_completed = true;
            self.switch_done.notify_one();
        } else {
            warn!("channel switch completed, but none was in progress");
        }
    }
}
