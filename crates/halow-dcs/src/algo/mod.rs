//! Pluggable scoring algorithms.
//!
//! An [`Algorithm`] consumes measurements as they arrive and decides at
//! each round boundary whether a better channel warrants a switch. The
//! active algorithm is chosen at configuration time via
//! [`AlgoType`](halow_dcs_core::AlgoType); the scheduler only ever sees
//! the trait object.
//!
//! Shared helpers live here: the comparison [`threshold`], and
//! [`RoundView`] with the highest-score selection and its
//! farthest-from-current tie-break.

mod ewma;
mod sample_and_hold;

pub use ewma::Ewma;
pub use sample_and_hold::SampleAndHold;

use halow_dcs_core::{AlgoType, ConfigError, DcsConfig, DcsError};

use crate::channel::{ChannelEntry, Measurement};

/// The scheduler's view of one evaluation round: the channel set, the scan
/// list referencing into it, and the current operating channel.
pub struct RoundView<'a> {
    /// All permitted channels with their metrics.
    pub entries: &'a mut [ChannelEntry],
    /// Indices of the channels being scanned.
    pub scan_list: &'a [usize],
    /// Index of the current operating channel.
    pub current: usize,
}

impl RoundView<'_> {
    /// The scan-list entry with the greatest accumulated score.
    ///
    /// Ties go to the candidate farthest in frequency from the current
    /// channel: interferers cluster near the operating channel, so when
    /// scores cannot separate candidates, distance is the better bet. If
    /// the current channel is among the tied leaders it stays the winner:
    /// switching for the sake of switching costs every associated station
    /// a beacon countdown.
    pub fn best_index(&self) -> Option<usize> {
        let current_freq = i64::from(self.entries[self.current].info.frequency_khz);
        let mut best: Option<usize> = None;

        for &index in self.scan_list {
            let Some(best_index) = best else {
                best = Some(index);
                continue;
            };

            let next_score = self.entries[index].metric.accumulated_score;
            let best_score = self.entries[best_index].metric.accumulated_score;
            if next_score > best_score {
                best = Some(index);
            } else if next_score == best_score {
                let diff_next = current_freq - i64::from(self.entries[index].info.frequency_khz);
                let diff_best =
                    i64::from(self.entries[best_index].info.frequency_khz) - current_freq;

                if diff_best == 0 {
                    continue;
                }
                if diff_next.abs() > diff_best.abs() || diff_next == 0 {
                    best = Some(index);
                }
            }
        }
        best
    }

    /// The current operating channel's accumulated score.
    pub fn current_score(&self) -> u32 {
        self.entries[self.current].metric.accumulated_score
    }

    /// Resets every scan-list entry's accumulated score to `value` and its
    /// sample count to zero.
    pub fn reset_scores(&mut self, value: u32) {
        for &index in self.scan_list {
            self.entries[index].metric.accumulated_score = value;
            self.entries[index].metric.samples_taken = 0;
        }
    }
}

/// The score a candidate must beat to displace a channel scoring `score`,
/// given a threshold percentage.
pub fn threshold(score: u32, percentage: u8) -> u32 {
    score * (100 + u32::from(percentage)) / 100
}

/// One scoring algorithm's operations. All state beyond the channel
/// metrics is the algorithm's own.
pub trait Algorithm: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Called once before the first round, with the initial scan list.
    fn start(&mut self, round: &mut RoundView<'_>) {
        let _ = round;
    }

    /// Folds one measurement into the measured channel's metric.
    fn process_measurement(&mut self, sample: &Measurement, entry: &mut ChannelEntry);

    /// Called at each round boundary. Returns the channel set index to
    /// switch to, or `None` to stay put.
    fn evaluate(&mut self, round: &mut RoundView<'_>) -> Option<usize>;

    /// Called after a completed channel switch.
    fn post_switch(&mut self, round: &mut RoundView<'_>) {
        let _ = round;
    }
}

/// Instantiates the configured algorithm.
///
/// # Errors
///
/// [`ConfigError::MissingKey`] when the section named by `algo_type` is
/// absent. Bounds inside the section are checked by
/// [`Config::validate`](halow_dcs_core::Config::validate).
pub fn create(config: &DcsConfig) -> Result<Box<dyn Algorithm>, DcsError> {
    match config.algo_type {
        AlgoType::Ewma => {
            let cfg = config
                .ewma
                .as_ref()
                .ok_or(ConfigError::MissingKey { key: "dcs.ewma" })?;
            Ok(Box::new(Ewma::new(cfg)))
        }
        AlgoType::SampleAndHold => {
            let cfg = config.sample_and_hold.as_ref().ok_or(ConfigError::MissingKey {
                key: "dcs.sample_and_hold",
            })?;
            Ok(Box::new(SampleAndHold::new(cfg)))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::channel::ChannelInfo;
    use chrono::Utc;

    pub fn entries(freqs: &[u32]) -> Vec<ChannelEntry> {
        freqs
            .iter()
            .enumerate()
            .map(|(i, &freq)| {
                ChannelEntry::new(ChannelInfo {
                    frequency_khz: freq,
                    channel_s1g: (i + 1) as u8,
                    bandwidth_mhz: 4,
                })
            })
            .collect()
    }

    pub fn sample(metric: u8) -> Measurement {
        Measurement {
            captured_at: Utc::now(),
            metric,
            noise: -90,
            listen_time_us: 100_000,
            rx_time_us: 10_000,
        }
    }
}
