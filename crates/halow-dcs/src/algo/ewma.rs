//! Exponentially weighted moving average scoring.
//!
//! Each measurement folds into the channel's score as
//! `S[t] = (a·X[t] + (100 − a)·S[t−1]) / 100`, with the alpha expressed as
//! a percentage: 1 keeps 99% history, 100 keeps none. A switch fires once
//! a channel other than the current one has been the round's best (and
//! above the comparison threshold) for `rounds_for_csa` consecutive
//! rounds; a round won by the current channel resets the streak.

use tracing::info;

use halow_dcs_core::EwmaConfig;

use super::{threshold, Algorithm, RoundView};
use crate::channel::{ChannelEntry, Measurement};

/// Channels start at full score so an idle channel is never displaced by
/// one nobody has measured yet.
const INITIAL_SCORE: u32 = 100;

/// The EWMA algorithm.
pub struct Ewma {
    alpha: u8,
    threshold_percentage: u8,
    rounds_for_csa: u32,
    rounds_with_better_channel: u32,
}

impl Ewma {
    /// Builds the algorithm from its validated configuration.
    pub fn new(config: &EwmaConfig) -> Self {
        Self {
            alpha: config.ewma_alpha,
            threshold_percentage: config.threshold_percentage,
            rounds_for_csa: config.rounds_for_csa,
            rounds_with_better_channel: 0,
        }
    }
}

/// `S[t] = (a·X[t] + (100 − a)·S[t−1]) / 100`, in integer percent space.
fn apply_ewma(alpha: u8, new_score: u32, last_score: u32) -> u32 {
    let alpha_new = u32::from(alpha);
    let alpha_last = 100 - alpha_new;
    (alpha_new * new_score + alpha_last * last_score) / 100
}

impl Algorithm for Ewma {
    fn name(&self) -> &'static str {
        "ewma"
    }

    fn start(&mut self, round: &mut RoundView<'_>) {
        round.reset_scores(INITIAL_SCORE);
    }

    fn process_measurement(&mut self, sample: &Measurement, entry: &mut ChannelEntry) {
        entry.metric.samples_taken += 1;
        entry.metric.accumulated_score = apply_ewma(
            self.alpha,
            u32::from(sample.metric),
            entry.metric.accumulated_score,
        );
    }

    fn evaluate(&mut self, round: &mut RoundView<'_>) -> Option<usize> {
        let best = round.best_index()?;
        let best_score = round.entries[best].metric.accumulated_score;
        let bar = threshold(round.current_score(), self.threshold_percentage);

        info!(
            candidate = round.entries[best].info.channel_s1g,
            score = best_score,
            threshold = bar,
            "round evaluated"
        );

        if best == round.current {
            self.rounds_with_better_channel = 0;
        } else if best_score > bar {
            self.rounds_with_better_channel += 1;
            info!(
                streak = self.rounds_with_better_channel,
                "a better channel keeps winning"
            );
        }

        round.entries[best].metric.rounds_as_best += 1;

        if self.rounds_with_better_channel >= self.rounds_for_csa {
            Some(best)
        } else {
            None
        }
    }

    fn post_switch(&mut self, _round: &mut RoundView<'_>) {
        self.rounds_with_better_channel = 0;
    }
}
