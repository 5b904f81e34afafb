//! Sample-and-hold scoring.
//!
//! Accumulates raw metrics for `rounds_for_eval` rounds, then evaluates:
//! the highest-scoring channel wins a switch if its total clears the
//! comparison threshold over the current channel's, otherwise every score
//! resets and accumulation starts over. Between evaluation boundaries the
//! algorithm never proposes a switch.

use tracing::info;

use halow_dcs_core::SampleAndHoldConfig;

use super::{threshold, Algorithm, RoundView};
use crate::channel::{ChannelEntry, Measurement};

/// The sample-and-hold algorithm.
pub struct SampleAndHold {
    rounds_for_eval: u32,
    threshold_percentage: u8,
    num_full_scans: u32,
}

impl SampleAndHold {
    /// Builds the algorithm from its validated configuration.
    pub fn new(config: &SampleAndHoldConfig) -> Self {
        Self {
            rounds_for_eval: config.rounds_for_eval,
            threshold_percentage: config.threshold_percentage,
            num_full_scans: 0,
        }
    }
}

impl Algorithm for SampleAndHold {
    fn name(&self) -> &'static str {
        "sample_and_hold"
    }

    fn process_measurement(&mut self, sample: &Measurement, entry: &mut ChannelEntry) {
        entry.metric.accumulated_score += u32::from(sample.metric);
        entry.metric.samples_taken += 1;
    }

    fn evaluate(&mut self, round: &mut RoundView<'_>) -> Option<usize> {
        let best = round.best_index()?;
        round.entries[best].metric.rounds_as_best += 1;
        self.num_full_scans += 1;

        if self.num_full_scans % self.rounds_for_eval != 0 {
            return None;
        }

        let best_metric = round.entries[best].metric;
        let bar = threshold(round.current_score(), self.threshold_percentage);
        info!(
            best = round.entries[best].info.channel_s1g,
            avg_metric = best_metric.accumulated_score / best_metric.samples_taken.max(1),
            accumulated = best_metric.accumulated_score,
            threshold = bar,
            "evaluation boundary"
        );

        if best_metric.accumulated_score > bar {
            Some(best)
        } else {
            round.reset_scores(0);
            None
        }
    }

    fn post_switch(&mut self, round: &mut RoundView<'_>) {
        round.reset_scores(0);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{entries, sample};
    use super::*;

    fn algo(rounds_for_eval: u32, pct: u8) -> SampleAndHold {
        SampleAndHold::new(&SampleAndHoldConfig {
            rounds_for_eval,
            threshold_percentage: pct,
            sec_per_scan: 1,
            sec_per_round: 1,
        })
    }

    #[test]
    fn accumulation_sums_raw_metrics() {
        let mut sh = algo(3, 20);
        let mut set = entries(&[902_500]);
        sh.process_measurement(&sample(40), &mut set[0]);
        sh.process_measurement(&sample(35), &mut set[0]);
        assert_eq!(set[0].metric.accumulated_score, 75);
        assert_eq!(set[0].metric.samples_taken, 2);
    }

    /// With `rounds_for_eval = 3` and a 20% threshold, two
    /// rounds favouring the current channel followed by one favouring a
    /// rival with totals 100 vs 130 switch at the third round boundary.
    #[test]
    fn switch_only_at_evaluation_boundary() {
        let mut sh = algo(3, 20);
        let mut set = entries(&[902_500, 906_500]);
        let scan = [0, 1];

        // Rounds 1 and 2: current (A) ahead; no evaluation happens.
        for round_number in 1..=2 {
            sh.process_measurement(&sample(40), &mut set[0]);
            sh.process_measurement(&sample(30), &mut set[1]);
            let mut round = RoundView {
                entries: &mut set,
                scan_list: &scan,
                current: 0,
            };
            assert_eq!(sh.evaluate(&mut round), None, "round {round_number}");
        }

        // Round 3: B pulls ahead, totals A=100 and B=130.
        sh.process_measurement(&sample(20), &mut set[0]);
        sh.process_measurement(&sample(70), &mut set[1]);
        assert_eq!(set[0].metric.accumulated_score, 100);
        assert_eq!(set[1].metric.accumulated_score, 130);

        let mut round = RoundView {
            entries: &mut set,
            scan_list: &scan,
            current: 0,
        };
        // threshold(100, 20) = 120 < 130: switch fires.
        assert_eq!(sh.evaluate(&mut round), Some(1));
    }

    #[test]
    fn below_threshold_resets_all_scores() {
        let mut sh = algo(1, 50);
        let mut set = entries(&[902_500, 906_500]);
        let scan = [0, 1];
        sh.process_measurement(&sample(60), &mut set[0]);
        sh.process_measurement(&sample(80), &mut set[1]);

        let mut round = RoundView {
            entries: &mut set,
            scan_list: &scan,
            current: 0,
        };
        // threshold(60, 50) = 90 > 80: hold, and scores reset.
        assert_eq!(sh.evaluate(&mut round), None);
        assert!(set.iter().all(|e| e.metric.accumulated_score == 0));
        assert!(set.iter().all(|e| e.metric.samples_taken == 0));
    }

    #[test]
    fn rounds_as_best_accrues_every_round() {
        let mut sh = algo(3, 20);
        let mut set = entries(&[902_500, 906_500]);
        let scan = [0, 1];
        for _ in 0..3 {
            sh.process_measurement(&sample(50), &mut set[0]);
            sh.process_measurement(&sample(10), &mut set[1]);
            let mut round = RoundView {
                entries: &mut set,
                scan_list: &scan,
                current: 0,
            };
            sh.evaluate(&mut round);
        }
        assert_eq!(set[0].metric.rounds_as_best, 3);
        assert_eq!(set[1].metric.rounds_as_best, 0);
    }

    #[test]
    fn post_switch_resets_scores() {
        let mut sh = algo(3, 20);
        let mut set = entries(&[902_500, 906_500]);
        let scan = [0, 1];
        sh.process_measurement(&sample(50), &mut set[0]);

        let mut round = RoundView {
            entries: &mut set,
            scan_list: &scan,
            current: 0,
        };
        sh.post_switch(&mut round);
        assert!(set.iter().all(|e| e.metric.accumulated_score == 0));
    }
}
