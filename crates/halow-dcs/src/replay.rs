//! File-backed measurement replay.
//!
//! Loads a CSV of recorded measurements (the same format the DCS data log
//! writes) and serves them back to the scheduler in place of live
//! off-channel scans. Samples queue per channel in file order; the first
//! row's `current_channel` column names the initial operating channel.
//! When the last sample across all channels has been consumed the
//! scheduler halts the process cleanly.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use tracing::debug;

use halow_dcs_core::time::parse_csv_timestamp;
use halow_dcs_core::{DcsError, DcsResult};

use crate::channel::{ChannelInfo, Measurement};

/// The exact header the replay file must carry; it is what the DCS data
/// log emits.
pub const CSV_HEADER: &str = "time,frequency_khz,bandwidth_mhz,channel_s1g,metric,\
accumulated_score,rounds_as_best_for_channel,current_channel";

/// Samples for one channel, consumed front to back.
#[derive(Debug)]
struct ChannelQueue {
    info: ChannelInfo,
    samples: VecDeque<Measurement>,
}

/// The loaded sample bank.
#[derive(Debug)]
pub struct ReplayBank {
    queues: Vec<ChannelQueue>,
    initial_channel_s1g: u8,
}

impl ReplayBank {
    /// Loads a replay file.
    ///
    /// # Errors
    ///
    /// [`DcsError::Replay`] when the file cannot be read, the header does
    /// not match [`CSV_HEADER`], any row is malformed, or no rows exist.
    pub fn load(path: &Path) -> DcsResult<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| DcsError::replay(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    /// Parses replay CSV contents. Split from [`Self::load`] for tests.
    pub fn parse(contents: &str) -> DcsResult<Self> {
        let mut lines = contents.lines();
        let header = lines
            .next()
            .ok_or_else(|| DcsError::replay("sample file is empty"))?;
        if header.trim() != CSV_HEADER {
            return Err(DcsError::replay(format!(
                "unexpected CSV header: {header}"
            )));
        }

        let mut bank = Self {
            queues: Vec::new(),
            initial_channel_s1g: 0,
        };

        for (line_number, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (info, measurement, current_channel) = parse_row(line).map_err(|message| {
                DcsError::replay(format!("line {}: {message}", line_number + 2))
            })?;

            if bank.initial_channel_s1g == 0 {
                bank.initial_channel_s1g = current_channel;
            }
            bank.push(info, measurement);
        }

        if bank.queues.is_empty() {
            return Err(DcsError::replay("sample file carries no measurements"));
        }
        debug!(
            channels = bank.queues.len(),
            initial = bank.initial_channel_s1g,
            "replay bank loaded"
        );
        Ok(bank)
    }

    fn push(&mut self, info: ChannelInfo, measurement: Measurement) {
        match self
            .queues
            .iter_mut()
            .find(|q| q.info.frequency_khz == info.frequency_khz)
        {
            Some(queue) => queue.samples.push_back(measurement),
            None => {
                let mut samples = VecDeque::new();
                samples.push_back(measurement);
                self.queues.push(ChannelQueue { info, samples });
            }
        }
    }

    /// The S1G channel number the recording started on.
    pub fn initial_channel_s1g(&self) -> u8 {
        self.initial_channel_s1g
    }

    /// Every channel the file carries samples for, in first-seen order.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.queues.iter().map(|q| q.info).collect()
    }

    /// Pops the next sample for the channel at `frequency_khz`. Returns
    /// `None` when that channel has no samples left.
    pub fn pop(&mut self, frequency_khz: u32) -> Option<Measurement> {
        self.queues
            .iter_mut()
            .find(|q| q.info.frequency_khz == frequency_khz)?
            .samples
            .pop_front()
    }

    /// Whether every channel's queue has drained.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.samples.is_empty())
    }
}

/// Parses one data row into the channel it measures, the measurement, and
/// the `current_channel` column.
fn parse_row(line: &str) -> Result<(ChannelInfo, Measurement, u8), String> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 8 {
        return Err(format!("expected 8 fields, got {}", fields.len()));
    }

    let captured_at =
        parse_csv_timestamp(fields[0]).ok_or_else(|| format!("bad timestamp '{}'", fields[0]))?;
    let frequency_khz: u32 = parse_field(fields[1], "frequency_khz")?;
    let bandwidth_mhz: u8 = parse_field(fields[2], "bandwidth_mhz")?;
    let channel_s1g: u8 = parse_field(fields[3], "channel_s1g")?;
    let metric: u8 = parse_field(fields[4], "metric")?;
    // Fields 5 and 6 (accumulated score, rounds-as-best) are outputs of
    // the original run, not inputs.
    let current_channel: u8 = parse_field(fields[7], "current_channel")?;

    let info = ChannelInfo {
        frequency_khz,
        channel_s1g,
        bandwidth_mhz,
    };
    let measurement = Measurement {
        captured_at,
        metric,
        noise: 0,
        listen_time_us: 0,
        rx_time_us: 0,
    };
    Ok((info, measurement, current_channel))
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, String> {
    field
        .trim()
        .parse()
        .map_err(|_| format!("bad {name} '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> String {
        format!(
            "{CSV_HEADER}\n\
             2024-03-09T10:00:00.00,902500,1,1,80,80,0,1\n\
             2024-03-09T10:00:05.00,906500,1,9,70,70,0,1\n\
             2024-03-09T10:00:10.00,902500,1,1,82,162,1,1\n\
             2024-03-09T10:00:15.00,906500,1,9,75,145,0,1\n"
        )
    }

    #[test]
    fn loads_per_channel_queues_in_order() {
        let mut bank = ReplayBank::parse(&sample_file()).unwrap();
        assert_eq!(bank.initial_channel_s1g(), 1);
        assert_eq!(bank.channels().len(), 2);

        let first = bank.pop(902_500).unwrap();
        assert_eq!(first.metric, 80);
        let second = bank.pop(902_500).unwrap();
        assert_eq!(second.metric, 82);
        assert!(bank.pop(902_500).is_none());
    }

    #[test]
    fn exhaustion_is_observable() {
        let mut bank = ReplayBank::parse(&sample_file()).unwrap();
        assert!(!bank.is_empty());
        while bank.pop(902_500).is_some() {}
        while bank.pop(906_500).is_some() {}
        assert!(bank.is_empty());
    }

    #[test]
    fn unknown_frequency_pops_nothing() {
        let mut bank = ReplayBank::parse(&sample_file()).unwrap();
        assert!(bank.pop(999_999).is_none());
    }

    #[test]
    fn header_mismatch_is_rejected() {
        let err = ReplayBank::parse("time,frequency\n").unwrap_err();
        assert!(err.to_string().contains("header"));
    }

    #[test]
    fn malformed_row_is_rejected() {
        let contents = format!("{CSV_HEADER}\nnot-a-time,902500,1,1,80,80,0,1\n");
        let err = ReplayBank::parse(&contents).unwrap_err();
        assert!(err.to_string().contains("line 2"));

        let contents = format!("{CSV_HEADER}\n2024-03-09T10:00:00.00,902500,1,1\n");
        assert!(ReplayBank::parse(&contents).is_err());
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(ReplayBank::parse("").is_err());
        assert!(ReplayBank::parse(&format!("{CSV_HEADER}\n")).is_err());
    }
}
