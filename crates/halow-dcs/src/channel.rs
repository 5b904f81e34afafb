//! Channel entries, metrics, and the sub-channel arithmetic behind scan
//! list admission and ECSA construction.

use chrono::{DateTime, Utc};

pub use halow_dcs_backend::commands::ChannelInfo;

/// Per-channel accumulated quality, updated by the scoring algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetric {
    /// Accumulated score; meaning depends on the active algorithm.
    pub accumulated_score: u32,
    /// Samples folded into the score so far. Monotonically non-decreasing.
    pub samples_taken: u32,
    /// Rounds this channel was considered the best.
    pub rounds_as_best: u32,
}

/// One permitted channel plus its accumulated metric.
///
/// The full channel set owns these; the scan list refers to them by index.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    /// Immutable channel parameters.
    pub info: ChannelInfo,
    /// Accumulated quality.
    pub metric: ChannelMetric,
}

impl ChannelEntry {
    /// Wraps a descriptor with a zeroed metric.
    pub fn new(info: ChannelInfo) -> Self {
        Self {
            info,
            metric: ChannelMetric::default(),
        }
    }
}

/// One channel measurement: the instantaneous quality of a channel at a
/// point in time. Produced by the driver's off-channel scan or synthesised
/// by the replay bank.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    /// When the measurement was received.
    pub captured_at: DateTime<Utc>,
    /// Throughput grading metric from the PHY, in `[0, 100]`.
    pub metric: u8,
    /// Noise RSSI in dBm.
    pub noise: i8,
    /// Listen time in microseconds.
    pub listen_time_us: u64,
    /// Receive time in microseconds.
    pub rx_time_us: u64,
}

/// Centre frequency of the primary sub-channel an operating channel would
/// keep, in kHz.
///
/// With a 1 MHz primary the centre sits 500 kHz above the bottom edge plus
/// the index; with a 2 MHz primary, index pairs share a centre 1 MHz above
/// each 2 MHz boundary. The centre must fall inside the channel; a
/// violation is a program error and panics.
pub fn primary_centre_khz(channel: &ChannelInfo, primary_width_mhz: u8, primary_index: u8) -> u32 {
    let half_width_khz = u32::from(channel.bandwidth_mhz) * 500;
    let bottom = channel.frequency_khz - half_width_khz;
    let top = channel.frequency_khz + half_width_khz;

    let centre = match primary_width_mhz {
        1 => bottom + u32::from(primary_index) * 1000 + 500,
        2 => bottom + u32::from(primary_index / 2) * 2000 + 1000,
        other => panic!("unsupported primary channel width {other} MHz"),
    };
    assert!(
        centre < top,
        "primary centre {centre} kHz falls outside channel {} ({} kHz, {} MHz)",
        channel.channel_s1g,
        channel.frequency_khz,
        channel.bandwidth_mhz,
    );
    centre
}

/// The `sec_channel_offset` an ECSA to `candidate` must carry to preserve
/// the current primary channel index.
pub fn sec_channel_offset(candidate: &ChannelInfo, primary_index: u8) -> i8 {
    if candidate.bandwidth_mhz == 1 {
        return 0;
    }
    // +1 for even indices (0, 2, 4, 6), -1 for odd (1, 3, 5, 7).
    if primary_index % 2 == 0 {
        1
    } else {
        -1
    }
}

/// Whether `candidate`'s derived primary sub-channel coincides with a
/// permitted channel. The permitted set already excludes channels disabled
/// by regulatory configuration.
pub fn primary_is_available(
    permitted: &[ChannelInfo],
    candidate: &ChannelInfo,
    primary_width_mhz: u8,
    primary_index: u8,
) -> bool {
    let centre = primary_centre_khz(candidate, primary_width_mhz, primary_index);
    permitted
        .iter()
        .any(|ch| ch.frequency_khz == centre && ch.bandwidth_mhz == primary_width_mhz)
}

/// Builds the scan list: indices of every permitted channel with the
/// current operating bandwidth whose primary sub-channel is itself
/// permitted.
pub fn build_scan_list(
    permitted: &[ChannelInfo],
    current_bandwidth_mhz: u8,
    primary_width_mhz: u8,
    primary_index: u8,
) -> Vec<usize> {
    permitted
        .iter()
        .enumerate()
        .filter(|(_, ch)| {
            ch.bandwidth_mhz == current_bandwidth_mhz
                && primary_is_available(permitted, ch, primary_width_mhz, primary_index)
        })
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(freq_khz: u32, s1g: u8, bw: u8) -> ChannelInfo {
        ChannelInfo {
            frequency_khz: freq_khz,
            channel_s1g: s1g,
            bandwidth_mhz: bw,
        }
    }

    #[test]
    fn primary_centre_one_mhz_index_zero() {
        // 4 MHz channel: bottom edge sits 2 MHz below centre.
        let ch = channel(915_500, 37, 4);
        assert_eq!(primary_centre_khz(&ch, 1, 0), 915_500 - 2000 + 500);
    }

    #[test]
    fn primary_centre_two_mhz_index_three() {
        let ch = channel(915_500, 37, 4);
        let bottom = 915_500 - 2000;
        assert_eq!(primary_centre_khz(&ch, 2, 3), bottom + 2000 + 1000);
    }

    #[test]
    fn primary_centre_walks_one_mhz_indices() {
        let ch = channel(915_500, 37, 4);
        let bottom = 915_500 - 2000;
        for index in 0..4 {
            assert_eq!(
                primary_centre_khz(&ch, 1, index),
                bottom + u32::from(index) * 1000 + 500
            );
        }
    }

    #[test]
    #[should_panic(expected = "outside channel")]
    fn primary_centre_beyond_top_edge_panics() {
        let ch = channel(902_500, 1, 1);
        primary_centre_khz(&ch, 2, 0);
    }

    #[test]
    fn sec_offset_rules() {
        let wide = channel(915_500, 37, 4);
        let narrow = channel(902_500, 1, 1);
        assert_eq!(sec_channel_offset(&narrow, 0), 0);
        assert_eq!(sec_channel_offset(&wide, 0), 1);
        assert_eq!(sec_channel_offset(&wide, 1), -1);
        assert_eq!(sec_channel_offset(&wide, 2), 1);
    }

    #[test]
    fn scan_list_filters_bandwidth_and_primary() {
        // Two 4 MHz channels with their 1 MHz primaries permitted, one
        // 4 MHz channel without a permitted primary, one 2 MHz channel.
        let permitted = vec![
            channel(915_500, 37, 4),
            channel(919_500, 45, 4),
            channel(923_500, 53, 4),
            channel(906_500, 9, 2),
            channel(914_000, 34, 1), // primary of 37 at index 0
            channel(918_000, 42, 1), // primary of 45 at index 0
        ];

        let list = build_scan_list(&permitted, 4, 1, 0);
        assert_eq!(list, vec![0, 1]);
    }

    #[test]
    fn scan_list_respects_primary_index() {
        let permitted = vec![
            channel(915_500, 37, 4),
            channel(914_000, 34, 1), // index 0 primary
        ];
        assert_eq!(build_scan_list(&permitted, 4, 1, 0), vec![0]);
        // Index 1 derives 915 000 kHz, which is not permitted.
        assert!(build_scan_list(&permitted, 4, 1, 1).is_empty());
    }
}
