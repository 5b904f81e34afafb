//! Wire formats for the chip's vendor command set.
//!
//! Everything here is a fixed little-endian layout encoded and decoded by
//! hand over byte slices. Decoders are length-checked and return a
//! protocol error rather than panicking on short input; the driver is on
//! the other side of a kernel interface and gets no benefit of the doubt.

use halow_dcs_core::BackendError;

/// Vendor message id: enumerate the channels permitted by the regulatory
/// configuration.
pub const CMD_GET_AVAILABLE_CHANNELS: u16 = 0x002a;

/// Vendor message id: drive an off-channel scan.
pub const CMD_OCS_DRIVER: u16 = 0x003d;

/// `OCS_DRIVER` operation selector carried in the request payload.
pub const OCS_SUBCMD_DRIVER: u32 = 1;

/// One permitted operating channel as reported by the chip.
///
/// Immutable after initialisation; the scheduler clones these into its
/// channel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Centre frequency in kHz.
    pub frequency_khz: u32,
    /// S1G channel number.
    pub channel_s1g: u8,
    /// Channel width in MHz (1, 2, 4, or 8).
    pub bandwidth_mhz: u8,
}

impl ChannelInfo {
    /// Encoded size on the wire.
    pub const WIRE_LEN: usize = 6;

    fn decode(data: &[u8]) -> Result<Self, BackendError> {
        if data.len() < Self::WIRE_LEN {
            return Err(BackendError::protocol(
                "vendor",
                format!("channel record needs {} bytes, got {}", Self::WIRE_LEN, data.len()),
            ));
        }
        Ok(Self {
            frequency_khz: u32::from_le_bytes(data[0..4].try_into().expect("sized")),
            channel_s1g: data[4],
            bandwidth_mhz: data[5],
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.frequency_khz.to_le_bytes());
        out.push(self.channel_s1g);
        out.push(self.bandwidth_mhz);
    }
}

/// Decodes the `GET_AVAILABLE_CHANNELS` response payload:
/// `{num_channels: u32 LE, channels[]}`.
pub fn decode_available_channels(data: &[u8]) -> Result<Vec<ChannelInfo>, BackendError> {
    let count = data
        .get(..4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("sized")))
        .ok_or_else(|| BackendError::protocol("vendor", "channel list shorter than its header"))?
        as usize;

    let records = &data[4..];
    if records.len() < count * ChannelInfo::WIRE_LEN {
        return Err(BackendError::protocol(
            "vendor",
            format!(
                "channel list claims {count} channels but carries {} bytes",
                records.len()
            ),
        ));
    }

    (0..count)
        .map(|i| ChannelInfo::decode(&records[i * ChannelInfo::WIRE_LEN..]))
        .collect()
}

/// Encodes a `GET_AVAILABLE_CHANNELS` response. Test-side counterpart of
/// [`decode_available_channels`].
pub fn encode_available_channels(channels: &[ChannelInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + channels.len() * ChannelInfo::WIRE_LEN);
    out.extend_from_slice(&(channels.len() as u32).to_le_bytes());
    for channel in channels {
        channel.encode_into(&mut out);
    }
    out
}

/// `OCS_DRIVER` request payload: which channel to sample and the primary
/// sub-channel to keep servicing while off-channel.
#[derive(Debug, Clone, Copy)]
pub struct OcsDriverRequest {
    /// Centre frequency of the channel to sample, in Hz.
    pub op_channel_freq_hz: u32,
    /// Width of the channel to sample, in MHz.
    pub op_channel_bw_mhz: u8,
    /// Operating primary channel width, in MHz.
    pub pri_channel_bw_mhz: u8,
    /// Operating primary 1 MHz sub-channel index.
    pub pri_1mhz_channel_index: u8,
}

impl OcsDriverRequest {
    /// Encodes the request payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11);
        out.extend_from_slice(&OCS_SUBCMD_DRIVER.to_le_bytes());
        out.extend_from_slice(&self.op_channel_freq_hz.to_le_bytes());
        out.push(self.op_channel_bw_mhz);
        out.push(self.pri_channel_bw_mhz);
        out.push(self.pri_1mhz_channel_index);
        out
    }
}

/// `OCS_DONE` vendor event payload: the result of one off-channel scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcsDoneEvent {
    /// Throughput grading metric from the PHY, 0 (unusable) to 100 (clear).
    pub metric: u8,
    /// Noise RSSI in dBm.
    pub noise: i8,
    /// Time spent listening, in microseconds.
    pub time_listen_us: u64,
    /// Time spent receiving foreign traffic, in microseconds.
    pub time_rx_us: u64,
}

impl OcsDoneEvent {
    /// Encoded size on the wire.
    pub const WIRE_LEN: usize = 18;

    /// Decodes the event payload.
    ///
    /// # Errors
    ///
    /// A protocol error when the payload is shorter than [`Self::WIRE_LEN`].
    pub fn decode(data: &[u8]) -> Result<Self, BackendError> {
        if data.len() < Self::WIRE_LEN {
            return Err(BackendError::protocol(
                "vendor",
                format!("OCS done event needs {} bytes, got {}", Self::WIRE_LEN, data.len()),
            ));
        }
        Ok(Self {
            metric: data[0],
            noise: data[1] as i8,
            time_listen_us: u64::from_le_bytes(data[2..10].try_into().expect("sized")),
            time_rx_us: u64::from_le_bytes(data[10..18].try_into().expect("sized")),
        })
    }

    /// Encodes the event payload. Test-side counterpart of [`Self::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.push(self.metric);
        out.push(self.noise as u8);
        out.extend_from_slice(&self.time_listen_us.to_le_bytes());
        out.extend_from_slice(&self.time_rx_us.to_le_bytes());
        out
    }
}

/// Record flag: this record is a request.
pub(crate) const RECORD_FLAG_REQUEST: u16 = 0x0001;

const RECORD_HDR_LEN: usize = 6;

/// Frames one vendor subcommand record:
/// `{message_id, length, flags = REQUEST, payload}`.
pub(crate) fn encode_record(message_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HDR_LEN + payload.len());
    out.extend_from_slice(&message_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&RECORD_FLAG_REQUEST.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// A decoded vendor response record:
/// `{message_id, length, flags, status: i16 LE, data[length]}`.
#[derive(Debug, Clone)]
pub(crate) struct ResponseRecord {
    pub message_id: u16,
    pub status: i16,
    pub data: Vec<u8>,
}

impl ResponseRecord {
    pub(crate) fn decode(data: &[u8]) -> Result<Self, BackendError> {
        if data.len() < RECORD_HDR_LEN + 2 {
            return Err(BackendError::protocol(
                "vendor",
                format!("response record needs {} bytes, got {}", RECORD_HDR_LEN + 2, data.len()),
            ));
        }
        let message_id = u16::from_le_bytes(data[0..2].try_into().expect("sized"));
        let length = u16::from_le_bytes(data[2..4].try_into().expect("sized")) as usize;
        let status = i16::from_le_bytes(data[6..8].try_into().expect("sized"));
        let body = &data[8..];
        if body.len() < length {
            return Err(BackendError::protocol(
                "vendor",
                format!("response record claims {length} data bytes but carries {}", body.len()),
            ));
        }
        Ok(Self {
            message_id,
            status,
            data: body[..length].to_vec(),
        })
    }
}
