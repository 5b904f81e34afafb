//! Vendor-command backend: OUI-scoped chip commands over nl80211.
//!
//! Wraps an owned [`Nl80211Backend`] and carries batched vendor subcommand
//! records through `NL80211_CMD_VENDOR`. Each record in a request becomes
//! one netlink command; the batch runs to completion even when individual
//! records fail, and the first failure is reported afterwards.
//!
//! This backend is request-only. Vendor *events* arrive on the nl80211
//! event socket (the `vendor` multicast group) and are dispatched by the
//! engine; [`is_ocs_done_event`] is the filter the DCS core applies there.

use std::ffi::CString;
use std::io;
use std::sync::Arc;

use tracing::warn;

use halow_dcs_core::{Backend, BackendError, DataItem, ItemList, ItemLookup, Key, LogSink};

use crate::commands::{encode_record, ResponseRecord};
use crate::nl80211::{
    Nl80211Backend, NlRequest, NL80211_ATTR_IFINDEX, NL80211_ATTR_VENDOR_DATA,
    NL80211_ATTR_VENDOR_ID, NL80211_ATTR_VENDOR_SUBCMD, NL80211_CMD_VENDOR,
};

/// The chip vendor's OUI.
pub const VENDOR_OUI: u32 = 0x0cbf74;

/// Vendor subcommand carrying batched command records.
pub const VENDOR_SUBCMD_COMMAND: u32 = 0;

/// Vendor event: an off-channel scan finished.
pub const VENDOR_EVENT_OCS_DONE: u32 = 1;

/// Attribute wrapping the event payload inside `VENDOR_DATA`.
pub const VENDOR_ATTR_DATA: u32 = 0;

/// Typed builder for a batched vendor request.
///
/// ```rust
/// use halow_dcs_backend::vendor::VendorRequest;
/// use halow_dcs_backend::commands::CMD_GET_AVAILABLE_CHANNELS;
///
/// let request = VendorRequest::new()
///     .command(CMD_GET_AVAILABLE_CHANNELS, &[])
///     .build();
/// assert_eq!(request.len(), 1);
/// ```
#[derive(Default)]
pub struct VendorRequest {
    items: ItemList,
}

impl VendorRequest {
    /// Starts an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one subcommand record.
    #[must_use]
    pub fn command(mut self, message_id: u16, payload: &[u8]) -> Self {
        self.items.push(DataItem::with_bytes(
            u32::from(message_id),
            encode_record(message_id, payload),
        ));
        self
    }

    /// Finishes the request tree.
    pub fn build(self) -> ItemList {
        self.items
    }
}

/// The vendor-command backend.
pub struct VendorBackend {
    nl80211: Nl80211Backend,
    ifname: String,
    sink: Arc<dyn LogSink>,
}

impl VendorBackend {
    /// Creates a vendor backend for `ifname`, owning a private nl80211
    /// backend for its command traffic.
    pub fn new(ifname: impl Into<String>, sink: Arc<dyn LogSink>, nl_sink: Arc<dyn LogSink>) -> Self {
        Self {
            nl80211: Nl80211Backend::new(nl_sink),
            ifname: ifname.into(),
            sink,
        }
    }

    /// Resolves the interface index, per request so interface re-creation
    /// is picked up.
    fn ifindex(&self) -> Result<u32, BackendError> {
        let name = CString::new(self.ifname.as_str())
            .map_err(|_| BackendError::protocol("vendor", "interface name contains NUL"))?;
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(BackendError::io(
                "vendor",
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such interface: {}", self.ifname),
                ),
            ));
        }
        Ok(index)
    }
}

impl Backend for VendorBackend {
    fn name(&self) -> &'static str {
        "vendor"
    }

    fn submit_blocking(&self, request: &ItemList) -> Result<ItemList, BackendError> {
        let ifindex = self.ifindex()?;
        let mut result = ItemList::new();
        let mut first_failure: Option<BackendError> = None;

        for record in request {
            let message_id = match &record.key {
                Key::U32(message_id) => *message_id,
                Key::Str(_) => {
                    return Err(BackendError::protocol(
                        "vendor",
                        "records must be keyed by message id",
                    ))
                }
            };
            let record_bytes = record.value_bytes().ok_or_else(|| {
                BackendError::protocol("vendor", "record carries no encoded body")
            })?;

            if self.sink.is_enabled() {
                self.sink
                    .write_line(&format!("Tx cmd {message_id:#06x} ({} bytes)", record_bytes.len()));
            }

            let nl_request = NlRequest::new(NL80211_CMD_VENDOR, 0)
                .attr_u32(NL80211_ATTR_IFINDEX, ifindex)
                .attr_u32(NL80211_ATTR_VENDOR_ID, VENDOR_OUI)
                .attr_u32(NL80211_ATTR_VENDOR_SUBCMD, VENDOR_SUBCMD_COMMAND)
                .attr_bytes(NL80211_ATTR_VENDOR_DATA, record_bytes)
                .build();

            let reply = self.nl80211.submit_blocking(&nl_request)?;
            let Some(data) = reply
                .first()
                .and_then(|entry| entry.children.find_u32(NL80211_ATTR_VENDOR_DATA))
                .and_then(DataItem::value_bytes)
            else {
                warn!(command = message_id, "vendor reply carries no data attribute");
                continue;
            };

            let response = ResponseRecord::decode(data)?;
            if response.status != 0 {
                warn!(
                    command = response.message_id,
                    status = response.status,
                    "vendor command failed"
                );
                if first_failure.is_none() {
                    first_failure = Some(BackendError::CommandFailed {
                        command: u32::from(response.message_id),
                        status: i32::from(response.status),
                    });
                }
                result.push(DataItem::new(u32::from(response.message_id)));
                continue;
            }

            result.push(DataItem::with_bytes(
                u32::from(response.message_id),
                response.data,
            ));
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(result),
        }
    }
}

/// Whether a parsed nl80211 event is this vendor's OCS-done notification.
pub fn is_ocs_done_event(event: &[DataItem]) -> bool {
    let vendor_id = event
        .find_path(&[NL80211_CMD_VENDOR, NL80211_ATTR_VENDOR_ID])
        .and_then(DataItem::value_u32);
    let subcmd = event
        .find_path(&[NL80211_CMD_VENDOR, NL80211_ATTR_VENDOR_SUBCMD])
        .and_then(DataItem::value_u32);

    vendor_id == Some(VENDOR_OUI) && subcmd == Some(VENDOR_EVENT_OCS_DONE)
}

/// Extracts the OCS-done payload bytes from a parsed nl80211 vendor event.
pub fn ocs_done_payload(event: &[DataItem]) -> Option<&[u8]> {
    event
        .find_path(&[NL80211_CMD_VENDOR, NL80211_ATTR_VENDOR_DATA, VENDOR_ATTR_DATA])
        .and_then(DataItem::value_bytes)
}
