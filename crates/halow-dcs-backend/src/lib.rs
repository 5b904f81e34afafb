//! # HaLow DCS Backends
//!
//! Transport backends for the HaLow DCS controller:
//!
//! - [`hostapd::HostapdBackend`]: text request/response and unsolicited
//!   events over the AP's control socket.
//! - [`nl80211::Nl80211Backend`]: generic-netlink commands and multicast
//!   events to the kernel 802.11 configuration layer.
//! - [`vendor::VendorBackend`]: OUI-scoped chip commands layered on
//!   nl80211, with batched subcommand records.
//!
//! All three implement the [`Backend`](halow_dcs_core::Backend) contract
//! and return the shared data-item tree, so the engine and the DCS module
//! never see transport details. [`commands`] holds the chip's vendor wire
//! formats.

pub mod commands;
pub mod hostapd;
pub mod nl80211;
pub mod vendor;

pub use hostapd::{text_request, HostapdBackend};
pub use nl80211::{Nl80211Backend, NlRequest};
pub use vendor::{VendorBackend, VendorRequest};
