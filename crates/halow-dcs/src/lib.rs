//! # HaLow DCS
//!
//! Dynamic channel selection for Wi-Fi HaLow (802.11ah) access points.
//!
//! The controller continuously measures the quality of every permitted
//! operating channel through driver-assisted off-channel scans, feeds the
//! measurements to a pluggable scoring algorithm, and, once a
//! sufficiently better channel keeps winning, migrates the AP and all
//! associated stations to it via an Extended Channel Switch Announcement.
//!
//! - [`scheduler::Dcs`] is the controller: one instance per radio,
//!   created against a [`Config`](halow_dcs_core::Config) and an
//!   [`Engine`](halow_dcs_engine::Engine).
//! - [`algo`] holds the scoring algorithms (EWMA, sample-and-hold).
//! - [`switch`] coordinates the ECSA and its completion event.
//! - [`replay`] substitutes recorded CSV measurements for live scans.

pub mod algo;
pub mod channel;
pub mod replay;
pub mod scheduler;
pub mod switch;

pub use scheduler::{Backends, Dcs};
pub use switch::SwitchOutcome;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
