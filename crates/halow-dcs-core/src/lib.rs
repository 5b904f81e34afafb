//! # HaLow DCS Core
//!
//! Core types, traits, and configuration for the HaLow dynamic channel
//! selection controller.
//!
//! This crate provides the foundational building blocks shared by the
//! backends, the event engine, and the DCS module:
//!
//! - **Data-item tree**: the self-describing [`DataItem`] result format
//!   every backend returns, with the [`ItemLookup`] helpers the controller
//!   navigates it with.
//!
//! - **Backend contract**: the [`Backend`] trait each transport (AP control
//!   socket, nl80211 netlink, vendor commands) implements.
//!
//! - **Errors**: the [`error`] module's `thiserror` hierarchy, split into
//!   recoverable transport failures and fatal configuration errors.
//!
//! - **Configuration**: the serde-backed [`Config`] object with startup
//!   validation.
//!
//! - **Data-log sinks**: per-run append-only trace files behind the
//!   [`LogSink`] interface.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod datalog;
pub mod error;
pub mod item;
pub mod time;

pub use backend::Backend;
pub use config::{AlgoType, Config, DatalogConfig, DcsConfig, EwmaConfig, SampleAndHoldConfig};
pub use datalog::{DataLogFactory, LogSink, NullSink};
pub use error::{BackendError, ConfigError, DcsError, DcsResult};
pub use item::{DataItem, ItemList, ItemLookup, Key};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_populated() {
        assert!(!VERSION.is_empty());
    }
}
