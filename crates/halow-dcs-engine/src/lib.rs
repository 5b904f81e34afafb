//! # HaLow DCS Engine
//!
//! The asynchronous event engine behind the DCS controller: a polling
//! scheduler that fires blocking requests on timers, and per-backend
//! dispatcher threads that pump unsolicited events and route them to
//! pattern monitors. See [`engine::Engine`].
//!
//! Also home to the [`halt::HaltSignal`] the daemon's root thread parks
//! on.

pub mod engine;
pub mod halt;

pub use engine::{Engine, EventCallback};
pub use halt::HaltSignal;
