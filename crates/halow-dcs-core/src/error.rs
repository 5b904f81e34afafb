//! Error types for the DCS controller.
//!
//! # Error Hierarchy
//!
//! - [`DcsError`]: top-level error type for the controller
//! - [`BackendError`]: transport failures (control socket, netlink, vendor)
//! - [`ConfigError`]: invalid or missing configuration, fatal at startup
//!
//! Transient conditions (an I/O hiccup, an empty reply, one failed vendor
//! command) report `is_recoverable() == true`; the scheduler retries them at
//! its next natural boundary. Everything else is either fatal at startup or
//! a programming error.

use thiserror::Error;

/// A specialized `Result` for DCS operations.
pub type DcsResult<T> = Result<T, DcsError>;

/// Top-level error type for the DCS controller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DcsError {
    /// A backend transport failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Channel initialisation failed: the current channel could not be
    /// resolved against the permitted set, or the scan list filtered empty.
    #[error("channel setup failed: {message}")]
    ChannelSetup {
        /// What went wrong.
        message: String,
    },

    /// The AP never became ready within the bounded startup retries.
    #[error("access point not ready: {message}")]
    ApNotReady {
        /// What was waited for.
        message: String,
    },

    /// The replay sample file could not be loaded.
    #[error("replay error: {message}")]
    Replay {
        /// What went wrong.
        message: String,
    },
}

impl DcsError {
    /// Creates a channel-setup error.
    #[must_use]
    pub fn channel_setup(message: impl Into<String>) -> Self {
        Self::ChannelSetup {
            message: message.into(),
        }
    }

    /// Creates an AP-not-ready error.
    #[must_use]
    pub fn ap_not_ready(message: impl Into<String>) -> Self {
        Self::ApNotReady {
            message: message.into(),
        }
    }

    /// Creates a replay error.
    #[must_use]
    pub fn replay(message: impl Into<String>) -> Self {
        Self::Replay {
            message: message.into(),
        }
    }
}

/// Errors surfaced by backend transports.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// The underlying socket operation failed.
    #[error("I/O error on {backend} backend: {source}")]
    Io {
        /// Which backend failed.
        backend: &'static str,
        /// The socket error.
        #[source]
        source: std::io::Error,
    },

    /// The backend does not implement the requested direction.
    #[error("{backend} backend does not support {operation}")]
    NotSupported {
        /// Which backend was asked.
        backend: &'static str,
        /// The unsupported operation.
        operation: &'static str,
    },

    /// A frame arrived that could not be parsed.
    #[error("protocol error on {backend} backend: {message}")]
    Protocol {
        /// Which backend failed.
        backend: &'static str,
        /// What was malformed.
        message: String,
    },

    /// A vendor subcommand completed with a non-zero status.
    #[error("vendor command {command:#06x} failed with status {status}")]
    CommandFailed {
        /// The vendor message id.
        command: u32,
        /// The status reported by the driver.
        status: i32,
    },

    /// The generic netlink family is not present on this kernel.
    #[error("generic netlink family '{family}' not found")]
    FamilyNotFound {
        /// The family name that failed to resolve.
        family: String,
    },

    /// The transport answered with nothing where a reply was required.
    #[error("empty response from {backend} backend")]
    EmptyResponse {
        /// Which backend answered empty.
        backend: &'static str,
    },
}

impl BackendError {
    /// Wraps a socket error.
    #[must_use]
    pub fn io(backend: &'static str, source: std::io::Error) -> Self {
        Self::Io { backend, source }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            backend,
            message: message.into(),
        }
    }

    /// Returns `true` if the operation may succeed on a later attempt.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. }
            | Self::Protocol { .. }
            | Self::CommandFailed { .. }
            | Self::EmptyResponse { .. } => true,
            Self::NotSupported { .. } | Self::FamilyNotFound { .. } => false,
        }
    }
}

/// Configuration errors, all fatal at startup.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing configuration key '{key}'")]
    MissingKey {
        /// The dotted path of the missing key.
        key: &'static str,
    },

    /// A value is present but outside its permitted range.
    #[error("configuration value '{key}' out of range: {message}")]
    OutOfRange {
        /// The dotted path of the offending key.
        key: &'static str,
        /// The permitted range and the actual value.
        message: String,
    },

    /// `dcs.algo_type` names an algorithm this build does not provide.
    #[error("unknown algorithm '{name}'")]
    UnknownAlgorithm {
        /// The unrecognised algorithm name.
        name: String,
    },
}

impl ConfigError {
    /// Creates an out-of-range error.
    #[must_use]
    pub fn out_of_range(key: &'static str, message: impl Into<String>) -> Self {
        Self::OutOfRange {
            key,
            message: message.into(),
        }
    }
}
