//! The backend abstraction: the contract every transport implements.
//!
//! A backend hides one transport (the AP control socket, the nl80211
//! generic-netlink layer, or the vendor-command wrapper) behind two
//! operations:
//!
//! - [`Backend::submit_blocking`]: send a pre-parsed request tree, block
//!   until the parsed response tree is available.
//! - [`Backend::pump_async`]: wait up to a bounded timeout for one
//!   unsolicited event frame.
//!
//! A transport implements the directions it actually has; the default
//! bodies refuse with [`BackendError::NotSupported`]. A backend overriding
//! neither is not a backend.
//!
//! Requests are built with per-backend typed builders (a text line for the
//! control socket, `NlRequest` for netlink, `VendorRequest` for vendor
//! batches) which all produce the same pre-parsed [`ItemList`] shape, so
//! the engine's submit path stays generic.

use std::time::Duration;

use crate::error::BackendError;
use crate::item::ItemList;

/// A transport capable of carrying requests, events, or both.
///
/// Implementations must be shareable across the scheduler thread and the
/// engine's worker threads, hence `Send + Sync`; interior state (lazily
/// opened event sockets, trace sinks) is the backend's own concern.
pub trait Backend: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Sends a pre-parsed request and returns the parsed response.
    ///
    /// May block the calling thread for as long as the transport needs; no
    /// upper bound is imposed here.
    ///
    /// # Errors
    ///
    /// [`BackendError::NotSupported`] when this backend has no blocking
    /// request path, otherwise whatever the transport surfaces.
    fn submit_blocking(&self, request: &ItemList) -> Result<ItemList, BackendError> {
        let _ = request;
        Err(BackendError::NotSupported {
            backend: self.name(),
            operation: "submit_blocking",
        })
    }

    /// Waits up to `timeout` for one unsolicited event frame.
    ///
    /// Returns `Ok(None)` when the timeout elapses without an event. The
    /// engine's dispatchers call this with a one-second bound so shutdown
    /// is never delayed longer than that.
    ///
    /// # Errors
    ///
    /// [`BackendError::NotSupported`] when this backend has no asynchronous
    /// reception path, otherwise whatever the transport surfaces.
    fn pump_async(&self, timeout: Duration) -> Result<Option<ItemList>, BackendError> {
        let _ = timeout;
        Err(BackendError::NotSupported {
            backend: self.name(),
            operation: "pump_async",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EventOnly;

    impl Backend for EventOnly {
        fn name(&self) -> &'static str {
            "event-only"
        }

        fn pump_async(&self, _timeout: Duration) -> Result<Option<ItemList>, BackendError> {
            Ok(None)
        }
    }

    #[test]
    fn unimplemented_direction_refuses() {
        let backend = EventOnly;
        let err = backend.submit_blocking(&Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            BackendError::NotSupported {
                backend: "event-only",
                operation: "submit_blocking",
            }
        ));
        assert!(backend
            .pump_async(Duration::from_secs(1))
            .unwrap()
            .is_none());
    }
}
