//! Error types for the rendezvous engine.
//!
//! This module defines the error types that can occur when submitting or
//! consuming requests:
//!
//! - [`RendezvousError`]: The main error type encompassing all possible errors
//! - [`Result<T>`]: A convenience type alias for `std::result::Result<T, RendezvousError>`

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur when using a rendezvous queue or one of its items.
///
/// This enum uses `Arc<str>` for string fields to make cloning cheap, since
/// a single abort error is cloned into every drained request.
///
/// # Stability
///
/// This enum is marked `#[non_exhaustive]`, meaning new variants may be added
/// in future versions without a breaking change. When matching on this enum,
/// always include a wildcard arm (`_`) to handle unknown variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RendezvousError {
    /// A request was submitted without a value.
    #[error("Request must not be empty")]
    ArgumentNull,

    /// An item was used before it was initialized with a request.
    #[error("Request item is not initialized")]
    NotInitialized,

    /// An item was initialized a second time.
    #[error("Request item is already initialized")]
    AlreadyInitialized,

    /// A terminal method was called on an item that already finished.
    ///
    /// This also happens when the consumer answers an item whose producer
    /// already gave up on it.
    #[error("Request item is already finished")]
    AlreadyFinished,

    /// The caller's wait exceeded its timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The operation was cancelled.
    ///
    /// Returned when the caller's cancellation token fired first, when the
    /// consumer cancelled the item, or when a waiting consumer was dismissed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The consumer (or an administrative drain) aborted the request.
    #[error("Request aborted: {0}")]
    Aborted(Arc<str>),

    /// Every handle to the item was dropped without a terminal call.
    #[error("Request item was dropped without a response")]
    Abandoned,
}

impl RendezvousError {
    /// Builds an [`RendezvousError::Aborted`] error from a message.
    pub fn aborted(message: impl AsRef<str>) -> Self {
        RendezvousError::Aborted(Arc::from(message.as_ref()))
    }

    /// Returns true for the synthetic failures produced by the caller's own
    /// wait limits, as opposed to an outcome chosen by the other side.
    pub fn is_wait_failure(&self) -> bool {
        matches!(self, RendezvousError::Timeout | RendezvousError::Cancelled)
    }
}

/// A convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, RendezvousError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_message() {
        let err = RendezvousError::aborted("shutting down");
        assert_eq!(err.to_string(), "Request aborted: shutting down");
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_wait_failures() {
        assert!(RendezvousError::Timeout.is_wait_failure());
        assert!(RendezvousError::Cancelled.is_wait_failure());
        assert!(!RendezvousError::AlreadyFinished.is_wait_failure());
        assert!(!RendezvousError::aborted("x").is_wait_failure());
    }
}
