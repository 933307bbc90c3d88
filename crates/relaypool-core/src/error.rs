//! Core domain errors.

use thiserror::Error;

/// Core domain errors for relaypool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A raw status code that does not map to any `WorkerStatus`.
    #[error("Unknown worker status code: {0}")]
    UnknownStatus(u8),

    /// A status name that does not map to any `WorkerStatus`.
    #[error("Unknown worker status: {0}")]
    UnknownStatusName(String),

    /// A raw event code outside the known event range.
    #[error("Unknown event kind: {0}")]
    UnknownEvent(i64),
}
