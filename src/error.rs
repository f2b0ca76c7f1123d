use std::time::Duration;

use thiserror::Error;

use crate::types::SourceId;

/// Reasons a single delivery through the rate-limited sender failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure; rate-limit state is left untouched.
    #[error("network error: {0}")]
    Network(String),

    /// Endpoint answered with a non-success, non-429 status.
    #[error("endpoint rejected delivery with status {status}")]
    Rejected { status: u16 },

    /// Endpoint kept answering 429 past the retry budget.
    #[error("still throttled after {attempts} attempts ({waited:?} of backoff)")]
    ThrottledExhausted { attempts: u32, waited: Duration },
}

/// Errors returned by the dispatcher's public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The registry has no endpoint for this source.
    #[error("no endpoint registered for source {source_id}")]
    NoEndpoint { source_id: SourceId },

    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The HTTP transport could not be constructed.
    #[error("failed to build transport: {0}")]
    Transport(String),
}

/// Errors raised while interpreting externally supplied configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid log events: {}", .0.join(", "))]
    UnknownEvent(Vec<String>),
}
