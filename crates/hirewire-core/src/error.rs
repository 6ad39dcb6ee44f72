//! Error types for hirewire-core

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for notification operations
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Main error type for the notification subsystem
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Network-level failure of a pull, acknowledgement or connect attempt
    #[error("Transient network error: {0}")]
    Transient(#[from] TransientError),

    /// A push or pull entry that could not be parsed
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] MalformedPayload),

    /// A response that belongs to a session which is no longer live
    #[error("Stale session: response for {actual}, live session is {expected}")]
    StaleSession { expected: String, actual: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The runtime or channel has been shut down
    #[error("Notification runtime closed")]
    Closed,
}

impl NotifyError {
    /// Whether this error is retried automatically rather than surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }
}

/// Failures that are retried (pull), rolled back (ack) or backed off (connect)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransientError {
    /// Backend answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Request could not be sent or its body could not be read
    #[error("Request failed: {0}")]
    Request(String),

    /// Push channel could not be opened or dropped
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Request exceeded the configured timeout
    #[error("Timeout")]
    Timeout,
}

/// A single entry that was dropped during parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPayload {
    #[error("payload is not an object")]
    NotAnObject,

    #[error("missing or unusable id")]
    MissingId,

    #[error("missing or invalid timestamp for {id}")]
    InvalidTimestamp { id: String },

    #[error("invalid field {field} for {id}")]
    InvalidField { id: String, field: &'static str },

    #[error("undecodable frame: {0}")]
    Frame(String),
}

impl From<serde_json::Error> for MalformedPayload {
    fn from(err: serde_json::Error) -> Self {
        MalformedPayload::Frame(err.to_string())
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        NotifyError::MalformedPayload(MalformedPayload::from(err))
    }
}
