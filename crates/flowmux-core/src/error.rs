//! Error types for the flowmux engine.
//!
//! The three sentinel variants (`NotConnected`, `Timeout`, `TypeClosed`) are
//! part of the connector contract: adapters match on them to decide between
//! reconnecting, backing off, and terminating. Everything else travels
//! backward through transaction ack sinks, which is why the whole enum is
//! `Clone`.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal disposition of a transaction: `Ok(())` asserts downstream
/// success, any error signals failure.
pub type AckResult = std::result::Result<(), Error>;

/// Top-level error type for the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Connector is transiently unavailable; the adapter will reconnect.
    #[error("not connected to target source or sink")]
    NotConnected,

    /// A bounded wait elapsed without data or completion.
    #[error("action timed out")]
    Timeout,

    /// Component will never produce or accept more work.
    #[error("type was closed")]
    TypeClosed,

    /// Operation failed but may succeed if redelivered.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Connector-specific failure, classification unknown.
    #[error("connector error: {0}")]
    Connector(String),

    /// Processor failure attached to in-flight messages.
    #[error("processing error: {0}")]
    Processing(String),

    /// Spool buffer I/O or corruption error.
    #[error("spool error: {0}")]
    Spool(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A layer's consume method was called more than once.
    #[error("layer is already consuming a transaction channel")]
    AlreadyConsuming,
}

impl Error {
    /// Whether upstream retry policy should treat this error as retryable.
    ///
    /// Retryable errors take precedence over unclassified ones when acks are
    /// aggregated, so that the input connector's redelivery policy is
    /// preserved through fan-out.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::Timeout | Error::Retryable(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Spool(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Spool(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
