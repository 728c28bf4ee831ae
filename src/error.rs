//! Error types for the busline library.

use thiserror::Error;

/// Type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for busline
///
/// `Clone` so that a failure can travel through shared pending results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A before/listen_to_before count was not a positive integer
    #[error("Invalid count {count}: expected a positive integer")]
    InvalidCount {
        /// The rejected count
        count: usize,
    },

    /// Registration options were not a plain object
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// A callback failed while being invoked
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// A foreign listen target refused a registration or removal
    #[error("Listen target error: {0}")]
    TargetError(String),

    /// A deferred trigger was requested outside a tokio runtime
    #[error("No tokio runtime available to defer '{name}'")]
    NoRuntime {
        /// The event name(s) that could not be deferred
        name: String,
    },

    /// The secure wrapper was destroyed
    #[error("Secure bus has been destroyed")]
    Destroyed,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a new handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Error::HandlerError(msg.into())
    }

    /// Create a new listen target error
    pub fn target(msg: impl Into<String>) -> Self {
        Error::TargetError(msg.into())
    }

    /// Check if this error came out of a callback body
    pub fn is_handler_error(&self) -> bool {
        matches!(self, Error::HandlerError(_))
    }

    /// Check if this error is an argument contract violation
    pub fn is_argument_error(&self) -> bool {
        matches!(self, Error::InvalidCount { .. } | Error::InvalidOptions(_))
    }
}
