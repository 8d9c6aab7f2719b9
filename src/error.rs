//! Error types for the tradewire messaging engine

use thiserror::Error;

/// Result type alias for tradewire operations
pub type Result<T> = std::result::Result<T, TradewireError>;

/// Errors that can occur in tradewire operations
#[derive(Error, Debug)]
pub enum TradewireError {
    /// Invalid configuration, detected at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Outbound buffer full or sender closed; the message was never queued
    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    /// Broker negatively acknowledged the message past its retry budget
    #[error("Publish retry budget exhausted after {attempts} attempts")]
    PublishRetryExhausted {
        /// Number of publish attempts made before giving up
        attempts: u32,
    },

    /// Consume handler requested retries past the configured budget
    #[error("Consume retry budget exhausted: {0}")]
    ConsumeRetryExhausted(String),

    /// No response arrived within the configured window
    #[error("Response timed out for correlation id {correlation_id}")]
    ResponseTimeout {
        /// Correlation id of the request that timed out
        correlation_id: String,
    },

    /// A blocking send is already pending for the same business id
    #[error("Request already pending for business id {business_id}")]
    DuplicateRequest {
        /// Business id of the already-pending request
        business_id: String,
    },

    /// Connection-level failure; retried internally with backoff
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transport layer errors (channel, socket, protocol)
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Component is closed or shutting down
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl TradewireError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a publish-rejected error
    pub fn publish_rejected(msg: impl Into<String>) -> Self {
        Self::PublishRejected(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }

    /// Create a response-timeout error
    pub fn response_timeout(correlation_id: impl Into<String>) -> Self {
        Self::ResponseTimeout {
            correlation_id: correlation_id.into(),
        }
    }
}

impl From<lapin::Error> for TradewireError {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
