//! Unified error handling for asterisk-watch
//!
//! The state engine never fails: unresolvable or ambiguous events are absorbed.
//! Everything here belongs either to the transport (which drives the reconnect
//! loop) or to the embedding application (configuration, callback sinks).

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum WatchError {
    // ==================== Transport Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Authentication rejected: {0}")]
    AuthenticationFailed(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Framing error: {0}")]
    Framing(String),

    // ==================== Application Errors ====================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Callback sink failed: {0}")]
    Sink(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl WatchError {
    /// Returns true for failures that end the current session and
    /// should be answered with a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WatchError::Io(_)
                | WatchError::Connection(_)
                | WatchError::Timeout { .. }
                | WatchError::AuthenticationFailed(_)
                | WatchError::ConnectionClosed
                | WatchError::Framing(_)
        )
    }

    /// Short machine-readable code, used as a structured log field
    pub fn error_code(&self) -> &'static str {
        match self {
            WatchError::Io(_) => "io_error",
            WatchError::Connection(_) => "connection_error",
            WatchError::Timeout { .. } => "timeout",
            WatchError::AuthenticationFailed(_) => "auth_failed",
            WatchError::ConnectionClosed => "connection_closed",
            WatchError::Framing(_) => "framing_error",
            WatchError::Config(_) => "config_error",
            WatchError::Sink(_) => "sink_error",
            WatchError::Serialization(_) => "serialization_error",
        }
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for WatchError {
    fn from(err: serde_json::Error) -> Self {
        WatchError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for WatchError {
    fn from(err: config::ConfigError) -> Self {
        WatchError::Config(err.to_string())
    }
}
