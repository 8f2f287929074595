//! Error handling for the realtime client.
//!
//! Connectivity problems are recovered inside the client and surface only
//! through state-change callbacks. The variants below are what the few
//! fallible entry points (`connect`, configuration, wire decoding) report.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the crate.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for realtime transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// WebSocket protocol or I/O errors.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// Every configured endpoint failed during a connection attempt.
    #[error("Connection failed: {message}")]
    ConnectFailed { message: String },

    /// The connection closed (with an optional reason).
    #[error("Connection closed{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed { reason: Option<String> },

    /// Configuration errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Batch compression or decompression errors.
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}

impl TransportError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection failure error.
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }
}
