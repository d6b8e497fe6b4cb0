//! Error types for servicereg-client.

use thiserror::Error;

/// Main error type for all service registration operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON conversion error (handler arguments and results).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error (public address lookup).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Frame prefix or header is inconsistent.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Inbound frame announces more bytes than allowed.
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    /// Unknown tag at a call boundary.
    #[error("Unknown tag: {}, with following data: {}", display_tag(.tag), String::from_utf8_lossy(.remaining))]
    MalformedPayload { tag: u8, remaining: Vec<u8> },

    /// Value encoding/decoding error.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Protocol error (invalid context length, bad handshake arguments, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No handler registered under this name.
    #[error("Can't find this function {0}().")]
    HandlerNotFound(String),

    /// Handler reported a failure.
    #[error("{0}")]
    Handler(String),

    /// Registration failed; the connection will not be re-established.
    #[error("Connection is in fatal state, restart required")]
    Fatal,

    /// The service loop is already running.
    #[error("Service is already running")]
    AlreadyRunning,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl ServiceError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        ServiceError::Handler(message.into())
    }
}

fn display_tag(tag: &u8) -> char {
    char::from(*tag)
}

/// Result type alias using ServiceError.
pub type Result<T> = std::result::Result<T, ServiceError>;
