//! Error types for the RFB server library.

use std::io;
use thiserror::Error;

/// Result type for RFB server operations.
pub type Result<T> = std::result::Result<T, RfbError>;

/// Errors that can occur in RFB server operations.
#[derive(Debug, Error)]
pub enum RfbError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// RFB protocol error (malformed bytes, unknown message type, oversized payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Invalid pixel format.
    #[error("Invalid pixel format")]
    InvalidPixelFormat,

    /// Encoding error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invalid configuration; prevents the server from starting.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Display capture failure.
    #[error("Capture error: {0}")]
    Capture(String),

    /// Invalid operation or state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,
}
