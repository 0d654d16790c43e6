//! Error types for Harbor
//!
//! This module defines all error types used throughout the Harbor crates.
//! Errors are designed to be ergonomic and provide clear context for debugging.

use std::io;
use thiserror::Error;

/// Result type alias for Harbor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for Harbor operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport adaptor errors (handshake, stream setup)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl Error {
    /// Whether this error was produced by cancelling an outstanding
    /// operation, i.e. by our own shutdown rather than by the peer.
    ///
    /// Cancelled completions must be swallowed, never relayed.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
            ),
            Error::Connection(ConnectionError::ListenerClosed) => true,
            _ => false,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Missing required configuration
    #[error("Missing required configuration: {field}")]
    MissingField { field: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Connection errors
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// The connection has been closed
    #[error("Connection closed")]
    Closed,

    /// The connection id is no longer in the registry
    #[error("Connection not found: {id}")]
    NotFound { id: u64 },

    /// The outbound queue is full
    #[error("Transmit queue full")]
    QueueFull,

    /// The connection has not been started yet
    #[error("Connection not started")]
    NotStarted,

    /// The listening socket was closed while an accept was outstanding
    #[error("Listener closed")]
    ListenerClosed,
}
