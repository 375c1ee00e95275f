//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

/// Byte counts reached by a pipe, in both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes copied from the first connection to the second
    pub a_to_b: u64,
    /// Bytes copied from the second connection to the first
    pub b_to_a: u64,
}

/// TLCP channel error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// Configuration error (also raised when a declared protocol has no keystore)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener bind error
    #[error("Listen error: {0}")]
    Listen(String),

    /// Target unreachable
    #[error("Dial error: {0}")]
    Dial(String),

    /// Cryptographic handshake failure
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// New configuration rejected, previous one still active
    #[error("Reload error: {0}")]
    Reload(String),

    /// Non-normal I/O failure while piping
    #[error("Pipe error after {transferred:?}: {source}")]
    Pipe {
        /// Underlying I/O error
        #[source]
        source: io::Error,
        /// Bytes copied before the failure
        transferred: Transferred,
    },

    /// Keystore or root certificate could not be loaded
    #[error("Keystore error: {0}")]
    KeyStore(String),

    /// Named object not registered
    #[error("Not found: {0}")]
    NotFound(String),

    /// Instance or proxy already running
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Operation requires a running instance
    #[error("Not running: {0}")]
    NotRunning(String),

    /// Instance name already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// HTTP forwarding error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl ProxyError {
    /// Whether this error belongs to a single connection rather than the instance
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            ProxyError::Dial(_) | ProxyError::Handshake(_) | ProxyError::Pipe { .. } | ProxyError::Http(_)
        )
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
