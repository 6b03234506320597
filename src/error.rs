//! Error types for peerlink
//!
//! Provides a unified error type for all operations.
//!
//! Errors split into two classes: *recoverable* faults (peer-API misuse,
//! sends on closed connections) that are reported through the registered
//! error callback without stopping the dispatcher, and everything else.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias using LinkError
pub type Result<T> = std::result::Result<T, LinkError>;

/// Unified error type for peerlink operations
#[derive(Debug, Error)]
pub enum LinkError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    #[error("Connection closed")]
    ConnClosed,

    // -------------------------------------------------------------------------
    // Listener Errors
    // -------------------------------------------------------------------------
    #[error("Not listening")]
    NotListening,

    // -------------------------------------------------------------------------
    // Peer Registry Errors
    // -------------------------------------------------------------------------
    #[error("Peer already exists: {0}")]
    PeerAlreadyExists(SocketAddr),

    #[error("Peer not found: {0}")]
    PeerNotFound(SocketAddr),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Dispatcher Errors
    // -------------------------------------------------------------------------
    #[error("Dispatcher error: {0}")]
    Dispatch(String),
}

impl LinkError {
    /// Whether this error is a per-operation fault the event loop survives.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::PeerAlreadyExists(_)
                | LinkError::PeerNotFound(_)
                | LinkError::ConnClosed
                | LinkError::NotListening
        )
    }
}
