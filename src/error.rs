//! Error types for pipehub.

use thiserror::Error;

/// Main error type for all broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// I/O error during pipe operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (oversized message, malformed frame, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid broker configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `start` was called on a broker that is already running.
    #[error("broker is already running")]
    AlreadyRunning,

    /// A handshake attempt with a connecting client failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outbound queue for a connection is full.
    #[error("outbound queue full")]
    QueueFull,
}

/// Result type alias using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;
