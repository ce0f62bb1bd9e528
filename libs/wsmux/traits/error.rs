use crate::core::message::MessageType;
use thiserror::Error;

/// Main error type for wsmux
#[derive(Error, Debug)]
pub enum WsmuxError {
    /// Accessed a message payload as the wrong kind
    #[error("Type mismatch: expected {expected} message, found {actual}")]
    TypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    /// Transport/context creation or handshake failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frame or fragment sequence
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No connection has been started
    #[error("Not connected")]
    NotConnected,

    /// Sends before the handshake completed are rejected by policy
    #[error("Connection not established yet")]
    NotEstablished,

    /// The connection is closing or closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// connect()/start() while a loop is still running
    #[error("Already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsmuxError {
    /// Whether the error ended the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ProtocolViolation(_) | Self::ConnectionClosed | Self::Io(_)
        )
    }
}

/// Result type for wsmux operations
pub type Result<T> = std::result::Result<T, WsmuxError>;
