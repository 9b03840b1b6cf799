//! Error types for Beacon Live

use std::time::Duration;

use thiserror::Error;

use crate::live::SessionState;

/// Result type alias for Beacon Live operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Beacon Live
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failure, fatal to the live session
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol misuse or unparseable inbound traffic
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Microphone capture error
    #[error("capture error: {0}")]
    Capture(String),

    /// Audio playback error (never fatal to a session)
    #[error("playback error: {0}")]
    Playback(String),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a live connection failed or ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Setup acknowledgment did not arrive in time
    #[error("setup acknowledgment timed out after {0:?}")]
    Timeout(Duration),

    /// Socket-level failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Session was closed
    #[error("connection closed")]
    Closed,
}

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Operation requires a ready session
    #[error("session not ready (state: {0:?})")]
    NotReady(SessionState),

    /// Inbound message could not be classified
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl Error {
    /// Whether this error ends the live session
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
