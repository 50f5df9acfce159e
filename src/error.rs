//! Error types for lxd-client
//!
//! Every failure carries a message, a coarse status label and a numeric code,
//! whether it came from the daemon or from this side of the wire.

use thiserror::Error;

use crate::sequencer::SequencerError;

/// Which part of the request pipeline produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Remote,
    Operation,
    RetriesExceeded,
    ChannelOpen,
    SessionClosed,
    Local,
}

#[derive(Error, Debug)]
pub enum LxdError {
    /// The transport could not complete the exchange.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The daemon answered with a shape we do not understand. Never retried.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A well-formed `error` response.
    #[error("Remote error {code} ({status}): {message}")]
    Remote {
        message: String,
        status: String,
        code: u16,
    },

    /// An accepted operation whose terminal state is a failure.
    #[error("Operation {id} failed {code} ({status}): {message}")]
    Operation {
        id: String,
        message: String,
        status: String,
        code: u16,
    },

    #[error("Exceeded retries waiting for {what} ({attempts} attempts)")]
    RetriesExceeded { what: String, attempts: u32 },

    #[error("Failed to open channel {channel}: {reason}")]
    ChannelOpen { channel: String, reason: String },

    #[error("Exec session is closed")]
    SessionClosed,

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LxdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LxdError::Transport(_) => ErrorKind::Transport,
            LxdError::Protocol(_) => ErrorKind::Protocol,
            LxdError::Remote { .. } => ErrorKind::Remote,
            LxdError::Operation { .. } => ErrorKind::Operation,
            LxdError::RetriesExceeded { .. } => ErrorKind::RetriesExceeded,
            LxdError::ChannelOpen { .. } => ErrorKind::ChannelOpen,
            LxdError::SessionClosed => ErrorKind::SessionClosed,
            LxdError::Sequencer(_) | LxdError::Json(_) | LxdError::Io(_) | LxdError::Config(_) => {
                ErrorKind::Local
            }
        }
    }

    /// Coarse status label, e.g. "Failure" or the daemon's own status text.
    pub fn status_label(&self) -> &str {
        match self {
            LxdError::Remote { status, .. } | LxdError::Operation { status, .. } => status,
            LxdError::Transport(_) => "Failed",
            LxdError::Protocol(_) => "Protocol Error",
            LxdError::RetriesExceeded { .. } => "Timeout",
            LxdError::ChannelOpen { .. } => "Failed",
            LxdError::SessionClosed => "Closed",
            _ => "Failure",
        }
    }

    /// Numeric status code. Remote failures keep the daemon's code.
    pub fn code(&self) -> u16 {
        match self {
            LxdError::Remote { code, .. } | LxdError::Operation { code, .. } => *code,
            LxdError::Transport(_) | LxdError::ChannelOpen { .. } => 400,
            LxdError::RetriesExceeded { .. } => 408,
            LxdError::SessionClosed => 410,
            _ => 500,
        }
    }

    /// True if the daemon reported the target as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LxdError::Remote { code: 404, .. })
    }
}

impl From<reqwest::Error> for LxdError {
    fn from(e: reqwest::Error) -> Self {
        LxdError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LxdError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        LxdError::Transport(format!("WebSocket error: {}", e))
    }
}

/// Result type for lxd-client operations
pub type Result<T> = std::result::Result<T, LxdError>;
