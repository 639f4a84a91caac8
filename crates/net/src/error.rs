//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reasons reported by the discovery substrate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Internal adapter error")]
    Internal,

    #[error("Peer-to-peer groups not supported")]
    Unsupported,

    #[error("Adapter busy")]
    Busy,

    #[error("Discovery backend error: {0}")]
    Backend(String),
}

impl DiscoveryError {
    /// Map a numeric adapter failure code
    pub fn from_reason(reason: i32) -> Self {
        match reason {
            0 => DiscoveryError::Internal,
            1 => DiscoveryError::Unsupported,
            2 => DiscoveryError::Busy,
            other => DiscoveryError::Backend(format!("unknown reason code {}", other)),
        }
    }
}

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("Connect timed out")]
    Timeout,

    #[error("Session closed")]
    Closed,
}
