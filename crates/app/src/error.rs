//! Application error type

use std::io;

use tether_net::DiscoveryError;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] tether_core::Error),

    #[error("{0}")]
    Net(#[from] tether_net::Error),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("No group named {0:?} found")]
    NoSuchGroup(String),

    #[error("No groups found")]
    NoGroups,
}
