//! Error types for howto

use thiserror::Error;

/// Result type alias for howto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in howto operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption detected: {0}")]
    Corrupt(String),

    #[error("Stale parent for key '{key}': {prev} is not a current head")]
    StaleParent { key: String, prev: String },

    #[error("Broken chain: revision {missing} is missing")]
    BrokenChain { missing: String },

    #[error("Content {hash} is already recorded under key '{key}'")]
    HashInUse { hash: String, key: String },

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid index file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Replication channel closed before completion")]
    ChannelClosed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether re-running the operation with fresh state can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleParent { .. } | Error::BrokenChain { .. } | Error::ChannelClosed
        )
    }
}
