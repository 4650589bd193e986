//! Error types for the voting mesh.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("policy rejection: {0}")]
    Policy(String),

    #[error("duplicate node identity: {0}")]
    DuplicateIdentity(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),
}
