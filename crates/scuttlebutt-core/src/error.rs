//! Error types for Scuttlebutt

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Scuttlebutt error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization error while producing canonical bytes
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Identifier or key that would collide with reserved names
    #[error("{0:?} is a reserved key")]
    ReservedKey(String),

    /// Empty source identifier
    #[error("source id cannot be empty")]
    EmptyId,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}
