//! Protocol error types.

use thiserror::Error;

/// Protocol error type.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("envelope shape error: {0}")]
    Shape(String),
}

/// Protocol result type.
pub type Result<T> = std::result::Result<T, ProtoError>;
