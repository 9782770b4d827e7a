//! Error types for Meridian

use thiserror::Error;

use crate::sandbox::SessionState;
use crate::types::ChunkId;

/// Result type alias for Meridian operations
pub type Result<T> = std::result::Result<T, MeridianError>;

/// Main error type for Meridian
#[derive(Error, Debug)]
pub enum MeridianError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Chunk not found: {0}")]
    NotFound(ChunkId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid chunk id '{id}': {reason}")]
    InvalidChunkId { id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session is closed (state: {0})")]
    SessionClosed(SessionState),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeridianError {
    /// Whether the underlying store failed to complete the operation.
    ///
    /// Storage faults are never retried inside this crate and are never
    /// reported as a missing chunk.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            MeridianError::Database(_)
                | MeridianError::Storage(_)
                | MeridianError::Serialization(_)
                | MeridianError::Io(_)
        )
    }

    /// Whether the error only says the chunk does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeridianError::NotFound(_))
    }
}
