//! Error types for the memory subsystem

use crate::types::MemoryTier;
use thiserror::Error;

/// Result type alias for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Main error type for the memory subsystem
///
/// A missing item is never an error: lookups return `Ok(None)`. Every
/// variant here is a genuine fault the caller must be able to observe
/// without the process going down.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// IO fault while persisting or reading
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization fault on persist or read
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted state could not be interpreted
    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    /// A required tier-specific field is missing or out of range
    #[error("Validation error: {0}")]
    Validation(String),

    /// Item offered to a store of a different tier
    #[error("Tier mismatch: store holds {expected} items, got {actual}")]
    TierMismatch {
        expected: MemoryTier,
        actual: MemoryTier,
    },
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a corrupted-storage error
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
