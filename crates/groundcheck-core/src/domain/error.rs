//! Error taxonomy for the answer pipeline.

use std::sync::Arc;

/// Errors produced by the generation service boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("generation transport error: {0}")]
    Transport(String),

    #[error("generation service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("malformed generation response: {0}")]
    Malformed(String),
}

/// Errors produced by the retrieval collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),

    #[error("retrieval timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors produced by the preference/feedback store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PreferenceError {
    #[error("preference store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the response cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cached computation failed: {0}")]
    Compute(Arc<anyhow::Error>),
}

/// Errors produced by the failure ledger's optional snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum GroundcheckError {
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("preference error: {0}")]
    Preference(#[from] PreferenceError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, GroundcheckError>;
