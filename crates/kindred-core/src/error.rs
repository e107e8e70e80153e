//! Error types for the Kindred core.

use thiserror::Error;

/// Result type for Kindred core operations.
pub type Result<T> = std::result::Result<T, KindredError>;

/// Errors surfaced by the session, directory, and conversation layers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KindredError {
    /// Malformed or self-referential participant identifier.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Login identifier/secret mismatch.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Handle is already registered.
    #[error("Identity already registered: {0}")]
    DuplicateIdentity(String),

    /// Backing store unreachable after its own retry policy.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persisted document failed to (de)serialize.
    #[error("Document error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl KindredError {
    /// Check if this error is retryable.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, KindredError::StoreUnavailable(_))
    }
}
