//! Error taxonomy shared by every storage, ingestion, and query operation.
//!
//! Variants map one-to-one onto the failure classes callers need to react
//! to differently: validation problems are never worth retrying, timeouts
//! always are, and backend outages should feed a caller's backoff policy.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, KbError>;

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid tenant key {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidTenantKey(String),

    #[error("embedding dimension mismatch in {collection}: expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl KbError {
    pub fn validation(message: impl Into<String>) -> Self {
        KbError::Validation(message.into())
    }

    /// Machine-readable code used in HTTP error bodies and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::Validation(_) | KbError::InvalidTenantKey(_) => "bad_request",
            KbError::DimensionMismatch { .. } => "dimension_mismatch",
            KbError::Schema(_) => "schema_conflict",
            KbError::Embedding(_) => "embedding_error",
            KbError::Timeout(_) => "timeout",
            KbError::BackendUnavailable(_) => "backend_unavailable",
            KbError::Backend(_) => "internal",
        }
    }

    /// Whether the same call may succeed if the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KbError::Timeout(_) | KbError::BackendUnavailable(_))
    }
}

impl From<serde_json::Error> for KbError {
    fn from(err: serde_json::Error) -> Self {
        KbError::Backend(format!("malformed stored metadata: {}", err))
    }
}
