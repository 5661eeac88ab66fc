use thiserror::Error;

/// Errors surfaced by external collaborators (entity store, comment service,
/// identity service, event bus).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("Version conflict on entity {entity_id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure may succeed if the same call is repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Timeout(_) | AppError::TransientIo(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::VersionConflict { .. })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
