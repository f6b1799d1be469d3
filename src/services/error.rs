//! Error taxonomy shared by every service component.

use thiserror::Error;

use super::storage::BackendError;

#[derive(Debug, Error)]
pub enum FileServiceError {
    /// No record for the given identity, kind or token.
    #[error("{0}")]
    NotFound(String),

    /// Operation attempted outside its legal lifecycle state.
    #[error("{0}")]
    InvalidState(String),

    /// Unregistered kind or broken backend wiring. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A storage backend call failed or timed out. Retryable by the caller.
    #[error("storage backend `{backend}` unavailable: {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type FileServiceResult<T> = Result<T, FileServiceError>;

impl FileServiceError {
    pub fn file_not_found(id: &str, kind: &str) -> Self {
        Self::NotFound(format!("file `{id}` of kind `{kind}` not found"))
    }

    pub fn share_not_found(id: &str) -> Self {
        Self::NotFound(format!("share `{id}` not found"))
    }

    /// Unknown token, expired token and deleted file all look the same.
    pub fn token_not_found() -> Self {
        Self::NotFound("no file is shared under this token".into())
    }

    pub fn unknown_kind(kind: &str) -> Self {
        Self::Configuration(format!("file kind `{kind}` is not registered"))
    }

    pub fn backend(backend: &str, source: BackendError) -> Self {
        Self::BackendUnavailable {
            backend: backend.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}
