//! Story engine error types

use thiserror::Error;

use ephemera_core::{RemoteError, UploadError};
use ephemera_storage::StorageError;

/// Errors surfaced to command callers
///
/// `Clone` so a single outcome can resolve every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoryError {
    /// Story or owner unknown locally and remotely
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ownership or privacy check failed; never sent to the network
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Retries were exhausted
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// Upload incomplete after every re-upload attempt
    #[error("File parts missing: {0:?}")]
    FilePartsMissing(Vec<u32>),

    /// Completion superseded by a newer submission
    #[error("Stale completion")]
    StaleCompletion,

    #[error("Corrupt persisted state: {0}")]
    CorruptPersistedState(String),

    #[error("Request rejected ({code}): {message}")]
    Rejected { code: i32, message: String },

    /// The engine shut down before the request finished
    #[error("Request canceled")]
    Canceled,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoryError {
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }
}

impl From<RemoteError> for StoryError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(what) => StoryError::NotFound(what),
            RemoteError::PermissionDenied(what) => StoryError::PermissionDenied(what),
            RemoteError::FilePartsMissing(parts) => StoryError::FilePartsMissing(parts),
            RemoteError::Network(message) => StoryError::TransientNetwork(message),
            RemoteError::Rejected { code, message } => StoryError::Rejected { code, message },
            RemoteError::UnexpectedResponse(request) => StoryError::Rejected {
                code: 500,
                message: format!("unexpected response to {request}"),
            },
        }
    }
}

impl From<UploadError> for StoryError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Failed(message) => StoryError::Rejected { code: 400, message },
            UploadError::Canceled => StoryError::Canceled,
        }
    }
}

impl From<StorageError> for StoryError {
    fn from(err: StorageError) -> Self {
        StoryError::Storage(err.to_string())
    }
}

impl From<postcard::Error> for StoryError {
    fn from(err: postcard::Error) -> Self {
        StoryError::CorruptPersistedState(err.to_string())
    }
}

/// Result type for story operations
pub type StoryResult<T> = Result<T, StoryError>;
