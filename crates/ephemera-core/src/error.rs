//! Error types shared by the collaborator contracts

use thiserror::Error;

/// Errors related to identifier decoding
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid identity format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Typed failure returned by the remote story service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The uploaded file is incomplete; only the listed parts need re-uploading
    #[error("File parts missing: {0:?}")]
    FilePartsMissing(Vec<u32>),

    /// Retryable transport-level failure
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request rejected ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

impl RemoteError {
    /// Whether retrying the same request later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

/// Failure reported by the file transfer layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("Upload failed: {0}")]
    Failed(String),

    #[error("Upload canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::FilePartsMissing(vec![1, 4]);
        assert!(err.to_string().contains("[1, 4]"));

        let err = RemoteError::Rejected {
            code: 400,
            message: "STORY_PERIOD_INVALID".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("400"));
        assert!(msg.contains("STORY_PERIOD_INVALID"));
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(!RemoteError::NotFound("story".into()).is_transient());
        assert!(!RemoteError::FilePartsMissing(vec![0]).is_transient());
    }

    #[test]
    fn test_identity_error_display() {
        let err = IdentityError::InvalidKeyLength {
            expected: 12,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("3"));
    }
}
