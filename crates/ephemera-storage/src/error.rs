//! Storage failures

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Binlog or database file could not be read or written
    #[error("binlog I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A log event or record the caller named does not exist
    #[error("no such record: {0}")]
    NotFound(String),

    /// A record could not be encoded for writing
    #[error("cannot encode record: {0}")]
    Serialization(String),

    /// Bytes on disk did not decode as a record
    #[error("corrupt record: {0}")]
    Corrupt(#[from] postcard::Error),

    #[error("bad record key: {0}")]
    InvalidKey(String),

    /// redb reported a failure
    #[error("story database: {0}")]
    Database(String),
}

impl From<ephemera_core::IdentityError> for StorageError {
    fn from(err: ephemera_core::IdentityError) -> Self {
        StorageError::InvalidKey(err.to_string())
    }
}

impl StorageError {
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_record_is_corrupt() {
        let err: StorageError = postcard::from_bytes::<u64>(&[]).unwrap_err().into();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn test_short_key_is_invalid() {
        let err: StorageError = ephemera_core::IdentityError::InvalidKeyLength {
            expected: 8,
            actual: 2,
        }
        .into();
        assert!(matches!(err, StorageError::InvalidKey(_)));
        assert!(err.to_string().starts_with("bad record key"));
    }
}
