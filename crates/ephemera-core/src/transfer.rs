//! File transfer contract types

use serde::{Deserialize, Serialize};

use crate::identity::FileId;

/// Request to upload a local file
///
/// `bad_parts` is empty for a fresh upload. When the server reported missing
/// parts, only those are re-sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_id: FileId,
    pub bad_parts: Vec<u32>,
}

impl UploadRequest {
    pub fn fresh(file_id: FileId) -> Self {
        Self {
            file_id,
            bad_parts: Vec::new(),
        }
    }

    pub fn is_reupload(&self) -> bool {
        !self.bad_parts.is_empty()
    }
}

/// Handle of a completed upload, passed along with the send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_id: FileId,
    pub handle: u64,
    pub parts: u32,
}
