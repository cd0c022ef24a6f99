//! Work leaving and re-entering the engine
//!
//! The engine never performs I/O itself. Requests are queued as [`Outbound`]
//! items tagged with an id; the driver executes them and hands the outcome
//! back as an [`Inbound`] carrying the same id.

use std::fmt;

use ephemera_core::{
    RemoteError, RemoteRequest, RemoteResponse, UploadError, UploadRequest, UploadedFile,
};

/// Tag of a remote request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Tag of a file upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UploadId(pub u64);

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Work for the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Remote {
        query_id: QueryId,
        request: RemoteRequest,
    },
    Upload {
        upload_id: UploadId,
        request: UploadRequest,
    },
}

impl Outbound {
    pub fn remote_request(&self) -> Option<&RemoteRequest> {
        match self {
            Outbound::Remote { request, .. } => Some(request),
            Outbound::Upload { .. } => None,
        }
    }

    pub fn upload_request(&self) -> Option<&UploadRequest> {
        match self {
            Outbound::Upload { request, .. } => Some(request),
            Outbound::Remote { .. } => None,
        }
    }
}

/// Completed work returned by the driver
#[derive(Debug, Clone)]
pub enum Inbound {
    Remote {
        query_id: QueryId,
        result: Result<RemoteResponse, RemoteError>,
    },
    Upload {
        upload_id: UploadId,
        result: Result<UploadedFile, UploadError>,
    },
}
