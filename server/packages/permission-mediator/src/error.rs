use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("failed to create ipc directory {}: {source}", .path.display())]
    IpcUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },

    #[error("no pending request with id {request_id}")]
    RequestNotFound { request_id: String },
}
