//! Filesystem request/response channel between the mediator and the UI.
//!
//! Layout of a per-session IPC directory:
//!
//! ```text
//! <ipc_dir>/heartbeat                    touched by the UI
//! <ipc_dir>/<request_id>.request.json    written by the mediator
//! <ipc_dir>/<request_id>.response.json   written by the UI
//! ```
//!
//! Markers are written to a hidden temp file and renamed into place so a
//! reader never observes a partially written document.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::MediatorError;
use crate::liveness::HEARTBEAT_FILE;

pub const REQUEST_SUFFIX: &str = ".request.json";
pub const RESPONSE_SUFFIX: &str = ".response.json";

/// An escalated tool call awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub raw_request_payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalResponse {
    pub fn allow() -> Self {
        Self {
            decision: ApprovalDecision::Allow,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Deny,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalChannel {
    dir: PathBuf,
}

impl ApprovalChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn request_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{request_id}{REQUEST_SUFFIX}"))
    }

    pub fn response_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{request_id}{RESPONSE_SUFFIX}"))
    }

    pub fn ensure_dir(&self) -> Result<(), MediatorError> {
        fs::create_dir_all(&self.dir).map_err(|source| MediatorError::IpcUnavailable {
            path: self.dir.clone(),
            source,
        })
    }

    /// Writes the request marker for `approval`.
    pub fn submit(&self, approval: &PendingApproval) -> Result<(), MediatorError> {
        self.ensure_dir()?;
        write_json(&self.request_path(&approval.request_id), approval)
    }

    /// Returns the response for `request_id` if one has been written, deleting
    /// both markers. A response that does not parse is left in place and
    /// reported as [`MediatorError::Malformed`].
    pub fn take_response(
        &self,
        request_id: &str,
    ) -> Result<Option<ApprovalResponse>, MediatorError> {
        let path = self.response_path(request_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(MediatorError::Read { path, source }),
        };
        let response: ApprovalResponse =
            serde_json::from_str(&text).map_err(|err| MediatorError::Malformed {
                what: "approval response",
                message: err.to_string(),
            })?;
        self.withdraw(request_id);
        Ok(Some(response))
    }

    /// Removes both markers for `request_id`. Failures are logged and ignored.
    pub fn withdraw(&self, request_id: &str) {
        for path in [self.request_path(request_id), self.response_path(request_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove approval marker");
                }
            }
        }
    }

    /// Refreshes the heartbeat marker.
    pub fn touch_heartbeat(&self) -> Result<(), MediatorError> {
        self.ensure_dir()?;
        let path = self.dir.join(HEARTBEAT_FILE);
        fs::write(&path, now_rfc3339()).map_err(|source| MediatorError::Write { path, source })
    }

    /// Requests that have no response yet, oldest first. Unreadable request
    /// markers are skipped.
    pub fn pending_requests(&self) -> Result<Vec<PendingApproval>, MediatorError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(MediatorError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut pending = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(request_id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(REQUEST_SUFFIX))
            else {
                continue;
            };
            if request_id.starts_with('.') || self.response_path(request_id).exists() {
                continue;
            }
            let parsed = fs::read_to_string(entry.path())
                .map_err(|err| err.to_string())
                .and_then(|text| {
                    serde_json::from_str::<PendingApproval>(&text).map_err(|err| err.to_string())
                });
            match parsed {
                Ok(approval) => pending.push(approval),
                Err(err) => {
                    tracing::debug!(request_id, error = %err, "skipping unreadable request marker");
                }
            }
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    /// Answers a pending request.
    pub fn respond(
        &self,
        request_id: &str,
        response: &ApprovalResponse,
    ) -> Result<(), MediatorError> {
        if !self.request_path(request_id).exists() {
            return Err(MediatorError::RequestNotFound {
                request_id: request_id.to_string(),
            });
        }
        write_json(&self.response_path(request_id), response)
    }

    /// Denies a pending request on behalf of a user who dismissed it.
    pub fn cancel(&self, request_id: &str) -> Result<(), MediatorError> {
        self.respond(
            request_id,
            &ApprovalResponse::deny("The user cancelled this request."),
        )
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MediatorError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| MediatorError::Malformed {
        what: "marker document",
        message: err.to_string(),
    })?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("marker");
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&temp, bytes).map_err(|source| MediatorError::Write {
        path: temp.clone(),
        source,
    })?;
    fs::rename(&temp, path).map_err(|source| {
        let _ = fs::remove_file(&temp);
        MediatorError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}
