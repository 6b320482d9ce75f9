//! Error types shared by the agent runtime packages.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    SessionNotFound,
    SessionAlreadyExists,
    SpawnFailed,
    InputClosed,
    InvalidRequest,
    StreamError,
    Io,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::SessionNotFound => "session_not_found",
            ErrorType::SessionAlreadyExists => "session_already_exists",
            ErrorType::SpawnFailed => "spawn_failed",
            ErrorType::InputClosed => "input_closed",
            ErrorType::InvalidRequest => "invalid_request",
            ErrorType::StreamError => "stream_error",
            ErrorType::Io => "io",
        }
    }
}

/// Serializable view of a [`RuntimeError`], suitable for event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session already exists: {session_id}")]
    SessionAlreadyExists { session_id: String },

    #[error("failed to spawn {agent}: {message}")]
    SpawnFailed { agent: String, message: String },

    #[error("input stream already closed for session {session_id}")]
    InputClosed { session_id: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("stream error: {message}")]
    StreamError { message: String },

    #[error("io error: {message}")]
    Io { message: String },
}

impl RuntimeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            RuntimeError::SessionNotFound { .. } => ErrorType::SessionNotFound,
            RuntimeError::SessionAlreadyExists { .. } => ErrorType::SessionAlreadyExists,
            RuntimeError::SpawnFailed { .. } => ErrorType::SpawnFailed,
            RuntimeError::InputClosed { .. } => ErrorType::InputClosed,
            RuntimeError::InvalidRequest { .. } => ErrorType::InvalidRequest,
            RuntimeError::StreamError { .. } => ErrorType::StreamError,
            RuntimeError::Io { .. } => ErrorType::Io,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            RuntimeError::SessionNotFound { session_id }
            | RuntimeError::SessionAlreadyExists { session_id }
            | RuntimeError::InputClosed { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn to_details(&self) -> ErrorDetails {
        ErrorDetails {
            error_type: self.error_type(),
            message: self.to_string(),
            session_id: self.session_id().map(str::to_string),
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_carry_session_id() {
        let err = RuntimeError::SessionNotFound {
            session_id: "abc".to_string(),
        };
        let details = err.to_details();
        assert_eq!(details.error_type, ErrorType::SessionNotFound);
        assert_eq!(details.session_id.as_deref(), Some("abc"));
        assert_eq!(details.message, "session not found: abc");
    }

    #[test]
    fn details_serialize_type_tag() {
        let err = RuntimeError::SpawnFailed {
            agent: "claude".to_string(),
            message: "No such file or directory".to_string(),
        };
        let value = serde_json::to_value(err.to_details()).unwrap();
        assert_eq!(value["type"], "spawn_failed");
        assert!(value.get("sessionId").is_none());
    }
}
