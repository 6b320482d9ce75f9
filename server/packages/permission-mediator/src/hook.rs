//! `PreToolUse` hook I/O.
//!
//! The agent CLI writes one JSON payload on stdin and reads at most one JSON
//! payload from stdout. Empty stdout means "no opinion".

use std::io::{Read, Write};
use std::path::Path;

use serde_json::{json, Value};

use crate::config::MediatorConfig;
use crate::error::MediatorError;
use crate::mediator::{Decision, Mediator, ToolRequest};

/// Upper bound on the payload read from stdin.
pub const MAX_PAYLOAD_BYTES: u64 = 10 * 1024 * 1024;

pub fn read_payload(input: impl Read) -> Result<Value, MediatorError> {
    let mut text = String::new();
    input
        .take(MAX_PAYLOAD_BYTES)
        .read_to_string(&mut text)
        .map_err(|err| MediatorError::Malformed {
            what: "hook payload",
            message: err.to_string(),
        })?;
    serde_json::from_str(&text).map_err(|err| MediatorError::Malformed {
        what: "hook payload",
        message: err.to_string(),
    })
}

/// The stdout document for `decision`, or `None` to abstain.
pub fn render_decision(decision: &Decision) -> Option<Value> {
    let (verdict, reason) = match decision {
        Decision::Abstain => return None,
        Decision::Allow { reason } => ("allow", reason.as_deref()),
        Decision::Deny { reason } => ("deny", Some(reason.as_str())),
    };
    let mut output = json!({
        "hookEventName": "PreToolUse",
        "permissionDecision": verdict,
    });
    if let Some(reason) = reason {
        output["permissionDecisionReason"] = Value::String(reason.to_string());
    }
    Some(json!({ "hookSpecificOutput": output }))
}

/// Decides a raw hook payload. A payload that cannot be read is denied when a
/// UI is watching and left to the CLI otherwise.
pub fn decide_payload(mediator: &Mediator, payload: Result<Value, MediatorError>) -> Decision {
    match payload.and_then(ToolRequest::from_payload) {
        Ok(request) => mediator.decide(&request),
        Err(err) if mediator.is_supervised() => {
            tracing::warn!(error = %err, "rejecting unreadable hook payload");
            Decision::Deny {
                reason: format!("Permission request could not be read: {err}"),
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "unreadable hook payload, abstaining");
            Decision::Abstain
        }
    }
}

/// Reads one request from `input`, decides it, and writes the verdict (if
/// any) to `output`.
pub fn run(
    ipc_dir: &Path,
    config: MediatorConfig,
    input: impl Read,
    mut output: impl Write,
) -> std::io::Result<Decision> {
    let mediator = Mediator::new(ipc_dir, config);
    let decision = decide_payload(&mediator, read_payload(input));
    if let Some(document) = render_decision(&decision) {
        writeln!(output, "{document}")?;
        output.flush()?;
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::HEARTBEAT_FILE;
    use std::fs;

    #[test]
    fn abstain_renders_nothing() {
        assert_eq!(render_decision(&Decision::Abstain), None);
    }

    #[test]
    fn deny_renders_reason() {
        let value = render_decision(&Decision::Deny {
            reason: "nope".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"hookSpecificOutput": {
                "hookEventName": "PreToolUse",
                "permissionDecision": "deny",
                "permissionDecisionReason": "nope"
            }})
        );
    }

    #[test]
    fn allow_without_reason_omits_field() {
        let value = render_decision(&Decision::Allow { reason: None }).unwrap();
        assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "allow");
        assert!(value["hookSpecificOutput"]
            .get("permissionDecisionReason")
            .is_none());
    }

    #[test]
    fn run_without_heartbeat_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut stdout = Vec::new();
        let payload = br#"{"tool_name": "Read", "tool_input": {"file_path": "/etc/hosts"}}"#;
        let decision = run(dir.path(), MediatorConfig::default(), &payload[..], &mut stdout).unwrap();
        assert_eq!(decision, Decision::Abstain);
        assert!(stdout.is_empty());
    }

    #[test]
    fn run_writes_one_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let mut stdout = Vec::new();
        let payload = br#"{"tool_name": "Glob", "tool_input": {"pattern": "**/*.rs"}}"#;
        run(dir.path(), MediatorConfig::default(), &payload[..], &mut stdout).unwrap();

        let text = String::from_utf8(stdout).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "allow");
    }

    #[test]
    fn garbage_payload_is_denied_when_supervised() {
        let dir = tempfile::tempdir().unwrap();
        let mut stdout = Vec::new();
        let decision = run(dir.path(), MediatorConfig::default(), &b"not json"[..], &mut stdout).unwrap();
        assert_eq!(decision, Decision::Abstain);

        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let decision = run(dir.path(), MediatorConfig::default(), &b"not json"[..], &mut stdout).unwrap();
        assert!(matches!(decision, Decision::Deny { .. }));
    }
}
