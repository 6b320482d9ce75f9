//! The per-tool-call decision procedure.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use serde_json::Value;

use crate::allowlist::Allowlist;
use crate::config::MediatorConfig;
use crate::error::MediatorError;
use crate::ipc::{now_rfc3339, ApprovalChannel, ApprovalDecision, PendingApproval};
use crate::liveness::LivenessMonitor;

/// Pure read, search and planning tools.
pub const SAFE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "NotebookRead",
    "TodoRead",
    "TodoWrite",
    "WebSearch",
];

/// Tools whose interaction the UI renders itself.
pub const HOST_HANDLED_TOOLS: &[&str] = &["AskUserQuestion", "ExitPlanMode"];

pub const SHELL_TOOLS: &[&str] = &["Bash"];

pub const HOST_HANDLED_REASON: &str = "This tool is handled by the user interface. \
Do not retry it; wait for the user's answer, which will arrive as the next message.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Emit nothing; the agent CLI falls back to its own approval flow.
    Abstain,
    Allow { reason: Option<String> },
    Deny { reason: String },
}

impl Decision {
    fn allow() -> Self {
        Decision::Allow { reason: None }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
        }
    }
}

/// One sensitive tool call as received from the agent CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub raw_payload: Value,
}

impl ToolRequest {
    /// Reads a `PreToolUse` hook payload and assigns a fresh request id.
    pub fn from_payload(payload: Value) -> Result<Self, MediatorError> {
        let tool_name = payload
            .get("tool_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| MediatorError::Malformed {
                what: "hook payload",
                message: "missing tool_name".to_string(),
            })?
            .to_string();
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(ToolRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name,
            tool_input: payload.get("tool_input").cloned().unwrap_or(Value::Null),
            session_id: text("session_id"),
            cwd: text("cwd"),
            raw_payload: payload,
        })
    }

    pub fn command(&self) -> Option<&str> {
        self.tool_input.get("command").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Mediator {
    channel: ApprovalChannel,
    liveness: LivenessMonitor,
    allowlist_path: PathBuf,
    config: MediatorConfig,
}

impl Mediator {
    pub fn new(ipc_dir: &Path, config: MediatorConfig) -> Self {
        Self {
            channel: ApprovalChannel::new(ipc_dir),
            liveness: LivenessMonitor::new(ipc_dir, config.staleness),
            allowlist_path: config.allowlist_path(ipc_dir),
            config,
        }
    }

    pub fn is_supervised(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Runs the gates in order and stops at the first that fires.
    pub fn decide(&self, request: &ToolRequest) -> Decision {
        let tool = request.tool_name.as_str();

        if !self.is_supervised() {
            tracing::debug!(tool, "no fresh heartbeat, abstaining");
            return Decision::Abstain;
        }
        if SAFE_TOOLS.contains(&tool) {
            return Decision::allow();
        }
        if HOST_HANDLED_TOOLS.contains(&tool) {
            return Decision::deny(HOST_HANDLED_REASON);
        }

        let allowlist = Allowlist::load(&self.allowlist_path);
        if SHELL_TOOLS.contains(&tool) {
            if let Some(command) = request.command() {
                if allowlist.allows_command(command) {
                    tracing::debug!(tool, command, "command matched allow rule");
                    return Decision::allow();
                }
            }
        }
        if allowlist.allows_tool(tool) {
            return Decision::allow();
        }

        self.escalate(request)
    }

    /// Hands the request to a human through the IPC directory and waits for
    /// the answer until the configured timeout.
    fn escalate(&self, request: &ToolRequest) -> Decision {
        let approval = PendingApproval {
            request_id: request.request_id.clone(),
            tool_name: request.tool_name.clone(),
            tool_input: request.tool_input.clone(),
            created_at: now_rfc3339(),
            session_id: request.session_id.clone(),
            cwd: request.cwd.clone(),
            raw_request_payload: request.raw_payload.clone(),
        };
        if let Err(err) = self.channel.submit(&approval) {
            tracing::warn!(request_id = %request.request_id, error = %err, "cannot escalate");
            return Decision::deny(format!("Permission mediation is unavailable: {err}"));
        }
        tracing::info!(
            request_id = %request.request_id,
            tool = %request.tool_name,
            "awaiting approval"
        );

        let deadline = Instant::now() + self.config.timeout;
        loop {
            match self.channel.take_response(&request.request_id) {
                Ok(Some(response)) => {
                    return match response.decision {
                        ApprovalDecision::Allow => Decision::Allow {
                            reason: response.reason,
                        },
                        ApprovalDecision::Deny => Decision::deny(
                            response
                                .reason
                                .unwrap_or_else(|| "The user denied this request.".to_string()),
                        ),
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(request_id = %request.request_id, error = %err, "response not ready");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }

        self.channel.withdraw(&request.request_id);
        tracing::warn!(request_id = %request.request_id, "approval timed out");
        Decision::deny(format!(
            "Timed out after {:?} waiting for the user to approve this {} call.",
            self.config.timeout,
            request.tool_name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ApprovalResponse;
    use crate::liveness::HEARTBEAT_FILE;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;

    fn quick_config() -> MediatorConfig {
        MediatorConfig {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            ..MediatorConfig::default()
        }
    }

    fn bash(command: &str) -> ToolRequest {
        ToolRequest::from_payload(json!({
            "session_id": "sess",
            "tool_name": "Bash",
            "tool_input": {"command": command}
        }))
        .unwrap()
    }

    fn tool(name: &str) -> ToolRequest {
        ToolRequest::from_payload(json!({"tool_name": name, "tool_input": {}})).unwrap()
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(bash("ls").request_id, bash("ls").request_id);
        assert_eq!(bash("ls").command(), Some("ls"));
        assert!(ToolRequest::from_payload(json!({"tool_input": {}})).is_err());
    }

    #[test]
    fn absent_heartbeat_abstains_even_for_safe_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mediator = Mediator::new(dir.path(), quick_config());
        assert_eq!(mediator.decide(&tool("Read")), Decision::Abstain);
        assert_eq!(mediator.decide(&bash("rm -rf /")), Decision::Abstain);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn stale_heartbeat_abstains() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let config = MediatorConfig {
            staleness: Duration::from_millis(50),
            ..quick_config()
        };
        thread::sleep(Duration::from_millis(120));
        let mediator = Mediator::new(dir.path(), config);
        assert_eq!(mediator.decide(&tool("Read")), Decision::Abstain);
    }

    #[test]
    fn safe_and_host_handled_tools() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let mediator = Mediator::new(dir.path(), quick_config());

        assert_eq!(mediator.decide(&tool("Grep")), Decision::allow());
        match mediator.decide(&tool("AskUserQuestion")) {
            Decision::Deny { reason } => assert!(reason.contains("Do not retry")),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn blanket_tool_allow() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        fs::write(dir.path().join("allowlist.json"), r#"["Edit"]"#).unwrap();
        let mediator = Mediator::new(dir.path(), quick_config());
        assert_eq!(mediator.decide(&tool("Edit")), Decision::allow());
    }

    #[test]
    fn escalation_times_out_to_deny_without_markers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let mediator = Mediator::new(dir.path(), quick_config());

        let request = bash("git push");
        match mediator.decide(&request) {
            Decision::Deny { reason } => {
                assert!(reason.starts_with("Timed out after 300ms"), "{reason}");
                assert!(reason.contains("Bash"));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
        let channel = ApprovalChannel::new(dir.path());
        assert!(!channel.request_path(&request.request_id).exists());
        assert!(!channel.response_path(&request.request_id).exists());
    }

    #[test]
    fn escalation_returns_human_answer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let config = MediatorConfig {
            timeout: Duration::from_secs(5),
            ..quick_config()
        };
        let mediator = Mediator::new(dir.path(), config);
        let channel = ApprovalChannel::new(dir.path());

        let responder = {
            let channel = channel.clone();
            thread::spawn(move || loop {
                if let Some(pending) = channel.pending_requests().unwrap().first() {
                    channel
                        .respond(&pending.request_id, &ApprovalResponse::deny("use the staging remote"))
                        .unwrap();
                    return pending.request_id.clone();
                }
                thread::sleep(Duration::from_millis(10));
            })
        };

        let decision = mediator.decide(&bash("git push"));
        let request_id = responder.join().unwrap();
        assert_eq!(decision, Decision::deny("use the staging remote"));
        assert!(!channel.request_path(&request_id).exists());
        assert!(!channel.response_path(&request_id).exists());
    }

    #[test]
    fn unwritable_ipc_dir_denies() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HEARTBEAT_FILE), b"").unwrap();
        let mediator = Mediator {
            channel: ApprovalChannel::new(dir.path().join(HEARTBEAT_FILE).join("sub")),
            liveness: LivenessMonitor::new(dir.path(), Duration::from_secs(10)),
            allowlist_path: dir.path().join("allowlist.json"),
            config: quick_config(),
        };
        match mediator.decide(&tool("Write")) {
            Decision::Deny { reason } => assert!(reason.contains("unavailable")),
            other => panic!("unexpected decision: {other:?}"),
        }
    }
}
