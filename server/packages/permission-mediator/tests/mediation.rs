use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use agent_runtime_permission_mediator::{
    ApprovalChannel, ApprovalResponse, Decision, Mediator, MediatorConfig, ToolRequest,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn supervised_dir(allowlist: Value) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("allowlist.json"), allowlist.to_string()).unwrap();
    ApprovalChannel::new(dir.path()).touch_heartbeat().unwrap();
    dir
}

fn bash(command: &str) -> ToolRequest {
    ToolRequest::from_payload(json!({
        "session_id": "sess-1",
        "cwd": "/repo",
        "tool_name": "Bash",
        "tool_input": {"command": command}
    }))
    .unwrap()
}

#[test]
fn test_bash_rule_allows_exact_command() {
    let dir = supervised_dir(json!({"tools": [], "bashRules": [["npm", "test"]]}));
    let mediator = Mediator::new(dir.path(), MediatorConfig::default());
    assert_eq!(
        mediator.decide(&bash("npm test")),
        Decision::Allow { reason: None }
    );
}

#[test]
fn test_unmatched_command_escalates_to_human() {
    let dir = supervised_dir(json!({"tools": [], "bashRules": [["npm", "test"]]}));
    let config = MediatorConfig {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        ..MediatorConfig::default()
    };
    let mediator = Mediator::new(dir.path(), config);
    let channel = ApprovalChannel::new(dir.path());

    let watcher = {
        let channel = channel.clone();
        thread::spawn(move || loop {
            let pending = channel.pending_requests().unwrap();
            if let Some(request) = pending.first() {
                channel
                    .respond(&request.request_id, &ApprovalResponse::allow())
                    .unwrap();
                return request.clone();
            }
            thread::sleep(Duration::from_millis(10));
        })
    };

    let decision = mediator.decide(&bash("npm test --coverage"));
    let escalated = watcher.join().unwrap();

    assert_eq!(decision, Decision::Allow { reason: None });
    assert_eq!(escalated.tool_name, "Bash");
    assert_eq!(escalated.tool_input["command"], "npm test --coverage");
    assert_eq!(escalated.session_id.as_deref(), Some("sess-1"));
    assert_eq!(escalated.raw_request_payload["cwd"], "/repo");
    assert!(channel.pending_requests().unwrap().is_empty());
}

#[test]
fn test_wildcard_rule_cannot_smuggle_chained_command() {
    let dir = supervised_dir(json!({"tools": [], "bashRules": [["cd", "*"]]}));
    let config = MediatorConfig {
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        ..MediatorConfig::default()
    };
    let mediator = Mediator::new(dir.path(), config);

    assert_eq!(
        mediator.decide(&bash("cd /x")),
        Decision::Allow { reason: None }
    );
    assert!(matches!(
        mediator.decide(&bash("cd /x && git push")),
        Decision::Deny { .. }
    ));
    assert!(ApprovalChannel::new(dir.path())
        .pending_requests()
        .unwrap()
        .is_empty());
}

fn run_binary(ipc_dir: &std::path::Path, payload: &Value) -> String {
    let mut child = Command::new(env!("CARGO_BIN_EXE_permission-mediator"))
        .arg(ipc_dir)
        .env("AGENT_MEDIATOR_TIMEOUT_MS", "200")
        .env("AGENT_MEDIATOR_POLL_MS", "20")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(payload.to_string().as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn test_binary_abstains_without_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let stdout = run_binary(dir.path(), &json!({"tool_name": "Read", "tool_input": {}}));
    assert!(stdout.is_empty());
}

#[test]
fn test_binary_emits_hook_decision() {
    let dir = supervised_dir(json!(["Edit"]));
    let stdout = run_binary(
        dir.path(),
        &json!({"tool_name": "Edit", "tool_input": {"file_path": "a.rs"}}),
    );
    let value: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(value["hookSpecificOutput"]["hookEventName"], "PreToolUse");
    assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "allow");

    let stdout = run_binary(
        dir.path(),
        &json!({"tool_name": "Write", "tool_input": {"file_path": "a.rs"}}),
    );
    let value: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "deny");
}
