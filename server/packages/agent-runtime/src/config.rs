//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use agent_runtime_schema::AgentKind;

pub const ENV_PREFIX: &str = "AGENT_RUNTIME_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Time between SIGTERM and SIGKILL when killing a session.
    pub kill_grace: Duration,
    /// Launch agents through the user's login shell so `PATH` customizations
    /// apply.
    pub login_shell: bool,
    /// Shell used when `login_shell` is set. Defaults to `$SHELL` when it is
    /// POSIX-compatible, `/bin/sh` otherwise.
    pub shell: Option<String>,
    pub claude_program: Option<String>,
    pub codex_program: Option<String>,
    /// Appended to every agent invocation.
    pub extra_args: Vec<String>,
    pub event_capacity: usize,
    /// When set, Claude sessions are spawned with the permission mediator
    /// registered as a `PreToolUse` hook.
    pub permission_hook: Option<PermissionHookConfig>,
    pub heartbeat_interval: Duration,
    pub approval_poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionHookConfig {
    pub mediator_path: PathBuf,
    /// Parent of the per-session IPC directories.
    pub ipc_root: PathBuf,
}

impl PermissionHookConfig {
    pub fn ipc_dir(&self, session_id: &str) -> PathBuf {
        self.ipc_root.join(session_id)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            login_shell: true,
            shell: None,
            claude_program: None,
            codex_program: None,
            extra_args: Vec::new(),
            event_capacity: 1024,
            permission_hook: None,
            heartbeat_interval: Duration::from_secs(2),
            approval_poll_interval: Duration::from_millis(250),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let millis = |name: &str| {
            let value = var(name)?;
            match value.parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    tracing::warn!(key = %format!("{ENV_PREFIX}{name}"), value = %value, "ignoring invalid duration");
                    None
                }
            }
        };

        let mut config = Self::default();
        if let Some(grace) = millis("KILL_GRACE_MS") {
            config.kill_grace = grace;
        }
        if let Some(interval) = millis("HEARTBEAT_MS") {
            config.heartbeat_interval = interval;
        }
        if let Some(interval) = millis("APPROVAL_POLL_MS") {
            config.approval_poll_interval = interval;
        }
        if let Some(login_shell) = var("LOGIN_SHELL") {
            config.login_shell = !matches!(
                login_shell.to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
        config.shell = var("SHELL");
        config.claude_program = var("CLAUDE_PATH");
        config.codex_program = var("CODEX_PATH");
        if let Some(args) = var("EXTRA_ARGS") {
            config.extra_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(capacity) = var("EVENT_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            config.event_capacity = capacity.max(1);
        }
        if let Some(mediator_path) = var("MEDIATOR_PATH") {
            config.permission_hook = Some(PermissionHookConfig {
                mediator_path: PathBuf::from(mediator_path),
                ipc_root: var("IPC_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_ipc_root),
            });
        }
        config
    }

    pub fn program(&self, agent: AgentKind) -> String {
        let configured = match agent {
            AgentKind::Claude => self.claude_program.as_ref(),
            AgentKind::Codex => self.codex_program.as_ref(),
        };
        configured
            .cloned()
            .unwrap_or_else(|| agent.default_program().to_string())
    }
}

/// `<data dir>/agent-runtime/ipc`.
pub fn default_ipc_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-runtime")
        .join("ipc")
}
