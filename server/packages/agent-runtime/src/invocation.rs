//! Agent command lines and how they are launched.

use std::path::Path;
use std::process::Stdio;

use serde_json::{json, Value};
use tokio::process::Command;

use agent_runtime_schema::AgentKind;

use crate::config::RuntimeConfig;

/// Program and arguments for one agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Builds the headless streaming invocation for `agent`. `hook_settings`
    /// is a Claude `--settings` document and is ignored for other agents.
    pub fn build(
        agent: AgentKind,
        config: &RuntimeConfig,
        resume_token: Option<&str>,
        hook_settings: Option<&Value>,
    ) -> Self {
        let mut args: Vec<String> = Vec::new();
        match agent {
            AgentKind::Claude => {
                args.extend(
                    [
                        "-p",
                        "--output-format",
                        "stream-json",
                        "--input-format",
                        "stream-json",
                        "--verbose",
                        "--include-partial-messages",
                    ]
                    .map(String::from),
                );
                if let Some(settings) = hook_settings {
                    args.push("--settings".to_string());
                    args.push(settings.to_string());
                }
                args.extend(config.extra_args.iter().cloned());
                if let Some(token) = resume_token {
                    args.push("--resume".to_string());
                    args.push(token.to_string());
                }
            }
            AgentKind::Codex => {
                args.extend(["exec", "--json", "--skip-git-repo-check"].map(String::from));
                args.extend(config.extra_args.iter().cloned());
                if let Some(token) = resume_token {
                    args.push("resume".to_string());
                    args.push(token.to_string());
                }
                // Prompt is read from stdin.
                args.push("-".to_string());
            }
        }
        Self {
            program: config.program(agent),
            args,
        }
    }

    /// A command with all three stdio streams piped, launched either directly
    /// or through the user's interactive login shell.
    pub fn command(&self, working_directory: &Path, config: &RuntimeConfig) -> Command {
        let mut cmd = if config.login_shell {
            shell_command(config.shell.as_deref(), &self.program, &self.args)
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);
            cmd
        };
        cmd.current_dir(working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(unix)]
fn shell_command(shell: Option<&str>, program: &str, args: &[String]) -> Command {
    let shell = login_shell_path(shell);
    let mut cmd = Command::new(shell);
    // `exec` replaces the shell so the child pid is the agent itself.
    cmd.args(["-l", "-i", "-c", r#"exec "$0" "$@""#])
        .arg(program)
        .args(args);
    cmd
}

#[cfg(windows)]
fn shell_command(_shell: Option<&str>, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(program).args(args);
    cmd
}

/// The configured shell, else `$SHELL` when it is POSIX-compatible, else
/// `/bin/sh`.
#[cfg(unix)]
fn login_shell_path(configured: Option<&str>) -> String {
    const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];
    if let Some(shell) = configured {
        return shell.to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|shell| {
            Path::new(shell)
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| POSIX_SHELLS.contains(&name))
        })
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Claude `--settings` document registering the mediator as a `PreToolUse`
/// hook for every tool.
pub fn hook_settings(mediator_path: &Path, ipc_dir: &Path) -> Value {
    let command = format!(
        "{} {}",
        shell_quote(&mediator_path.to_string_lossy()),
        shell_quote(&ipc_dir.to_string_lossy())
    );
    json!({
        "hooks": {
            "PreToolUse": [{
                "matcher": "*",
                "hooks": [{ "type": "command", "command": command, "timeout": 60 }]
            }]
        }
    })
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Encodes one user turn for the agent's stdin.
pub fn encode_user_turn(agent: AgentKind, message: &str) -> String {
    match agent {
        AgentKind::Claude => {
            let record = json!({
                "type": "user",
                "message": {
                    "role": "user",
                    "content": [{ "type": "text", "text": message }]
                }
            });
            format!("{record}\n")
        }
        AgentKind::Codex => format!("{message}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_resume_invocation() {
        let config = RuntimeConfig::default();
        let invocation = Invocation::build(AgentKind::Claude, &config, Some("sess-9"), None);
        assert_eq!(invocation.program, "claude");
        assert_eq!(&invocation.args[..3], &["-p", "--output-format", "stream-json"]);
        assert!(invocation.args.contains(&"--include-partial-messages".to_string()));
        assert_eq!(&invocation.args[invocation.args.len() - 2..], &["--resume", "sess-9"]);
    }

    #[test]
    fn claude_hook_settings_are_passed() {
        let config = RuntimeConfig::default();
        let settings = hook_settings(Path::new("/opt/bin/permission-mediator"), Path::new("/tmp/it's"));
        let invocation = Invocation::build(AgentKind::Claude, &config, None, Some(&settings));
        let index = invocation
            .args
            .iter()
            .position(|arg| arg == "--settings")
            .unwrap();
        let passed: Value = serde_json::from_str(&invocation.args[index + 1]).unwrap();
        assert_eq!(
            passed["hooks"]["PreToolUse"][0]["hooks"][0]["command"],
            r"'/opt/bin/permission-mediator' '/tmp/it'\''s'"
        );
    }

    #[test]
    fn codex_reads_prompt_from_stdin() {
        let config = RuntimeConfig {
            extra_args: vec!["--model".to_string(), "o4".to_string()],
            ..RuntimeConfig::default()
        };
        let fresh = Invocation::build(AgentKind::Codex, &config, None, None);
        assert_eq!(
            fresh.args,
            vec!["exec", "--json", "--skip-git-repo-check", "--model", "o4", "-"]
        );
        let resumed = Invocation::build(AgentKind::Codex, &config, Some("th_1"), None);
        assert_eq!(&resumed.args[resumed.args.len() - 3..], &["resume", "th_1", "-"]);
    }

    #[cfg(unix)]
    #[test]
    fn login_shell_execs_the_agent() {
        let config = RuntimeConfig {
            shell: Some("/bin/sh".to_string()),
            ..RuntimeConfig::default()
        };
        let invocation = Invocation {
            program: "/opt/claude".to_string(),
            args: vec!["-p".to_string()],
        };
        let cmd = invocation.command(Path::new("/tmp"), &config);
        let cmd = cmd.as_std();
        assert_eq!(cmd.get_program(), "/bin/sh");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["-l", "-i", "-c", r#"exec "$0" "$@""#, "/opt/claude", "-p"]);

        let direct = RuntimeConfig {
            login_shell: false,
            ..config
        };
        let cmd = invocation.command(Path::new("/tmp"), &direct);
        assert_eq!(cmd.as_std().get_program(), "/opt/claude");
    }

    #[test]
    fn user_turn_encoding() {
        let line = encode_user_turn(AgentKind::Claude, "hi\nthere");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["message"]["content"][0]["text"], "hi\nthere");
        assert_eq!(encode_user_turn(AgentKind::Codex, "go"), "go\n");
    }
}
