use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use agent_runtime_error::RuntimeError;
use agent_runtime_permission_mediator::telemetry::init_logging;
use agent_runtime_permission_mediator::{
    Allowlist, ApprovalChannel, ApprovalResponse, MediatorError, PendingApproval,
};
use agent_runtime_schema::AgentKind;

use crate::approvals::ApprovalBridge;
use crate::config::{default_ipc_root, PermissionHookConfig, RuntimeConfig};
use crate::supervisor::{SessionEvent, SessionSupervisor, SpawnRequest};

#[derive(Parser, Debug)]
#[command(name = "agent-runtime", version, about = "Run coding-agent CLIs as supervised sessions")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn a session, send one prompt, and print its events as JSON lines.
    Run(RunArgs),
    /// Drive the UI side of a permission IPC directory by hand.
    #[command(subcommand)]
    Approvals(ApprovalsCommand),
    /// Check whether an allowlist authorizes a bash command.
    CheckRule(CheckRuleArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = "claude")]
    agent: AgentKind,
    /// Working directory for the agent (defaults to the current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Continue a previous conversation.
    #[arg(long)]
    resume: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    /// Register this permission-mediator binary as a PreToolUse hook and
    /// print approval requests alongside session events.
    #[arg(long)]
    mediator: Option<PathBuf>,
    /// Parent directory for per-session IPC directories.
    #[arg(long)]
    ipc_root: Option<PathBuf>,
    prompt: String,
}

#[derive(Subcommand, Debug)]
enum ApprovalsCommand {
    /// Keep the heartbeat fresh and print requests as they arrive.
    Heartbeat {
        ipc_dir: PathBuf,
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },
    /// Print pending requests.
    List { ipc_dir: PathBuf },
    /// Answer a pending request.
    Respond {
        ipc_dir: PathBuf,
        request_id: String,
        #[arg(long, conflicts_with = "deny", required_unless_present = "deny")]
        allow: bool,
        #[arg(long)]
        deny: bool,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Args, Debug)]
struct CheckRuleArgs {
    #[arg(long)]
    allowlist: PathBuf,
    command: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Mediator(#[from] MediatorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn run_agent_runtime() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    init_logging("info");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        match cli.command {
            Command::Run(args) => run_session(args).await,
            Command::Approvals(command) => run_approvals(command).await,
            Command::CheckRule(args) => check_rule(&args),
        }
    })
}

async fn run_session(args: RunArgs) -> Result<ExitCode, CliError> {
    let mut config = RuntimeConfig::from_env();
    if let Some(mediator_path) = args.mediator {
        config.permission_hook = Some(PermissionHookConfig {
            mediator_path,
            ipc_root: args.ipc_root.unwrap_or_else(default_ipc_root),
        });
    }
    let (heartbeat, approval_poll) = (config.heartbeat_interval, config.approval_poll_interval);
    let supervisor = SessionSupervisor::new(config);

    let session_id = args
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut events = pin!(supervisor.session_events(&session_id));
    let working_directory = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    let info = supervisor
        .spawn(SpawnRequest {
            agent: args.agent,
            working_directory,
            resume_token: args.resume,
            session_id: Some(session_id.clone()),
        })
        .await?;

    let bridge = info.ipc_dir.as_ref().map(|dir| {
        ApprovalBridge::start(PathBuf::from(dir), heartbeat, approval_poll)
    });
    let mut approvals = bridge.as_ref().map(ApprovalBridge::subscribe);

    supervisor.send(&session_id, &args.prompt).await?;

    let mut exit_code = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            envelope = events.next() => {
                let Some(envelope) = envelope else { break };
                print_json(&envelope)?;
                if let SessionEvent::Exited { exit_code: code, .. } = envelope.event {
                    if code != Some(0) {
                        exit_code = ExitCode::FAILURE;
                    }
                    break;
                }
            }
            request = recv_approval(&mut approvals) => {
                if let Some(request) = request {
                    print_json(&serde_json::json!({ "approvalRequest": request }))?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(session_id = %session_id, "interrupted");
                interrupt(&supervisor, &session_id).await?;
            }
        }
    }

    supervisor.dispose().await;
    Ok(exit_code)
}

/// Kills the session, tolerating one that is already gone (a repeated
/// Ctrl-C, or an exit racing the signal).
async fn interrupt(supervisor: &SessionSupervisor, session_id: &str) -> Result<(), RuntimeError> {
    match supervisor.kill(session_id).await {
        Ok(()) | Err(RuntimeError::SessionNotFound { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn recv_approval(
    approvals: &mut Option<broadcast::Receiver<PendingApproval>>,
) -> Option<PendingApproval> {
    let Some(receiver) = approvals.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(request) => Some(request),
        Err(broadcast::error::RecvError::Lagged(_)) => None,
        Err(broadcast::error::RecvError::Closed) => {
            *approvals = None;
            None
        }
    }
}

async fn run_approvals(command: ApprovalsCommand) -> Result<ExitCode, CliError> {
    match command {
        ApprovalsCommand::Heartbeat {
            ipc_dir,
            interval_ms,
        } => {
            let bridge = ApprovalBridge::start(
                ipc_dir,
                Duration::from_millis(interval_ms),
                Duration::from_millis(250),
            );
            let mut requests = bridge.subscribe();
            loop {
                tokio::select! {
                    request = requests.recv() => {
                        if let Ok(request) = request {
                            print_json(&request)?;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        ApprovalsCommand::List { ipc_dir } => {
            for request in ApprovalChannel::new(ipc_dir).pending_requests()? {
                print_json(&request)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        ApprovalsCommand::Respond {
            ipc_dir,
            request_id,
            allow,
            reason,
            ..
        } => {
            let response = if allow {
                ApprovalResponse {
                    reason,
                    ..ApprovalResponse::allow()
                }
            } else {
                ApprovalResponse::deny(
                    reason.unwrap_or_else(|| "The user denied this request.".to_string()),
                )
            };
            ApprovalChannel::new(ipc_dir).respond(&request_id, &response)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn check_rule(args: &CheckRuleArgs) -> Result<ExitCode, CliError> {
    let allowed = allowlist_allows(&args.allowlist, &args.command);
    print_json(&serde_json::json!({ "command": args.command, "allowed": allowed }))?;
    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn allowlist_allows(path: &Path, command: &str) -> bool {
    Allowlist::load(path).allows_command(command)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}
