use std::io;
use std::path::PathBuf;

use agent_runtime_permission_mediator::telemetry::init_logging;
use agent_runtime_permission_mediator::{hook, MediatorConfig};
use clap::Parser;

/// PreToolUse hook that mediates tool calls through a session IPC directory.
#[derive(Parser, Debug)]
#[command(name = "permission-mediator", version)]
struct Args {
    /// Per-session IPC directory shared with the supervising UI.
    ipc_dir: PathBuf,
}

fn main() {
    // stdout is reserved for the decision document.
    init_logging("warn");
    let args = Args::parse();
    let config = MediatorConfig::from_env();

    // Exit status is always 0.
    if let Err(err) = hook::run(&args.ipc_dir, config, io::stdin().lock(), io::stdout().lock()) {
        tracing::error!(error = %err, "failed to write hook decision");
    }
}
