use std::process::ExitCode;

use agent_runtime::cli::run_agent_runtime;

fn main() -> ExitCode {
    match run_agent_runtime() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "agent-runtime failed");
            ExitCode::FAILURE
        }
    }
}
