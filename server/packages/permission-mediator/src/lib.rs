//! Permission mediation for agent CLI tool calls.
//!
//! The `permission-mediator` binary is registered as a `PreToolUse` hook. For
//! each sensitive tool call it either abstains, allows, denies, or escalates
//! to a human watching the session through a filesystem IPC directory (see
//! [`ipc`]).

pub mod allowlist;
pub mod config;
pub mod error;
pub mod hook;
pub mod ipc;
pub mod liveness;
pub mod mediator;
pub mod rules;
pub mod telemetry;
pub mod tokenizer;

pub use allowlist::Allowlist;
pub use config::MediatorConfig;
pub use error::MediatorError;
pub use ipc::{ApprovalChannel, ApprovalDecision, ApprovalResponse, PendingApproval};
pub use liveness::LivenessMonitor;
pub use mediator::{Decision, Mediator, ToolRequest};
pub use rules::{matches_any, BashRule};
pub use tokenizer::tokenize;
