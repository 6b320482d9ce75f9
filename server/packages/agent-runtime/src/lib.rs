//! Agent session runtime.
//!
//! Spawns agent CLIs as child processes, normalizes their line-delimited
//! JSON output, and drives the UI side of the permission mediation protocol.

pub mod approvals;
pub mod cli;
pub mod config;
pub mod invocation;
pub mod stream;
pub mod supervisor;

pub use approvals::ApprovalBridge;
pub use config::{PermissionHookConfig, RuntimeConfig};
pub use stream::{StreamItem, StreamTransformer};
pub use supervisor::{
    SessionEnvelope, SessionEvent, SessionInfo, SessionStatus, SessionSupervisor, SpawnRequest,
};
