//! Normalized session events for AI coding-agent CLIs.
//!
//! Each supported agent CLI speaks its own line-delimited JSON protocol. The
//! converters in [`agents`] map those vendor records onto a single closed set
//! of [`NormalizedEvent`]s so a UI can render any agent the same way.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod agents;

pub use agents::claude as convert_claude;
pub use agents::codex as convert_codex;

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
}

impl AgentKind {
    pub fn all() -> &'static [AgentKind] {
        &[AgentKind::Claude, AgentKind::Codex]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }

    /// Executable name looked up on the user's `PATH`.
    pub fn default_program(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }

    /// Fresh converter for one session of this agent.
    pub fn converter(&self) -> Box<dyn AgentConverter> {
        match self {
            AgentKind::Claude => Box::new(convert_claude::ClaudeConverter::new()),
            AgentKind::Codex => Box::new(convert_codex::CodexConverter::new()),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown agent: {0}")]
pub struct ParseAgentKindError(String);

impl FromStr for AgentKind {
    type Err = ParseAgentKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            other => Err(ParseAgentKindError(other.to_string())),
        }
    }
}

/// Maps parsed vendor records to normalized events.
///
/// Converters may keep state across records (partial-message assembly), so
/// one instance must be used per session and fed records in arrival order.
pub trait AgentConverter: Send {
    /// Converts one vendor record. An `Err` means the record had a known type
    /// but an unexpected shape; unknown record types yield `Ok(vec![])`.
    fn convert(&mut self, record: &Value) -> Result<Vec<NormalizedEvent>, String>;
}

/// A session-scoped event handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum NormalizedEvent {
    SessionStart(SessionStartData),
    TextDelta(ContentDeltaData),
    ReasoningDelta(ContentDeltaData),
    ToolInvocationStart(ToolInvocationStartData),
    ToolInputDelta(ToolInputDeltaData),
    ToolInvocationEnd(ToolInvocationEndData),
    ToolResult(ToolResultData),
    SessionEnd(SessionEndData),
}

impl NormalizedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::SessionStart(_) => "session_start",
            NormalizedEvent::TextDelta(_) => "text_delta",
            NormalizedEvent::ReasoningDelta(_) => "reasoning_delta",
            NormalizedEvent::ToolInvocationStart(_) => "tool_invocation_start",
            NormalizedEvent::ToolInputDelta(_) => "tool_input_delta",
            NormalizedEvent::ToolInvocationEnd(_) => "tool_invocation_end",
            NormalizedEvent::ToolResult(_) => "tool_result",
            NormalizedEvent::SessionEnd(_) => "session_end",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartData {
    /// Vendor conversation id; pass it back as the resume token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentDeltaData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Position of the content segment within its message.
    pub index: usize,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationStartData {
    pub tool_call_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolInputDeltaData {
    pub tool_call_id: String,
    pub partial_json: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationEndData {
    pub tool_call_id: String,
    /// Fully assembled tool input, when it could be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultData {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndData {
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
}

/// Normalized token counters. Absent vendor fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent finished its turn normally.
    EndTurn,
    /// The agent hit its configured turn limit.
    MaxTurns,
    /// The turn failed.
    Error,
}

impl StopReason {
    /// Derives a stop reason from a vendor result subtype such as `success`
    /// or `error_max_turns`.
    pub fn from_subtype(subtype: Option<&str>, is_error: bool) -> Self {
        match subtype {
            Some("success") if !is_error => StopReason::EndTurn,
            Some("error_max_turns") => StopReason::MaxTurns,
            Some(other) if other.starts_with("error") => StopReason::Error,
            _ if is_error => StopReason::Error,
            _ => StopReason::EndTurn,
        }
    }
}
