use std::collections::HashSet;

use serde_json::{json, Value};

use crate::{
    AgentConverter, ContentDeltaData, NormalizedEvent, SessionEndData, SessionStartData,
    StopReason, TokenUsage, ToolInputDeltaData, ToolInvocationEndData, ToolInvocationStartData,
    ToolResultData,
};

/// Converter for `codex exec --json` event lines.
///
/// Codex reports whole items rather than token deltas: `item.started` opens a
/// tool call and `item.completed` carries the final text or command output.
#[derive(Debug, Default)]
pub struct CodexConverter {
    started_tools: HashSet<String>,
    item_positions: Vec<String>,
}

impl CodexConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&mut self, item_id: &str) -> usize {
        match self.item_positions.iter().position(|id| id == item_id) {
            Some(index) => index,
            None => {
                self.item_positions.push(item_id.to_string());
                self.item_positions.len() - 1
            }
        }
    }

    fn item_started(&mut self, item: &Value) -> Vec<NormalizedEvent> {
        let Some((id, name, input)) = tool_call_shape(item) else {
            return Vec::new();
        };
        if !self.started_tools.insert(id.clone()) {
            return Vec::new();
        }
        let index = self.position(&id);
        tool_start_events(id, name, &input, index)
    }

    fn item_completed(&mut self, item: &Value) -> Vec<NormalizedEvent> {
        let item_id = item.get("id").and_then(Value::as_str).unwrap_or("");
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
        let text = item.get("text").and_then(Value::as_str).unwrap_or("");

        match item_type {
            "agent_message" | "reasoning" => {
                if text.is_empty() {
                    return Vec::new();
                }
                let data = ContentDeltaData {
                    message_id: Some(item_id.to_string()).filter(|id| !id.is_empty()),
                    index: self.position(item_id),
                    delta: text.to_string(),
                };
                if item_type == "agent_message" {
                    vec![NormalizedEvent::TextDelta(data)]
                } else {
                    vec![NormalizedEvent::ReasoningDelta(data)]
                }
            }
            _ => {
                let Some((id, name, input)) = tool_call_shape(item) else {
                    return Vec::new();
                };
                let mut events = Vec::new();
                if self.started_tools.insert(id.clone()) {
                    let index = self.position(&id);
                    events.extend(tool_start_events(id.clone(), name, &input, index));
                }
                events.push(NormalizedEvent::ToolInvocationEnd(ToolInvocationEndData {
                    tool_call_id: id.clone(),
                    input: Some(input),
                }));
                if let Some(result) = tool_result(item, id) {
                    events.push(result);
                }
                events
            }
        }
    }

    fn end_turn(&mut self) {
        self.started_tools.clear();
        self.item_positions.clear();
    }
}

impl AgentConverter for CodexConverter {
    fn convert(&mut self, record: &Value) -> Result<Vec<NormalizedEvent>, String> {
        let event_type = record.get("type").and_then(Value::as_str).unwrap_or("");

        let events = match event_type {
            "thread.started" => {
                let thread_id = record
                    .get("thread_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "thread.started without thread_id".to_string())?;
                vec![NormalizedEvent::SessionStart(SessionStartData {
                    native_session_id: Some(thread_id.to_string()),
                    ..SessionStartData::default()
                })]
            }
            "item.started" => self.item_started(item_of(record, event_type)?),
            "item.completed" => self.item_completed(item_of(record, event_type)?),
            "turn.completed" => {
                self.end_turn();
                vec![NormalizedEvent::SessionEnd(SessionEndData {
                    stop_reason: StopReason::EndTurn,
                    usage: usage_of(record.get("usage")),
                    result: None,
                    total_cost_usd: None,
                    duration_ms: None,
                    num_turns: None,
                })]
            }
            "turn.failed" | "error" => {
                self.end_turn();
                let message = record
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .or_else(|| record.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                vec![NormalizedEvent::SessionEnd(SessionEndData {
                    stop_reason: StopReason::Error,
                    usage: TokenUsage::default(),
                    result: message,
                    total_cost_usd: None,
                    duration_ms: None,
                    num_turns: None,
                })]
            }
            // turn.started, item.updated and future event types carry nothing to normalize.
            _ => Vec::new(),
        };
        Ok(events)
    }
}

fn item_of<'a>(record: &'a Value, event_type: &str) -> Result<&'a Value, String> {
    record
        .get("item")
        .filter(|item| item.is_object())
        .ok_or_else(|| format!("{event_type} without item"))
}

/// Tool-call identity of an item: `(id, name, input)`.
fn tool_call_shape(item: &Value) -> Option<(String, String, Value)> {
    let id = item.get("id").and_then(Value::as_str)?.to_string();
    let item_type = item.get("type").and_then(Value::as_str)?;
    let (name, input) = match item_type {
        "command_execution" => (
            "command_execution".to_string(),
            json!({ "command": item.get("command").cloned().unwrap_or(Value::Null) }),
        ),
        "file_change" => (
            "file_change".to_string(),
            json!({ "changes": item.get("changes").cloned().unwrap_or(Value::Null) }),
        ),
        "mcp_tool_call" => {
            let server = item.get("server").and_then(Value::as_str).unwrap_or("mcp");
            let tool = item.get("tool").and_then(Value::as_str).unwrap_or("unknown");
            (
                format!("{server}.{tool}"),
                item.get("arguments").cloned().unwrap_or_else(|| json!({})),
            )
        }
        "web_search" => (
            "web_search".to_string(),
            json!({ "query": item.get("query").cloned().unwrap_or(Value::Null) }),
        ),
        _ => return None,
    };
    Some((id, name, input))
}

fn tool_start_events(id: String, name: String, input: &Value, index: usize) -> Vec<NormalizedEvent> {
    vec![
        NormalizedEvent::ToolInvocationStart(ToolInvocationStartData {
            tool_call_id: id.clone(),
            name,
            message_id: None,
            index,
        }),
        NormalizedEvent::ToolInputDelta(ToolInputDeltaData {
            tool_call_id: id,
            partial_json: input.to_string(),
        }),
    ]
}

fn tool_result(item: &Value, tool_call_id: String) -> Option<NormalizedEvent> {
    let status = item.get("status").and_then(Value::as_str).unwrap_or("");
    let failed = status == "failed" || status == "declined";
    match item.get("type").and_then(Value::as_str)? {
        "command_execution" => {
            let exit_code = item.get("exit_code").and_then(Value::as_i64);
            Some(NormalizedEvent::ToolResult(ToolResultData {
                tool_call_id,
                content: item
                    .get("aggregated_output")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                is_error: failed || exit_code.is_some_and(|code| code != 0),
            }))
        }
        "file_change" | "mcp_tool_call" => Some(NormalizedEvent::ToolResult(ToolResultData {
            tool_call_id,
            content: status.to_string(),
            is_error: failed,
        })),
        _ => None,
    }
}

fn usage_of(usage: Option<&Value>) -> TokenUsage {
    let field = |name: &str| {
        usage
            .and_then(|usage| usage.get(name))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: field("cached_input_tokens"),
    }
}
