//! Claude Code `--output-format stream-json` records.
//!
//! The CLI emits one record per line: a `system`/`init` record, `assistant`
//! and `user` message records, optional `stream_event` records when partial
//! messages are enabled, and a terminal `result` record. When partial messages
//! are streamed the CLI still emits the aggregated `assistant` record
//! afterwards, so content already delivered through `stream_event` deltas is
//! suppressed for that message id.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use crate::{
    AgentConverter, ContentDeltaData, NormalizedEvent, SessionEndData, SessionStartData,
    StopReason, TokenUsage, ToolInputDeltaData, ToolInvocationEndData, ToolInvocationStartData,
    ToolResultData,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeRecord {
    System(SystemRecord),
    Assistant(MessageRecord),
    User(MessageRecord),
    Result(ResultRecord),
    StreamEvent(StreamEventRecord),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemRecord {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRecord {
    pub message: MessageBody,
    pub session_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    pub id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultRecord {
    pub subtype: Option<String>,
    pub is_error: Option<bool>,
    pub result: Option<String>,
    pub usage: Option<UsageRecord>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageRecord {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
}

impl From<UsageRecord> for TokenUsage {
    fn from(usage: UsageRecord) -> Self {
        TokenUsage {
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
            cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventRecord {
    pub event: StreamEvent,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageBody,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

/// Parses a raw record into its typed shape.
pub fn parse_record(value: &Value) -> Result<ClaudeRecord, String> {
    ClaudeRecord::deserialize(value).map_err(|err| err.to_string())
}

#[derive(Debug)]
struct OpenToolCall {
    id: String,
    partial_json: String,
}

/// Stateful converter for one Claude session.
#[derive(Debug, Default)]
pub struct ClaudeConverter {
    streaming_message: Option<String>,
    streamed_messages: HashSet<String>,
    open_tools: HashMap<usize, OpenToolCall>,
    block_offsets: HashMap<String, usize>,
}

impl ClaudeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn convert_record(&mut self, record: ClaudeRecord) -> Result<Vec<NormalizedEvent>, String> {
        let events = match record {
            ClaudeRecord::System(system) => system_to_normalized(system),
            ClaudeRecord::Assistant(message) => self.assistant_to_normalized(message)?,
            ClaudeRecord::User(message) => user_to_normalized(message)?,
            ClaudeRecord::Result(result) => {
                self.reset_turn();
                result_to_normalized(result)
            }
            ClaudeRecord::StreamEvent(stream) => self.stream_event_to_normalized(stream.event),
            ClaudeRecord::Unknown => Vec::new(),
        };
        Ok(events)
    }

    fn reset_turn(&mut self) {
        self.streaming_message = None;
        self.streamed_messages.clear();
        self.open_tools.clear();
        self.block_offsets.clear();
    }

    fn assistant_to_normalized(
        &mut self,
        record: MessageRecord,
    ) -> Result<Vec<NormalizedEvent>, String> {
        let message_id = record.message.id;
        if let Some(id) = message_id.as_ref() {
            if self.streamed_messages.contains(id) {
                return Ok(Vec::new());
            }
        }

        let blocks = content_blocks(&record.message.content)?;
        let offset = match message_id.as_ref() {
            Some(id) => {
                let seen = self.block_offsets.entry(id.clone()).or_insert(0);
                let offset = *seen;
                *seen += blocks.len();
                offset
            }
            None => 0,
        };

        let mut events = Vec::new();
        for (position, block) in blocks.into_iter().enumerate() {
            let index = offset + position;
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        events.push(NormalizedEvent::TextDelta(ContentDeltaData {
                            message_id: message_id.clone(),
                            index,
                            delta: text,
                        }));
                    }
                }
                ContentBlock::Thinking { thinking } => {
                    if !thinking.is_empty() {
                        events.push(NormalizedEvent::ReasoningDelta(ContentDeltaData {
                            message_id: message_id.clone(),
                            index,
                            delta: thinking,
                        }));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    events.extend(tool_use_events(id, name, input, message_id.clone(), index));
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
            }
        }
        Ok(events)
    }

    fn stream_event_to_normalized(&mut self, event: StreamEvent) -> Vec<NormalizedEvent> {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(id) = message.id.as_ref() {
                    self.streamed_messages.insert(id.clone());
                }
                self.streaming_message = message.id;
                self.open_tools.clear();
                Vec::new()
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } => {
                    self.streaming_delta(index, text, NormalizedEvent::TextDelta)
                }
                ContentBlock::Thinking { thinking } => {
                    self.streaming_delta(index, thinking, NormalizedEvent::ReasoningDelta)
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    self.open_tools.insert(
                        index,
                        OpenToolCall {
                            id: id.clone(),
                            partial_json: String::new(),
                        },
                    );
                    vec![NormalizedEvent::ToolInvocationStart(ToolInvocationStartData {
                        tool_call_id: id,
                        name,
                        message_id: self.streaming_message.clone(),
                        index,
                    })]
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Other => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    self.streaming_delta(index, text, NormalizedEvent::TextDelta)
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    self.streaming_delta(index, thinking, NormalizedEvent::ReasoningDelta)
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(tool) = self.open_tools.get_mut(&index) else {
                        return Vec::new();
                    };
                    if partial_json.is_empty() {
                        return Vec::new();
                    }
                    tool.partial_json.push_str(&partial_json);
                    vec![NormalizedEvent::ToolInputDelta(ToolInputDeltaData {
                        tool_call_id: tool.id.clone(),
                        partial_json,
                    })]
                }
                BlockDelta::Other => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => match self.open_tools.remove(&index) {
                Some(tool) => {
                    let input = if tool.partial_json.trim().is_empty() {
                        None
                    } else {
                        serde_json::from_str(&tool.partial_json).ok()
                    };
                    vec![NormalizedEvent::ToolInvocationEnd(ToolInvocationEndData {
                        tool_call_id: tool.id,
                        input,
                    })]
                }
                None => Vec::new(),
            },
            StreamEvent::MessageStop => {
                self.streaming_message = None;
                self.open_tools.clear();
                Vec::new()
            }
            StreamEvent::Other => Vec::new(),
        }
    }

    fn streaming_delta(
        &self,
        index: usize,
        delta: String,
        wrap: fn(ContentDeltaData) -> NormalizedEvent,
    ) -> Vec<NormalizedEvent> {
        if delta.is_empty() {
            return Vec::new();
        }
        vec![wrap(ContentDeltaData {
            message_id: self.streaming_message.clone(),
            index,
            delta,
        })]
    }
}

impl AgentConverter for ClaudeConverter {
    fn convert(&mut self, record: &Value) -> Result<Vec<NormalizedEvent>, String> {
        let record = parse_record(record)?;
        self.convert_record(record)
    }
}

fn system_to_normalized(record: SystemRecord) -> Vec<NormalizedEvent> {
    if record.subtype.as_deref() != Some("init") {
        return Vec::new();
    }
    let tools = record
        .tools
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    vec![NormalizedEvent::SessionStart(SessionStartData {
        native_session_id: record.session_id,
        model: record.model,
        cwd: record.cwd,
        tools,
    })]
}

fn user_to_normalized(record: MessageRecord) -> Result<Vec<NormalizedEvent>, String> {
    // Plain-string content is an echoed prompt, not a tool result.
    if !record.message.content.is_array() {
        return Ok(Vec::new());
    }
    let events = content_blocks(&record.message.content)?
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(NormalizedEvent::ToolResult(ToolResultData {
                tool_call_id: tool_use_id,
                content: tool_result_text(&content),
                is_error: is_error.unwrap_or(false),
            })),
            _ => None,
        })
        .collect();
    Ok(events)
}

fn result_to_normalized(record: ResultRecord) -> Vec<NormalizedEvent> {
    let is_error = record.is_error.unwrap_or(false);
    vec![NormalizedEvent::SessionEnd(SessionEndData {
        stop_reason: StopReason::from_subtype(record.subtype.as_deref(), is_error),
        usage: record.usage.map(TokenUsage::from).unwrap_or_default(),
        result: record.result,
        total_cost_usd: record.total_cost_usd,
        duration_ms: record.duration_ms,
        num_turns: record.num_turns,
    })]
}

fn tool_use_events(
    id: String,
    name: String,
    input: Value,
    message_id: Option<String>,
    index: usize,
) -> Vec<NormalizedEvent> {
    let mut events = vec![NormalizedEvent::ToolInvocationStart(ToolInvocationStartData {
        tool_call_id: id.clone(),
        name,
        message_id,
        index,
    })];
    let has_input = match &input {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    };
    if has_input {
        events.push(NormalizedEvent::ToolInputDelta(ToolInputDeltaData {
            tool_call_id: id.clone(),
            partial_json: input.to_string(),
        }));
    }
    events.push(NormalizedEvent::ToolInvocationEnd(ToolInvocationEndData {
        tool_call_id: id,
        input: has_input.then_some(input),
    }));
    events
}

fn content_blocks(content: &Value) -> Result<Vec<ContentBlock>, String> {
    match content {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => Ok(vec![ContentBlock::Text { text: text.clone() }]),
        Value::Array(items) => items
            .iter()
            .map(|item| ContentBlock::deserialize(item).map_err(|err| err.to_string()))
            .collect(),
        other => Err(format!("unexpected message content: {other}")),
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
