//! Incremental line-delimited JSON decoding of agent stdout.

use serde_json::Value;

use agent_runtime_schema::{AgentConverter, AgentKind, NormalizedEvent};

/// One complete stdout line after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A parsed vendor record with the normalized events derived from it.
    Record {
        raw: Value,
        events: Vec<NormalizedEvent>,
    },
    /// A line that could not be decoded or converted.
    Unparsed { line: String, error: String },
}

/// Splits a byte stream into lines and converts each one.
///
/// Bytes are buffered until a `\n` arrives, so the output does not depend on
/// how the input was chunked, even when a chunk ends mid UTF-8 sequence.
pub struct StreamTransformer {
    buffer: Vec<u8>,
    converter: Box<dyn AgentConverter>,
}

impl std::fmt::Debug for StreamTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransformer")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl StreamTransformer {
    pub fn new(agent: AgentKind) -> Self {
        Self::with_converter(agent.converter())
    }

    pub fn with_converter(converter: Box<dyn AgentConverter>) -> Self {
        Self {
            buffer: Vec::new(),
            converter,
        }
    }

    /// Bytes held back waiting for a line terminator.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        self.buffer.extend_from_slice(chunk);
        let Some(last_newline) = self.buffer.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|byte| *byte == b'\n')
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    /// Decodes whatever is left in the buffer as a final line.
    pub fn finish(&mut self) -> Vec<StreamItem> {
        let remaining = std::mem::take(&mut self.buffer);
        self.decode_line(&remaining).into_iter().collect()
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<StreamItem> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let raw = match serde_json::from_str::<Value>(text) {
            Ok(raw @ Value::Object(_)) => raw,
            Ok(_) => {
                return Some(StreamItem::Unparsed {
                    line: text.to_string(),
                    error: "expected a JSON object".to_string(),
                })
            }
            Err(err) => {
                return Some(StreamItem::Unparsed {
                    line: text.to_string(),
                    error: err.to_string(),
                })
            }
        };

        match self.converter.convert(&raw) {
            Ok(events) => Some(StreamItem::Record { raw, events }),
            Err(error) => Some(StreamItem::Unparsed {
                line: text.to_string(),
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLAUDE_TRANSCRIPT: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"s-1","model":"claude-sonnet-4","cwd":"/w","tools":["Bash"]}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"m1","content":[]}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"héllo ✓"}}}"#,
        "\r\n",
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"Bash","input":{}}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":\"ls\"}"}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_stop","index":1}}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"héllo ✓"}]}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","is_error":false,"usage":{"input_tokens":3,"output_tokens":4}}"#,
        "\n",
    );

    fn run(chunks: &[&[u8]]) -> Vec<StreamItem> {
        let mut transformer = StreamTransformer::new(AgentKind::Claude);
        let mut items = Vec::new();
        for chunk in chunks {
            items.extend(transformer.push(chunk));
        }
        items.extend(transformer.finish());
        items
    }

    fn event_kinds(items: &[StreamItem]) -> Vec<&'static str> {
        items
            .iter()
            .flat_map(|item| match item {
                StreamItem::Record { events, .. } => events.iter().map(|e| e.kind()).collect(),
                StreamItem::Unparsed { .. } => vec!["unparsed"],
            })
            .collect()
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let bytes = CLAUDE_TRANSCRIPT.as_bytes();
        let whole = run(&[bytes]);

        let per_line: Vec<&[u8]> = bytes.split_inclusive(|b| *b == b'\n').collect();
        let bytewise: Vec<&[u8]> = bytes.chunks(1).collect();
        let odd: Vec<&[u8]> = bytes.chunks(7).collect();

        assert_eq!(run(&per_line), whole);
        assert_eq!(run(&bytewise), whole);
        assert_eq!(run(&odd), whole);
        assert_eq!(
            event_kinds(&whole),
            vec![
                "session_start",
                "text_delta",
                "tool_invocation_start",
                "tool_input_delta",
                "tool_invocation_end",
                "session_end"
            ]
        );
    }

    #[test]
    fn multibyte_text_survives_bytewise_feed() {
        let bytes = CLAUDE_TRANSCRIPT.as_bytes();
        let items = run(&bytes.chunks(1).collect::<Vec<_>>());
        let text = items.iter().find_map(|item| match item {
            StreamItem::Record { events, .. } => events.iter().find_map(|event| match event {
                NormalizedEvent::TextDelta(data) => Some(data.delta.clone()),
                _ => None,
            }),
            _ => None,
        });
        assert_eq!(text.as_deref(), Some("héllo ✓"));
    }

    #[test]
    fn malformed_line_yields_one_diagnostic() {
        let input = concat!(
            r#"{"type":"system","subtype":"init","session_id":"s-1"}"#,
            "\n",
            "this is not json\n",
            r#"{"type":"result","subtype":"success","is_error":false}"#,
            "\n",
        );
        let items = run(&[input.as_bytes()]);
        assert_eq!(event_kinds(&items), vec!["session_start", "unparsed", "session_end"]);
        match &items[1] {
            StreamItem::Unparsed { line, .. } => assert_eq!(line, "this is not json"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn non_object_and_misshapen_records_are_diagnostics() {
        let input = "42\n{\"type\":\"assistant\"}\n{\"type\":\"future_record\"}\n";
        let items = run(&[input.as_bytes()]);
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], StreamItem::Unparsed { .. }));
        assert!(matches!(items[1], StreamItem::Unparsed { .. }));
        match &items[2] {
            StreamItem::Record { raw, events } => {
                assert_eq!(raw["type"], "future_record");
                assert!(events.is_empty());
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn unterminated_line_is_flushed_on_finish() {
        let mut transformer = StreamTransformer::new(AgentKind::Claude);
        let items = transformer.push(br#"{"type":"result","subtype":"success"}"#);
        assert!(items.is_empty());
        assert!(transformer.buffered() > 0);

        let items = transformer.finish();
        assert_eq!(event_kinds(&items), vec!["session_end"]);
        assert_eq!(transformer.buffered(), 0);
        assert!(transformer.finish().is_empty());
    }
}
