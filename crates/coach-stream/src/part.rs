//! Stream part types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StreamError;

/// Literal payload that terminates a stream
pub const DONE_MARKER: &str = "[DONE]";

/// Lifecycle of a tool call.
///
/// `InputStreaming → InputAvailable → OutputAvailable | OutputError`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    #[default]
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolCallState {
    /// Parse the wire name, tolerating snake_case
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "input-streaming" | "partial-call" | "streaming" => Some(ToolCallState::InputStreaming),
            "input-available" | "call" => Some(ToolCallState::InputAvailable),
            "output-available" | "result" => Some(ToolCallState::OutputAvailable),
            "output-error" | "error" => Some(ToolCallState::OutputError),
            _ => None,
        }
    }

    /// Position in the lifecycle. Both output states are terminal and share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            ToolCallState::InputStreaming => 0,
            ToolCallState::InputAvailable => 1,
            ToolCallState::OutputAvailable | ToolCallState::OutputError => 2,
        }
    }

    /// Whether the call has produced a result (or failed to)
    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// One typed unit of an incremental model response, in wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamPart {
    /// Text delta
    Text { content: String },
    /// Reasoning delta
    Reasoning { content: String },
    /// Tool call announcement or update
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        state: ToolCallState,
    },
    /// Result for a previously announced tool call
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Arbitrary metadata, shallow-merged by the accumulator
    Metadata { metadata: Map<String, Value> },
    /// Terminal error
    Error(StreamError),
    /// Terminal success marker
    Done,
}

impl StreamPart {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn reasoning(content: impl Into<String>) -> Self {
        Self::Reasoning {
            content: content.into(),
        }
    }

    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
        state: ToolCallState,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
            state,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: Value, error: Option<String>) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            output,
            error,
        }
    }

    pub fn error(message: impl Into<String>, code: Option<String>, is_retryable: bool) -> Self {
        Self::Error(StreamError::new(message, code, is_retryable))
    }

    /// Check if this part ends the stream (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamPart::Done | StreamPart::Error(_))
    }

    /// Wire name of this part's tag
    pub fn kind(&self) -> &'static str {
        match self {
            StreamPart::Text { .. } => "text",
            StreamPart::Reasoning { .. } => "reasoning",
            StreamPart::ToolCall { .. } => "tool-call",
            StreamPart::ToolResult { .. } => "tool-result",
            StreamPart::Metadata { .. } => "metadata",
            StreamPart::Error(_) => "error",
            StreamPart::Done => "done",
        }
    }

    /// Encode as a single `data:` frame (without the trailing newline)
    pub fn to_sse_line(&self) -> String {
        match self {
            StreamPart::Done => format!("data: {}", DONE_MARKER),
            other => format!(
                "data: {}",
                serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_state_rank_is_monotonic() {
        assert!(ToolCallState::InputStreaming.rank() < ToolCallState::InputAvailable.rank());
        assert!(ToolCallState::InputAvailable.rank() < ToolCallState::OutputAvailable.rank());
        assert_eq!(
            ToolCallState::OutputAvailable.rank(),
            ToolCallState::OutputError.rank()
        );
    }

    #[test]
    fn test_tool_state_parse() {
        assert_eq!(
            ToolCallState::parse("input_available"),
            Some(ToolCallState::InputAvailable)
        );
        assert_eq!(
            ToolCallState::parse("output-error"),
            Some(ToolCallState::OutputError)
        );
        assert_eq!(ToolCallState::parse("bogus"), None);
    }

    #[test]
    fn test_error_part_wire_shape() {
        let part = StreamPart::error("overloaded", Some("503".into()), true);
        let json: Value = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "overloaded");
        assert_eq!(json["code"], "503");
        assert_eq!(json["isRetryable"], true);
    }

    #[test]
    fn test_tool_call_wire_shape() {
        let part = StreamPart::tool_call(
            "call_1",
            "search",
            serde_json::json!({"q": "rust"}),
            ToolCallState::InputAvailable,
        );
        let line = part.to_sse_line();
        assert!(line.starts_with("data: {"));
        assert!(line.contains("\"toolCallId\":\"call_1\""));
        assert!(line.contains("\"state\":\"input-available\""));
    }

    #[test]
    fn test_done_line() {
        assert_eq!(StreamPart::Done.to_sse_line(), "data: [DONE]");
        assert!(StreamPart::Done.is_terminal());
        assert!(!StreamPart::text("x").is_terminal());
    }
}
