//! Folds stream parts into a renderable assistant message

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StreamError;
use crate::part::{StreamPart, ToolCallState};

/// A tool call as seen so far in the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub state: ToolCallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time projection of an accumulator, tagged with its message identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
    pub is_complete: bool,
}

impl AccumulatedMessage {
    /// Whether anything worth showing or persisting arrived
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
            || !self.reasoning.trim().is_empty()
            || !self.tool_calls.is_empty()
    }
}

/// Mutable fold state for one in-flight response.
///
/// Parts are applied strictly in arrival order. Once a `done` or `error` part
/// has been applied the accumulator is finished and later parts are ignored,
/// so nothing recorded before the terminal part can be lost or rewritten.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    metadata: Map<String, Value>,
    error: Option<StreamError>,
    is_complete: bool,
}

impl StreamAccumulator {
    /// Create a new accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one stream part
    pub fn process(&mut self, part: &StreamPart) {
        if self.is_finished() {
            tracing::trace!("Ignoring '{}' part after stream finished", part.kind());
            return;
        }

        match part {
            StreamPart::Text { content } => self.content.push_str(content),
            StreamPart::Reasoning { content } => self.reasoning.push_str(content),
            StreamPart::ToolCall {
                tool_call_id,
                tool_name,
                input,
                state,
            } => self.upsert_tool_call(tool_call_id, tool_name, input, *state),
            StreamPart::ToolResult {
                tool_call_id,
                output,
                error,
            } => self.apply_tool_result(tool_call_id, output, error.as_deref()),
            StreamPart::Metadata { metadata } => {
                for (key, value) in metadata {
                    self.metadata.insert(key.clone(), value.clone());
                }
            }
            StreamPart::Error(error) => self.error = Some(error.clone()),
            StreamPart::Done => self.is_complete = true,
        }
    }

    fn upsert_tool_call(&mut self, id: &str, name: &str, input: &Value, state: ToolCallState) {
        match self.tool_calls.iter_mut().find(|c| c.id == id) {
            // A late update may refresh the call's description but never
            // walk its state back.
            Some(existing) if existing.state.rank() > state.rank() => {
                tracing::debug!(
                    "Tool call {} update would regress {:?} -> {:?}, keeping state",
                    id,
                    existing.state,
                    state
                );
                existing.name = name.to_string();
                existing.input = input.clone();
            }
            Some(existing) => {
                *existing = ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                    output: None,
                    state,
                    error: None,
                };
            }
            None => self.tool_calls.push(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
                output: None,
                state,
                error: None,
            }),
        }
    }

    fn apply_tool_result(&mut self, id: &str, output: &Value, error: Option<&str>) {
        let Some(call) = self.tool_calls.iter_mut().find(|c| c.id == id) else {
            tracing::debug!("Dropping result for unknown tool call {}", id);
            return;
        };

        call.output = (!output.is_null()).then(|| output.clone());
        match error.filter(|e| !e.is_empty()) {
            Some(error) => {
                call.state = ToolCallState::OutputError;
                call.error = Some(error.to_string());
            }
            None => {
                call.state = ToolCallState::OutputAvailable;
                call.error = None;
            }
        }
    }

    /// Concatenated text so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Concatenated reasoning so far
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Tool calls in first-seen order
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    /// Look up a tool call by id
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.id == id)
    }

    /// Merged metadata
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Terminal error, if one was recorded
    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    /// Whether a `done` part was seen
    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Whether a terminal part (done or error) was seen
    pub fn is_finished(&self) -> bool {
        self.is_complete || self.error.is_some()
    }

    /// Project the current state. Safe to call mid-stream.
    pub fn get_state(
        &self,
        id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> AccumulatedMessage {
        AccumulatedMessage {
            id: id.into(),
            conversation_id: conversation_id.into(),
            content: self.content.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.tool_calls.clone(),
            metadata: self.metadata.clone(),
            error: self.error.clone(),
            is_complete: self.is_complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> StreamPart {
        match value {
            Value::Object(metadata) => StreamPart::Metadata { metadata },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_text_and_reasoning_append() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::text("Hel"));
        acc.process(&StreamPart::reasoning("hmm"));
        acc.process(&StreamPart::text("lo"));
        assert_eq!(acc.content(), "Hello");
        assert_eq!(acc.reasoning(), "hmm");
        assert!(!acc.is_complete());
    }

    #[test]
    fn test_done_marks_complete() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::text("x"));
        acc.process(&StreamPart::Done);
        assert!(acc.is_complete());
        assert!(acc.error().is_none());
    }

    #[test]
    fn test_error_preserves_partial_content() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::text("partial "));
        acc.process(&StreamPart::reasoning("because"));
        acc.process(&StreamPart::tool_call("c1", "t", json!({}), ToolCallState::InputAvailable));
        acc.process(&StreamPart::error("boom", None, true));

        assert!(!acc.is_complete());
        assert_eq!(acc.error().map(|e| e.message.as_str()), Some("boom"));
        assert_eq!(acc.content(), "partial ");
        assert_eq!(acc.reasoning(), "because");
        assert_eq!(acc.tool_calls().len(), 1);
    }

    #[test]
    fn test_parts_after_terminal_are_ignored() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::text("a"));
        acc.process(&StreamPart::error("boom", None, false));
        acc.process(&StreamPart::text("b"));
        acc.process(&StreamPart::Done);
        assert_eq!(acc.content(), "a");
        assert!(!acc.is_complete());
    }

    #[test]
    fn test_tool_call_replaces_fields() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::tool_call("c1", "draft", json!({"q": "a"}), ToolCallState::InputStreaming));
        acc.process(&StreamPart::tool_call("c1", "search", json!({"q": "ab"}), ToolCallState::InputAvailable));

        let call = acc.tool_call("c1").unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.input, json!({"q": "ab"}));
        assert_eq!(call.state, ToolCallState::InputAvailable);
        assert_eq!(acc.tool_calls().len(), 1);
    }

    #[test]
    fn test_tool_result_sets_output() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::tool_call("c1", "search", json!({}), ToolCallState::InputAvailable));
        acc.process(&StreamPart::tool_result("c1", json!({"hits": 3}), None));

        let call = acc.tool_call("c1").unwrap();
        assert_eq!(call.state, ToolCallState::OutputAvailable);
        assert_eq!(call.output, Some(json!({"hits": 3})));
        assert!(call.error.is_none());
    }

    #[test]
    fn test_tool_result_with_error() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::tool_call("c1", "search", json!({}), ToolCallState::InputAvailable));
        acc.process(&StreamPart::tool_result("c1", Value::Null, Some("timeout".into())));

        let call = acc.tool_call("c1").unwrap();
        assert_eq!(call.state, ToolCallState::OutputError);
        assert_eq!(call.error.as_deref(), Some("timeout"));
        assert!(call.output.is_none());
    }

    #[test]
    fn test_tool_result_for_unknown_call_is_dropped() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::tool_result("ghost", json!(1), None));
        assert!(acc.tool_calls().is_empty());
    }

    #[test]
    fn test_tool_state_never_regresses() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::tool_call("c1", "search", json!({}), ToolCallState::InputAvailable));
        acc.process(&StreamPart::tool_result("c1", json!("ok"), None));
        acc.process(&StreamPart::tool_call("c1", "search2", json!({"x": 1}), ToolCallState::InputStreaming));

        let call = acc.tool_call("c1").unwrap();
        assert_eq!(call.state, ToolCallState::OutputAvailable);
        assert_eq!(call.output, Some(json!("ok")));
        assert_eq!(call.name, "search2");
    }

    #[test]
    fn test_tool_state_sequence_is_monotonic() {
        let parts = vec![
            StreamPart::tool_call("c1", "t", json!({}), ToolCallState::InputStreaming),
            StreamPart::tool_call("c1", "t", json!({}), ToolCallState::InputAvailable),
            StreamPart::tool_call("c1", "t", json!({}), ToolCallState::InputStreaming),
            StreamPart::tool_result("c1", json!(1), None),
            StreamPart::tool_call("c1", "t", json!({}), ToolCallState::InputAvailable),
        ];
        let mut acc = StreamAccumulator::new();
        let mut last_rank = 0;
        for part in &parts {
            acc.process(part);
            let rank = acc.tool_call("c1").unwrap().state.rank();
            assert!(rank >= last_rank, "state regressed after {:?}", part);
            last_rank = rank;
        }
    }

    #[test]
    fn test_metadata_shallow_merge() {
        let mut acc = StreamAccumulator::new();
        acc.process(&metadata(json!({"model": "a", "usage": {"in": 1}})));
        acc.process(&metadata(json!({"model": "b", "finish": "stop"})));

        assert_eq!(acc.metadata()["model"], "b");
        assert_eq!(acc.metadata()["usage"], json!({"in": 1}));
        assert_eq!(acc.metadata()["finish"], "stop");
    }

    #[test]
    fn test_get_state_mid_stream() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::text("so far"));
        let state = acc.get_state("m1", "conv1");
        assert_eq!(state.id, "m1");
        assert_eq!(state.conversation_id, "conv1");
        assert_eq!(state.content, "so far");
        assert!(!state.is_complete);
        assert!(state.has_content());

        acc.process(&StreamPart::text(" and more"));
        // The earlier projection is a copy
        assert_eq!(state.content, "so far");
        assert_eq!(acc.get_state("m1", "conv1").content, "so far and more");
    }

    #[test]
    fn test_has_content_ignores_whitespace() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamPart::text("  \n"));
        assert!(!acc.get_state("m", "c").has_content());
    }
}
