//! Line decoding and stream-part parsing.
//!
//! The wire format is newline-delimited `data: <payload>` frames. Payloads are
//! either the literal `[DONE]` or a JSON object tagged with `type`. Anything
//! that does not parse as a tagged object is delivered as plain text rather
//! than dropped.

use serde_json::{Map, Value};

use crate::error::StreamError;
use crate::part::{DONE_MARKER, StreamPart, ToolCallState};

/// SSE fields that carry no content for us
const IGNORED_FIELDS: &[&str] = &["event:", "id:", "retry:"];

/// Parse one line of wire data.
///
/// Returns `None` for lines that carry no content: blanks, comments and
/// heartbeats (`:` prefix), non-data SSE fields, and frames whose `type` is
/// not one we know.
pub fn parse_line(line: &str) -> Option<StreamPart> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => {
            if IGNORED_FIELDS.iter().any(|f| line.starts_with(f)) {
                return None;
            }
            line
        }
    };

    if payload.trim() == DONE_MARKER {
        return Some(StreamPart::Done);
    }
    if payload.trim().is_empty() {
        return None;
    }

    parse_payload(payload)
}

fn parse_payload(payload: &str) -> Option<StreamPart> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("type").and_then(Value::as_str) {
            Some(kind) => parse_tagged(kind, &map),
            None => Some(StreamPart::text(payload)),
        },
        Ok(Value::String(s)) => Some(StreamPart::text(s)),
        Ok(_) | Err(_) => Some(StreamPart::text(payload)),
    }
}

fn parse_tagged(kind: &str, map: &Map<String, Value>) -> Option<StreamPart> {
    match kind {
        "text" | "text-delta" => Some(StreamPart::text(
            str_field(map, &["content", "text", "delta"]).unwrap_or_default(),
        )),
        "reasoning" | "reasoning-delta" => Some(StreamPart::reasoning(
            str_field(map, &["content", "text", "delta"]).unwrap_or_default(),
        )),
        "tool-call" => Some(StreamPart::ToolCall {
            tool_call_id: str_field(map, &["toolCallId", "tool_call_id", "id"]).unwrap_or_default(),
            tool_name: str_field(map, &["toolName", "tool_name", "name"]).unwrap_or_default(),
            input: value_field(map, &["input", "args", "arguments"]),
            state: str_field(map, &["state"])
                .and_then(|s| ToolCallState::parse(&s))
                .unwrap_or_default(),
        }),
        "tool-result" => Some(StreamPart::ToolResult {
            tool_call_id: str_field(map, &["toolCallId", "tool_call_id", "id"]).unwrap_or_default(),
            output: value_field(map, &["output", "result"]),
            error: error_text(map.get("error").or_else(|| map.get("errorText"))),
        }),
        "metadata" => {
            let metadata = match map.get("metadata") {
                Some(Value::Object(m)) => m.clone(),
                _ => map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "type")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };
            Some(StreamPart::Metadata { metadata })
        }
        "error" => {
            let message = str_field(map, &["message", "errorText"])
                .or_else(|| error_text(map.get("error")))
                .unwrap_or_else(|| "Unknown error".to_string());
            let code = map.get("code").and_then(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            let is_retryable = map
                .get("isRetryable")
                .or_else(|| map.get("retryable"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Some(StreamPart::Error(StreamError::new(message, code, is_retryable)))
        }
        "done" | "finish" => Some(StreamPart::Done),
        other => {
            tracing::debug!("Ignoring stream frame of unknown type '{}'", other);
            None
        }
    }
}

fn str_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn value_field(map: &Map<String, Value>, keys: &[&str]) -> Value {
    keys.iter()
        .find_map(|k| map.get(*k).cloned())
        .unwrap_or(Value::Null)
}

/// Extract an error string from either a bare string or `{message: ..}`
fn error_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(m) => m.get("message").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Splits an incoming byte stream into lines.
///
/// The trailing incomplete line is kept until the next chunk (or [`finish`])
/// completes it. Splitting happens on raw bytes, so a multi-byte UTF-8
/// character cut across two chunks is reassembled before decoding.
///
/// [`finish`]: LineDecoder::finish
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Flush the unterminated remainder, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

/// Byte chunks in, stream parts out.
#[derive(Debug, Default)]
pub struct StreamParser {
    decoder: LineDecoder,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the parts from every line it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamPart> {
        self.decoder
            .push(chunk)
            .iter()
            .filter_map(|line| parse_line(line))
            .collect()
    }

    /// Parse whatever was left without a trailing newline
    pub fn finish(&mut self) -> Option<StreamPart> {
        self.decoder.finish().and_then(|line| parse_line(&line))
    }
}
