//! coach-stream: streaming transport for model responses
//!
//! This crate turns an incremental `data:`-framed response into typed
//! [`StreamPart`]s, folds them into an [`AccumulatedMessage`], and runs each
//! request as a cancellable [`StreamConnection`] task.

pub mod accumulator;
pub mod connection;
pub mod error;
pub mod parser;
pub mod part;

pub use accumulator::{AccumulatedMessage, StreamAccumulator, ToolCall};
pub use connection::{
    ConnectionConfig, NoopCallbacks, StreamCallbacks, StreamConnection, StreamHandle,
    StreamOutcome, StreamRequest, StreamStatus,
};
pub use error::{Error, ErrorCategory, Result, StreamError};
pub use parser::{LineDecoder, StreamParser, parse_line};
pub use part::{StreamPart, ToolCallState};
