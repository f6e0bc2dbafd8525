//! Fan one user message out to several models at once.
//!
//! Each model gets its own [`StreamHandle`]; aborting one never touches the
//! others. A shared tracker counts completions so `on_all_complete` fires
//! exactly once, after every model has reported, whatever the outcome.

use std::sync::Arc;

use coach_stream::{
    StreamCallbacks, StreamConnection, StreamError, StreamHandle, StreamOutcome, StreamPart,
    StreamRequest,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Starts a single stream. Implemented by [`StreamConnection`].
pub trait StreamDispatcher: Send + Sync {
    fn dispatch(&self, request: StreamRequest, callbacks: Arc<dyn StreamCallbacks>) -> StreamHandle;
}

impl StreamDispatcher for StreamConnection {
    fn dispatch(&self, request: StreamRequest, callbacks: Arc<dyn StreamCallbacks>) -> StreamHandle {
        self.connect(request, callbacks)
    }
}

/// What to send to every selected model
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub conversation_id: String,
    pub content: String,
    /// Extra body fields sent with every request
    pub context: Map<String, Value>,
    /// When set, each reply id is `<key>-<model>` instead of a fresh uuid,
    /// so dispatching the same request again targets the same messages
    pub reply_key: Option<String>,
}

impl DispatchRequest {
    pub fn new(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            context: Map::new(),
            reply_key: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_reply_key(mut self, key: impl Into<String>) -> Self {
        self.reply_key = Some(key.into());
        self
    }
}

/// Final outcome for one model
#[derive(Debug, Clone)]
pub struct ModelOutcome {
    pub model_id: String,
    pub outcome: StreamOutcome,
}

/// Receives progress for a multi-model send, tagged with the model id
pub trait MultiStreamCallbacks: Send + Sync {
    fn on_part(&self, _model_id: &str, _part: &StreamPart) {}
    fn on_error(&self, _model_id: &str, _error: &StreamError) {}
    fn on_model_complete(&self, _model_id: &str, _outcome: &StreamOutcome) {}
    /// Fires once, after every model has completed. Outcomes are in dispatch order.
    fn on_all_complete(&self, _outcomes: &[ModelOutcome]) {}
}

/// Callbacks that ignore everything
pub struct NoopMultiCallbacks;

impl MultiStreamCallbacks for NoopMultiCallbacks {}

struct TrackerState {
    slots: Vec<Option<ModelOutcome>>,
    remaining: usize,
    all: Option<Vec<ModelOutcome>>,
}

/// Counts per-model completions in dispatch order
struct CompletionTracker {
    state: Mutex<TrackerState>,
    done: Notify,
}

impl CompletionTracker {
    fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                slots: vec![None; count],
                remaining: count,
                all: None,
            }),
            done: Notify::new(),
        }
    }

    /// Record a completion. Returns every outcome when this was the last one.
    fn complete(&self, index: usize, outcome: ModelOutcome) -> Option<Vec<ModelOutcome>> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(index)?;
        if slot.is_some() {
            return None;
        }
        *slot = Some(outcome);
        state.remaining -= 1;
        if state.remaining > 0 {
            return None;
        }

        let all: Vec<ModelOutcome> = state.slots.iter().flatten().cloned().collect();
        state.all = Some(all.clone());
        Some(all)
    }

    fn outcomes(&self) -> Option<Vec<ModelOutcome>> {
        self.state.lock().all.clone()
    }
}

/// Adapts per-stream callbacks to the model-tagged ones
struct ModelCallbacks {
    model_id: String,
    index: usize,
    tracker: Arc<CompletionTracker>,
    callbacks: Arc<dyn MultiStreamCallbacks>,
}

impl StreamCallbacks for ModelCallbacks {
    fn on_part(&self, part: &StreamPart) {
        self.callbacks.on_part(&self.model_id, part);
    }

    fn on_error(&self, error: &StreamError) {
        self.callbacks.on_error(&self.model_id, error);
    }

    fn on_complete(&self, outcome: &StreamOutcome) {
        self.callbacks.on_model_complete(&self.model_id, outcome);
        let finished = self.tracker.complete(
            self.index,
            ModelOutcome {
                model_id: self.model_id.clone(),
                outcome: outcome.clone(),
            },
        );
        if let Some(all) = finished {
            tracing::debug!("All {} model streams complete", all.len());
            self.callbacks.on_all_complete(&all);
            self.tracker.done.notify_waiters();
        }
    }
}

/// Handle on a multi-model send. Cheap to clone.
#[derive(Clone)]
pub struct MultiStreamHandle {
    streams: Arc<Vec<(String, StreamHandle)>>,
    tracker: Arc<CompletionTracker>,
    usage_model: Option<String>,
}

impl MultiStreamHandle {
    /// Abort every stream that is still running
    pub fn abort_all(&self) {
        for (_, handle) in self.streams.iter() {
            handle.abort();
        }
    }

    /// Abort one model's stream. Returns `false` for an unknown model.
    pub fn abort(&self, model_id: &str) -> bool {
        match self.handle(model_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_active_streams(&self) -> bool {
        self.streams.iter().any(|(_, h)| h.is_active())
    }

    /// Handles in dispatch order
    pub fn handles(&self) -> &[(String, StreamHandle)] {
        &self.streams
    }

    pub fn handle(&self, model_id: &str) -> Option<&StreamHandle> {
        self.streams
            .iter()
            .find(|(id, _)| id == model_id)
            .map(|(_, h)| h)
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.streams.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// The model whose request carried the usage-increment flag
    pub fn usage_model(&self) -> Option<&str> {
        self.usage_model.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.outcomes().is_some()
    }

    /// Wait for every model to finish; outcomes are in dispatch order
    pub async fn wait_all(&self) -> Vec<ModelOutcome> {
        loop {
            let notified = self.tracker.done.notified();
            if let Some(outcomes) = self.tracker.outcomes() {
                return outcomes;
            }
            notified.await;
        }
    }
}

/// Starts one stream per selected model
#[derive(Clone)]
pub struct MultiStreamOrchestrator {
    dispatcher: Arc<dyn StreamDispatcher>,
    endpoint: String,
}

impl MultiStreamOrchestrator {
    pub fn new(dispatcher: Arc<dyn StreamDispatcher>, endpoint: impl Into<String>) -> Self {
        Self {
            dispatcher,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Dispatch `request` to every model without waiting on any of them.
    ///
    /// Duplicate model ids are sent once. The first model's request is the
    /// only one flagged to increment usage.
    pub fn send_multi_model_message(
        &self,
        request: &DispatchRequest,
        models: &[String],
        callbacks: Arc<dyn MultiStreamCallbacks>,
    ) -> Result<MultiStreamHandle> {
        let mut unique: Vec<&String> = Vec::with_capacity(models.len());
        for model in models {
            if !unique.contains(&model) {
                unique.push(model);
            }
        }
        if unique.is_empty() {
            return Err(Error::Validation("no models selected".to_string()));
        }

        let tracker = Arc::new(CompletionTracker::new(unique.len()));
        let mut streams = Vec::with_capacity(unique.len());

        for (index, model_id) in unique.iter().enumerate() {
            let message_id = match &request.reply_key {
                Some(key) => format!("{}-{}", key, model_id),
                None => uuid::Uuid::new_v4().to_string(),
            };
            let increment_usage = index == 0;

            let mut body = request.context.clone();
            body.insert("conversationId".into(), Value::from(request.conversation_id.clone()));
            body.insert("content".into(), Value::from(request.content.clone()));
            body.insert("modelId".into(), Value::from(model_id.as_str()));
            body.insert("messageId".into(), Value::from(message_id.clone()));
            body.insert("incrementUsage".into(), Value::Bool(increment_usage));

            let stream_request = StreamRequest::new(
                self.endpoint.clone(),
                request.conversation_id.clone(),
                Value::Object(body),
            )
            .with_message_id(message_id);

            let model_callbacks = Arc::new(ModelCallbacks {
                model_id: model_id.to_string(),
                index,
                tracker: tracker.clone(),
                callbacks: callbacks.clone(),
            });

            tracing::debug!(
                "Dispatching {} for conversation {} (usage: {})",
                model_id,
                request.conversation_id,
                increment_usage
            );
            let handle = self.dispatcher.dispatch(stream_request, model_callbacks);
            streams.push((model_id.to_string(), handle));
        }

        Ok(MultiStreamHandle {
            streams: Arc::new(streams),
            tracker,
            usage_model: unique.first().map(|m| m.to_string()),
        })
    }
}
