//! One streaming request/response cycle.
//!
//! A connection runs as its own task: it opens the request, splits the body
//! into lines, folds parsed parts into a [`StreamAccumulator`] and reports
//! through [`StreamCallbacks`]. It never retries; failures are classified and
//! handed back to the caller.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::accumulator::{AccumulatedMessage, StreamAccumulator};
use crate::error::{Error, Result, StreamError};
use crate::parser::StreamParser;
use crate::part::StreamPart;

/// Connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Fail with a timeout if no bytes arrive for this long
    pub idle_timeout: Option<Duration>,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(60)),
            headers: HashMap::new(),
        }
    }
}

/// What to send, and the identity of the message it will produce
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub endpoint: String,
    pub body: Value,
    pub message_id: String,
    pub conversation_id: String,
}

impl StreamRequest {
    /// Create a request with a fresh message id
    pub fn new(endpoint: impl Into<String>, conversation_id: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            body,
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Use a caller-chosen message id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStatus {
    /// The body ended, with or without a `done` part
    Completed,
    /// The caller aborted; whatever arrived is kept
    Aborted,
    /// Transport failure, non-success status, or an `error` part
    Failed(StreamError),
}

/// Final state of a connection
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub status: StreamStatus,
    pub message: AccumulatedMessage,
    pub finished_at: DateTime<Utc>,
}

impl StreamOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, StreamStatus::Aborted)
    }

    pub fn error(&self) -> Option<&StreamError> {
        match &self.status {
            StreamStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Metadata accumulated before the connection ended
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.message.metadata
    }
}

/// Receives progress from a connection.
///
/// `on_part` fires for every parsed part in arrival order. A failure fires
/// `on_error` once. `on_complete` fires exactly once per connection, last,
/// whether it completed, failed or was aborted.
pub trait StreamCallbacks: Send + Sync {
    fn on_part(&self, _part: &StreamPart) {}
    fn on_error(&self, _error: &StreamError) {}
    fn on_complete(&self, _outcome: &StreamOutcome) {}
}

/// Callbacks that ignore everything
pub struct NoopCallbacks;

impl StreamCallbacks for NoopCallbacks {}

/// A cloneable handle on a running connection.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct StreamHandle {
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
    accumulator: Arc<Mutex<StreamAccumulator>>,
    outcome: Arc<Mutex<Option<StreamOutcome>>>,
    finished: Arc<Notify>,
    message_id: Arc<str>,
    conversation_id: Arc<str>,
}

impl StreamHandle {
    fn new(message_id: &str, conversation_id: &str) -> Self {
        Self {
            cancel: CancellationToken::new(),
            active: Arc::new(AtomicBool::new(true)),
            accumulator: Arc::new(Mutex::new(StreamAccumulator::new())),
            outcome: Arc::new(Mutex::new(None)),
            finished: Arc::new(Notify::new()),
            message_id: Arc::from(message_id),
            conversation_id: Arc::from(conversation_id),
        }
    }

    /// Stop reading. Idempotent, and a no-op once the connection has finished.
    pub fn abort(&self) {
        if self.is_active() && !self.cancel.is_cancelled() {
            tracing::debug!("Aborting stream {}", self.message_id);
        }
        self.cancel.cancel();
    }

    /// Whether the connection is still running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Text accumulated so far
    pub fn accumulated_content(&self) -> String {
        self.accumulator.lock().content().to_string()
    }

    /// Reasoning accumulated so far
    pub fn accumulated_reasoning(&self) -> String {
        self.accumulator.lock().reasoning().to_string()
    }

    /// Current projection of the accumulated message
    pub fn snapshot(&self) -> AccumulatedMessage {
        self.accumulator
            .lock()
            .get_state(self.message_id.as_ref(), self.conversation_id.as_ref())
    }

    /// The final outcome, once the connection has finished
    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.outcome.lock().clone()
    }

    /// Wait until the connection finishes
    pub async fn wait(&self) -> StreamOutcome {
        loop {
            let notified = self.finished.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Fold a part and report it. Returns the outcome if the part was terminal.
    fn apply(&self, part: StreamPart, callbacks: &dyn StreamCallbacks) -> Option<StreamOutcome> {
        self.accumulator.lock().process(&part);
        callbacks.on_part(&part);

        match part {
            StreamPart::Done => Some(self.finish(StreamStatus::Completed, callbacks)),
            StreamPart::Error(error) => {
                tracing::warn!("Stream {} reported error: {}", self.message_id, error);
                callbacks.on_error(&error);
                Some(self.finish(StreamStatus::Failed(error), callbacks))
            }
            _ => None,
        }
    }

    /// Record a transport-level failure, then report it
    fn fail(&self, error: Error, callbacks: &dyn StreamCallbacks) -> StreamOutcome {
        if matches!(error, Error::Aborted) {
            return self.finish(StreamStatus::Aborted, callbacks);
        }

        let error = error.to_stream_error();
        tracing::warn!(
            "Stream {} failed ({}): {}",
            self.message_id,
            error.category(),
            error.message
        );
        let part = StreamPart::Error(error.clone());
        self.accumulator.lock().process(&part);
        callbacks.on_part(&part);
        callbacks.on_error(&error);
        self.finish(StreamStatus::Failed(error), callbacks)
    }

    fn finish(&self, status: StreamStatus, callbacks: &dyn StreamCallbacks) -> StreamOutcome {
        let outcome = {
            let mut slot = self.outcome.lock();
            if let Some(existing) = slot.as_ref() {
                return existing.clone();
            }
            let outcome = StreamOutcome {
                status,
                message: self.snapshot(),
                finished_at: Utc::now(),
            };
            *slot = Some(outcome.clone());
            outcome
        };

        self.active.store(false, Ordering::Release);
        tracing::debug!("Stream {} finished: {:?}", self.message_id, outcome.status);
        callbacks.on_complete(&outcome);
        self.finished.notify_waiters();
        outcome
    }
}

/// Opens streaming requests against model endpoints
#[derive(Clone)]
pub struct StreamConnection {
    client: reqwest::Client,
    config: ConnectionConfig,
}

impl Default for StreamConnection {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl StreamConnection {
    /// Create a connection factory with default settings
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_config(client, ConnectionConfig::default())
    }

    pub fn with_config(client: reqwest::Client, config: ConnectionConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start a request. Returns immediately; the stream runs in its own task.
    pub fn connect(&self, request: StreamRequest, callbacks: Arc<dyn StreamCallbacks>) -> StreamHandle {
        let handle = StreamHandle::new(&request.message_id, &request.conversation_id);
        let task = handle.clone();
        let client = self.client.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            tracing::debug!("Opening stream {} to {}", request.message_id, request.endpoint);
            let opened = tokio::select! {
                biased;
                _ = task.cancel.cancelled() => Err(Error::Aborted),
                response = open(&client, &config, &request) => response,
            };

            match opened {
                Ok(response) => {
                    let body = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));
                    drive(body, &task, callbacks.as_ref(), config.idle_timeout).await;
                }
                Err(e) => {
                    task.fail(e, callbacks.as_ref());
                }
            }
        });

        handle
    }

    /// Drive an already-open byte stream through the same pipeline as
    /// [`connect`](Self::connect).
    pub fn attach<S, B>(
        &self,
        body: S,
        message_id: &str,
        conversation_id: &str,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> StreamHandle
    where
        S: Stream<Item = Result<B>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
    {
        let handle = StreamHandle::new(message_id, conversation_id);
        let task = handle.clone();
        let idle_timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            drive(body, &task, callbacks.as_ref(), idle_timeout).await;
        });
        handle
    }
}

async fn open(
    client: &reqwest::Client,
    config: &ConnectionConfig,
    request: &StreamRequest,
) -> Result<reqwest::Response> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("text/event-stream"),
    );
    for (key, value) in &config.headers {
        if let (Ok(name), Ok(val)) = (
            key.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            headers.insert(name, val);
        }
    }

    let response = client
        .post(&request.endpoint)
        .headers(headers)
        .json(&request.body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response)
}

async fn next_chunk<S, B>(body: &mut S, idle_timeout: Option<Duration>) -> Result<Option<B>>
where
    S: Stream<Item = Result<B>> + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, body.next()).await {
            Ok(item) => item.transpose(),
            Err(_) => Err(Error::Timeout(format!("no data received for {:?}", limit))),
        },
        None => body.next().await.transpose(),
    }
}

async fn drive<S, B>(
    body: S,
    handle: &StreamHandle,
    callbacks: &dyn StreamCallbacks,
    idle_timeout: Option<Duration>,
) -> StreamOutcome
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut parser = StreamParser::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                return handle.finish(StreamStatus::Aborted, callbacks);
            }
            next = next_chunk(&mut body, idle_timeout) => next,
        };

        match next {
            Ok(Some(chunk)) => {
                for part in parser.feed(chunk.as_ref()) {
                    if let Some(outcome) = handle.apply(part, callbacks) {
                        return outcome;
                    }
                }
            }
            Ok(None) => {
                if let Some(part) = parser.finish() {
                    if let Some(outcome) = handle.apply(part, callbacks) {
                        return outcome;
                    }
                }
                tracing::debug!("Stream {} ended without a done marker", handle.message_id);
                return handle.finish(StreamStatus::Completed, callbacks);
            }
            Err(e) => return handle.fail(e, callbacks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[derive(Default)]
    struct Recorder {
        parts: Mutex<Vec<StreamPart>>,
        errors: AtomicU32,
        completions: AtomicU32,
    }

    impl StreamCallbacks for Recorder {
        fn on_part(&self, part: &StreamPart) {
            self.parts.lock().push(part.clone());
        }
        fn on_error(&self, _error: &StreamError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_complete(&self, _outcome: &StreamOutcome) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection() -> StreamConnection {
        StreamConnection::new(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    fn chunks(items: Vec<&'static str>) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        async_stream::stream! {
            for item in items {
                yield Ok(item.as_bytes().to_vec());
            }
        }
    }

    async fn wait_for_content(handle: &StreamHandle, expected: &str) {
        for _ in 0..200 {
            if handle.accumulated_content() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("content never reached {:?}", expected);
    }

    #[tokio::test]
    async fn test_attach_folds_parts_across_chunk_boundaries() {
        let recorder = Arc::new(Recorder::default());
        let body = chunks(vec![
            "data: {\"type\":\"text\",\"con",
            "tent\":\"Hello\"}\n: keep-alive\ndata: {\"type\":\"text\",\"content\":\", world\"}\n",
            "data: {\"type\":\"metadata\",\"metadata\":{\"model\":\"m1\"}}\ndata: [DONE]\n",
        ]);

        let handle = connection().attach(body, "msg1", "conv1", recorder.clone());
        let outcome = handle.wait().await;

        assert_eq!(outcome.status, StreamStatus::Completed);
        assert_eq!(outcome.message.content, "Hello, world");
        assert!(outcome.message.is_complete);
        assert_eq!(outcome.metadata()["model"], "m1");
        assert_eq!(outcome.message.id, "msg1");
        assert_eq!(outcome.message.conversation_id, "conv1");
        assert_eq!(recorder.parts.lock().len(), 4);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 0);
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_eof_without_done_flushes_trailing_line() {
        let recorder = Arc::new(Recorder::default());
        let body = chunks(vec!["data: {\"type\":\"text\",\"content\":\"a\"}\ndata: tail"]);

        let outcome = connection().attach(body, "m", "c", recorder.clone()).wait().await;

        assert_eq!(outcome.status, StreamStatus::Completed);
        assert_eq!(outcome.message.content, "atail");
        assert!(!outcome.message.is_complete);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_and_keeps_partial_content() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>>>(8);
        let handle = connection().attach(ReceiverStream::new(rx), "m", "c", recorder.clone());

        tx.send(Ok(b"data: {\"type\":\"text\",\"content\":\"partial\"}\n".to_vec()))
            .await
            .unwrap();
        wait_for_content(&handle, "partial").await;

        handle.abort();
        handle.abort();
        let outcome = handle.wait().await;
        handle.abort();

        assert!(outcome.is_aborted());
        assert_eq!(outcome.message.content, "partial");
        assert!(outcome.message.error.is_none());
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 0);
        assert!(!handle.is_active());
        assert_eq!(handle.accumulated_content(), "partial");
    }

    #[tokio::test]
    async fn test_abort_after_completion_is_noop() {
        let recorder = Arc::new(Recorder::default());
        let handle = connection().attach(chunks(vec!["data: [DONE]\n"]), "m", "c", recorder.clone());
        let outcome = handle.wait().await;
        handle.abort();
        handle.abort();

        assert_eq!(outcome.status, StreamStatus::Completed);
        assert_eq!(handle.outcome().map(|o| o.status), Some(StreamStatus::Completed));
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_recorded_before_reporting() {
        let recorder = Arc::new(Recorder::default());
        let body = async_stream::stream! {
            yield Ok(b"data: {\"type\":\"text\",\"content\":\"half\"}\n".to_vec());
            yield Err(Error::Network("connection reset".into()));
        };

        let handle = connection().attach(body, "m", "c", recorder.clone());
        let outcome = handle.wait().await;

        let error = outcome.error().expect("should fail");
        assert_eq!(error.category(), ErrorCategory::Network);
        assert!(error.is_retryable);
        assert_eq!(outcome.message.content, "half");
        assert_eq!(outcome.message.error.as_ref(), Some(error));
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
        assert_eq!(handle.accumulated_content(), "half");
    }

    #[tokio::test]
    async fn test_error_part_ends_stream() {
        let recorder = Arc::new(Recorder::default());
        let body = chunks(vec![
            "data: {\"type\":\"reasoning\",\"content\":\"r\"}\n",
            "data: {\"type\":\"error\",\"message\":\"overloaded\",\"code\":\"503\",\"isRetryable\":true}\n",
            "data: {\"type\":\"text\",\"content\":\"never\"}\n",
        ]);

        let outcome = connection().attach(body, "m", "c", recorder.clone()).wait().await;

        let error = outcome.error().unwrap();
        assert_eq!(error.message, "overloaded");
        assert_eq!(error.category(), ErrorCategory::Http5xx);
        assert_eq!(outcome.message.reasoning, "r");
        assert_eq!(outcome.message.content, "");
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = mpsc::channel::<Result<Vec<u8>>>(1);
        let conn = StreamConnection::with_config(
            reqwest::Client::new(),
            ConnectionConfig {
                idle_timeout: Some(Duration::from_secs(5)),
                headers: HashMap::new(),
            },
        );

        let outcome = conn.attach(ReceiverStream::new(rx), "m", "c", recorder.clone()).wait().await;

        assert_eq!(outcome.error().map(|e| e.category()), Some(ErrorCategory::Timeout));
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
    }

    /// Serve exactly one HTTP response on a local port
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}/api/chat", addr)
    }

    #[tokio::test]
    async fn test_connect_streams_successful_response() {
        let endpoint = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
             data: {\"type\":\"text\",\"content\":\"Hi\"}\n\ndata: [DONE]\n\n",
        )
        .await;
        let recorder = Arc::new(Recorder::default());
        let request = StreamRequest::new(endpoint, "conv", serde_json::json!({"content": "hello"}));

        let handle = connection().connect(request, recorder.clone());
        let outcome = handle.wait().await;

        assert_eq!(outcome.status, StreamStatus::Completed);
        assert_eq!(outcome.message.content, "Hi");
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_surfaces_server_error_status() {
        let endpoint = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 10\r\nConnection: close\r\n\r\noverloaded",
        )
        .await;
        let recorder = Arc::new(Recorder::default());
        let request = StreamRequest::new(endpoint, "conv", serde_json::json!({}));

        let outcome = connection().connect(request, recorder.clone()).wait().await;

        let error = outcome.error().unwrap();
        assert_eq!(error.message, "overloaded");
        assert_eq!(error.code.as_deref(), Some("503"));
        assert!(error.is_retryable);
        assert!(matches!(recorder.parts.lock().last(), Some(StreamPart::Error(_))));
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_client_error_is_not_retryable() {
        let endpoint = serve_once(
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let request = StreamRequest::new(endpoint, "conv", serde_json::json!({}));

        let outcome = connection().connect(request, Arc::new(NoopCallbacks)).wait().await;

        let error = outcome.error().unwrap();
        assert!(!error.is_retryable);
        assert_eq!(error.category(), ErrorCategory::Http4xx);
        assert_eq!(error.message, "HTTP 400");
    }

    #[tokio::test]
    async fn test_connect_rate_limit_is_retryable() {
        let endpoint = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 4\r\nConnection: close\r\n\r\nslow",
        )
        .await;
        let request = StreamRequest::new(endpoint, "conv", serde_json::json!({}));

        let outcome = connection().connect(request, Arc::new(NoopCallbacks)).wait().await;

        let error = outcome.error().unwrap();
        assert!(error.is_retryable);
        assert_eq!(error.category(), ErrorCategory::RateLimit);
    }
}
