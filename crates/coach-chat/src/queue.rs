//! Durable, priority-ordered queue of mutating actions.
//!
//! Actions attempted while offline, or that failed with a retryable error,
//! wait here until connectivity returns. Draining is sequential on the head
//! of the queue and bounded by [`QueueConfig::max_retries`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_stream::ErrorCategory;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// The kind of a queued action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    SendMessage,
    CreateConversation,
    UpdateConversation,
    DeleteConversation,
}

impl ActionKind {
    /// Fixed priority; lower is served first
    pub fn priority(self) -> u8 {
        match self {
            ActionKind::CreateConversation => 0,
            ActionKind::SendMessage => 1,
            ActionKind::UpdateConversation => 2,
            ActionKind::DeleteConversation => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::SendMessage => "send-message",
            ActionKind::CreateConversation => "create-conversation",
            ActionKind::UpdateConversation => "update-conversation",
            ActionKind::DeleteConversation => "delete-conversation",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending action, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub priority: u8,
}

impl QueuedAction {
    pub fn new(kind: ActionKind, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            priority: kind.priority(),
        }
    }

    /// Decode the payload into a typed value
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Validation(format!("invalid {} payload: {}", self.kind, e)))
    }
}

/// Backoff between retries of a failed action
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.scaled(1.0, attempt)
    }

    /// Delay after the `retry_count`-th failure of the given category.
    /// Rate limits back off five times harder, timeouts twice as hard.
    pub fn delay_for(&self, category: ErrorCategory, retry_count: u32) -> Duration {
        let scale = match category {
            ErrorCategory::RateLimit => 5.0,
            ErrorCategory::Timeout => 2.0,
            _ => 1.0,
        };
        self.scaled(scale, retry_count.saturating_sub(1))
    }

    /// Multipliers below 1.0 (or NaN) are treated as 1.0
    fn scaled(&self, scale: f64, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        let delay_secs = self.initial_delay.as_secs_f64() * scale * multiplier.powi(attempt as i32);
        Duration::try_from_secs_f64(delay_secs)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    /// Attempts before an action is dropped
    pub max_retries: u32,
    /// Pause between successfully executed actions
    pub inter_action_delay: Duration,
    pub retry: RetryConfig,
    /// Slot name in the key-value store
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_retries: 3,
            inter_action_delay: Duration::from_millis(100),
            retry: RetryConfig::default(),
            storage_key: "offline-queue".to_string(),
        }
    }
}

/// Performs one kind of queued action
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &QueuedAction) -> Result<()>;
}

/// Receives queue lifecycle notifications
pub trait QueueObserver: Send + Sync {
    fn on_action_complete(&self, _action: &QueuedAction) {}
    /// The action was dropped after exhausting retries or failing permanently
    fn on_action_failed(&self, _action: &QueuedAction, _error: &Error) {}
    /// The action was evicted to make room
    fn on_action_dropped(&self, _action: &QueuedAction) {}
    fn on_queue_changed(&self, _len: usize) {}
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub remaining: usize,
    /// Draining stopped on a network failure or an offline event
    pub stopped_offline: bool,
}

/// Result of [`OfflineQueue::submit`]
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Executed,
    Queued(QueuedAction),
}

struct Inner {
    config: QueueConfig,
    store: Arc<dyn KeyValueStore>,
    actions: Mutex<Vec<QueuedAction>>,
    executors: RwLock<HashMap<ActionKind, Arc<dyn ActionExecutor>>>,
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
    online: AtomicBool,
    processing: tokio::sync::Mutex<()>,
}

/// Offline action queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<Inner>,
}

impl OfflineQueue {
    /// Create a queue, restoring any actions persisted in `store`.
    /// Missing or unreadable storage yields an empty queue.
    pub fn new(config: QueueConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let actions = load_actions(store.as_ref(), &config);
        if !actions.is_empty() {
            tracing::info!("Restored {} queued actions", actions.len());
        }
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                actions: Mutex::new(actions),
                executors: RwLock::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                online: AtomicBool::new(true),
                processing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn register_executor(&self, kind: ActionKind, executor: Arc<dyn ActionExecutor>) {
        self.inner.executors.write().insert(kind, executor);
    }

    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queued actions in drain order
    pub fn actions(&self) -> Vec<QueuedAction> {
        self.inner.actions.lock().clone()
    }

    /// Queue a new action
    pub fn enqueue(&self, kind: ActionKind, payload: Value) -> QueuedAction {
        let action = QueuedAction::new(kind, payload);
        self.insert(action.clone());
        action
    }

    /// Insert behind every action of equal or higher priority, evicting the
    /// lowest-priority action if the queue overflows
    fn insert(&self, action: QueuedAction) {
        tracing::debug!("Queueing {} action {}", action.kind, action.id);
        let evicted = {
            let mut actions = self.inner.actions.lock();
            let position = actions
                .iter()
                .position(|a| a.priority > action.priority)
                .unwrap_or(actions.len());
            actions.insert(position, action);
            if actions.len() > self.inner.config.max_size {
                actions.pop()
            } else {
                None
            }
        };

        if let Some(evicted) = evicted {
            tracing::warn!("Queue full, evicting {} action {}", evicted.kind, evicted.id);
            self.notify(|o| o.on_action_dropped(&evicted));
        }
        self.persist();
    }

    /// Remove an action by id
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut actions = self.inner.actions.lock();
            let before = actions.len();
            actions.retain(|a| a.id != id);
            actions.len() != before
        };
        if removed {
            self.persist();
        }
        removed
    }

    pub fn clear(&self) {
        self.inner.actions.lock().clear();
        self.persist();
    }

    /// Run an action now if possible, otherwise queue it.
    ///
    /// While offline, or while earlier actions are still queued, the action is
    /// queued so ordering is preserved. A retryable failure queues it with the
    /// failure recorded; a permanent failure is returned.
    pub async fn submit(&self, kind: ActionKind, payload: Value) -> Result<SubmitOutcome> {
        if !self.is_online() {
            return Ok(SubmitOutcome::Queued(self.enqueue(kind, payload)));
        }
        if !self.is_empty() {
            let action = self.enqueue(kind, payload);
            let queue = self.clone();
            tokio::spawn(async move { queue.process_queue().await });
            return Ok(SubmitOutcome::Queued(action));
        }

        let mut action = QueuedAction::new(kind, payload);
        match self.execute(&action).await {
            Ok(()) => Ok(SubmitOutcome::Executed),
            Err(e) if e.is_retryable() => {
                let category = e.category();
                tracing::debug!("{} failed ({}), queueing for retry", kind, category);
                if category == ErrorCategory::Network {
                    self.set_online(false);
                }
                action.retry_count = 1;
                action.last_error = Some(e.to_string());
                self.insert(action.clone());

                // Still online, so nothing else will start a drain
                if category != ErrorCategory::Network {
                    let delay = self.inner.config.retry.delay_for(category, action.retry_count);
                    let queue = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.process_queue().await
                    });
                }
                Ok(SubmitOutcome::Queued(action))
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the queue until it is empty, connectivity is lost, or a network
    /// failure stops it. Concurrent calls run one after another.
    pub async fn process_queue(&self) -> DrainReport {
        let _guard = self.inner.processing.lock().await;
        let mut report = DrainReport::default();

        loop {
            if !self.is_online() {
                report.stopped_offline = true;
                break;
            }
            let Some(action) = self.inner.actions.lock().first().cloned() else {
                break;
            };

            match self.execute(&action).await {
                Ok(()) => {
                    self.remove(&action.id);
                    report.processed += 1;
                    tracing::debug!("Completed {} action {}", action.kind, action.id);
                    self.notify(|o| o.on_action_complete(&action));
                    if !self.is_empty() {
                        tokio::time::sleep(self.inner.config.inter_action_delay).await;
                    }
                }
                Err(error) => {
                    let category = error.category();
                    let Some(failed) = self.record_failure(&action.id, &error) else {
                        continue;
                    };

                    if failed.retry_count >= self.inner.config.max_retries || !error.is_retryable() {
                        tracing::warn!(
                            "Dropping {} action {} after {} attempts: {}",
                            failed.kind,
                            failed.id,
                            failed.retry_count,
                            error
                        );
                        self.remove(&failed.id);
                        report.failed += 1;
                        self.notify(|o| o.on_action_failed(&failed, &error));
                        continue;
                    }

                    if category == ErrorCategory::Network {
                        tracing::info!("Network failure, pausing queue: {}", error);
                        // Treat as offline so the next restore event drains again
                        self.set_online(false);
                        report.stopped_offline = true;
                        break;
                    }

                    let delay = self.inner.config.retry.delay_for(category, failed.retry_count);
                    tracing::debug!(
                        "Retrying {} action {} in {:?} ({})",
                        failed.kind,
                        failed.id,
                        delay,
                        category
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        report.remaining = self.len();
        if report.processed > 0 || report.failed > 0 {
            tracing::info!(
                "Queue drain: {} processed, {} failed, {} remaining",
                report.processed,
                report.failed,
                report.remaining
            );
        }
        report
    }

    /// Record a connectivity change. Going online starts a drain in the
    /// background and returns its handle; repeated events are ignored.
    pub fn set_online(&self, online: bool) -> Option<JoinHandle<DrainReport>> {
        let was_online = self.inner.online.swap(online, Ordering::AcqRel);
        if was_online == online {
            return None;
        }

        tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        if !online {
            return None;
        }

        let queue = self.clone();
        Some(tokio::spawn(async move { queue.process_queue().await }))
    }

    /// Follow a connectivity channel until its sender is dropped
    pub fn watch_connectivity(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let initial = *online.borrow_and_update();
            queue.set_online(initial);
            while online.changed().await.is_ok() {
                let value = *online.borrow_and_update();
                queue.set_online(value);
            }
        })
    }

    async fn execute(&self, action: &QueuedAction) -> Result<()> {
        let executor = self.inner.executors.read().get(&action.kind).cloned();
        match executor {
            Some(executor) => executor.execute(action).await,
            None => Err(Error::NoExecutor(action.kind)),
        }
    }

    /// Bump the retry count of a queued action and return the updated copy
    fn record_failure(&self, id: &str, error: &Error) -> Option<QueuedAction> {
        let updated = {
            let mut actions = self.inner.actions.lock();
            let action = actions.iter_mut().find(|a| a.id == id)?;
            action.retry_count += 1;
            action.last_error = Some(error.to_string());
            action.clone()
        };
        self.persist();
        Some(updated)
    }

    fn notify(&self, f: impl Fn(&dyn QueueObserver)) {
        for observer in self.inner.observers.read().iter() {
            f(observer.as_ref());
        }
    }

    /// Write the current snapshot. The lock is held through the write so
    /// snapshots reach the store in the order they were taken.
    fn persist(&self) {
        let len = {
            let actions = self.inner.actions.lock();
            match serde_json::to_vec(&*actions) {
                Ok(bytes) => {
                    if let Err(e) = self.inner.store.set(&self.inner.config.storage_key, &bytes) {
                        tracing::warn!("Failed to persist queue: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Failed to serialize queue: {}", e),
            }
            actions.len()
        };
        self.notify(|o| o.on_queue_changed(len));
    }
}

fn load_actions(store: &dyn KeyValueStore, config: &QueueConfig) -> Vec<QueuedAction> {
    let bytes = match store.get(&config.storage_key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::warn!("Failed to read queue storage: {}", e);
            return Vec::new();
        }
    };

    let mut actions: Vec<QueuedAction> = match serde_json::from_slice(&bytes) {
        Ok(actions) => actions,
        Err(e) => {
            tracing::warn!("Discarding corrupt queue storage: {}", e);
            return Vec::new();
        }
    };

    for action in &mut actions {
        action.priority = action.kind.priority();
    }
    // Stable, so FIFO order within a tier survives
    actions.sort_by_key(|a| a.priority);
    actions.truncate(config.max_size);
    actions
}
