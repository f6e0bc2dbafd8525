//! Bounded, time-expiring recency cache of loaded conversations

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::{ChatMessage, Conversation, LoadedConversation};

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Entries expire this long after they were cached, regardless of access
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 20,
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// A cached conversation with its messages
#[derive(Debug, Clone)]
pub struct CachedConversation {
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
    pub cached_at: Instant,
    pub accessed_at: Instant,
}

impl From<CachedConversation> for LoadedConversation {
    fn from(entry: CachedConversation) -> Self {
        LoadedConversation {
            conversation: entry.conversation,
            messages: entry.messages,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CachedConversation>,
    /// Least recently used at the front
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, id: &str) {
        self.order.retain(|k| k != id);
        self.order.push_back(id.to_string());
    }

    fn remove(&mut self, id: &str) -> Option<CachedConversation> {
        self.order.retain(|k| k != id);
        self.entries.remove(id)
    }
}

/// LRU cache keyed by conversation id.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct RecencyCache {
    inner: Arc<Mutex<Inner>>,
    config: CacheConfig,
}

impl Default for RecencyCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl RecencyCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_expired(&self, entry: &CachedConversation, now: Instant) -> bool {
        now.duration_since(entry.cached_at) > self.config.ttl
    }

    /// Look up a conversation. Expired entries are removed and reported as a miss.
    pub fn get(&self, id: &str) -> Option<CachedConversation> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired = self.is_expired(inner.entries.get(id)?, now);
        if expired {
            tracing::debug!("Cache entry {} expired", id);
            inner.remove(id);
            return None;
        }

        inner.touch(id);
        let entry = inner.entries.get_mut(id)?;
        entry.accessed_at = now;
        Some(entry.clone())
    }

    /// Whether a live entry exists, without refreshing its recency
    pub fn contains(&self, id: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(id)
            .is_some_and(|e| !self.is_expired(e, now))
    }

    /// Insert or overwrite an entry, evicting the least recently used one when full
    pub fn set(&self, conversation: Conversation, messages: Vec<ChatMessage>) {
        if self.config.max_entries == 0 {
            return;
        }
        let now = Instant::now();
        let id = conversation.id.clone();
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&id) && inner.entries.len() >= self.config.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                tracing::debug!("Evicting cache entry {}", oldest);
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            id.clone(),
            CachedConversation {
                conversation,
                messages,
                cached_at: now,
                accessed_at: now,
            },
        );
        inner.touch(&id);
    }

    /// Apply `f` to a cached entry in place. No-op for uncached ids.
    fn modify(&self, id: &str, f: impl FnOnce(&mut CachedConversation)) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        f(entry);
        entry.accessed_at = now;
        inner.touch(id);
        true
    }

    /// Replace the cached conversation header
    pub fn update_conversation(&self, conversation: Conversation) -> bool {
        let id = conversation.id.clone();
        self.modify(&id, |entry| entry.conversation = conversation)
    }

    /// Replace the cached message list
    pub fn update_messages(&self, id: &str, messages: Vec<ChatMessage>) -> bool {
        self.modify(id, |entry| entry.messages = messages)
    }

    /// Append a message, or replace the cached message with the same id
    pub fn add_message(&self, id: &str, message: ChatMessage) -> bool {
        self.modify(id, |entry| {
            match entry.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message,
                None => entry.messages.push(message),
            }
        })
    }

    pub fn invalidate(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Drop every expired entry, returning how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        expired.len()
    }

    /// Number of stored entries, including ones that have expired but not been pruned
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
