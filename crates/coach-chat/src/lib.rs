//! coach-chat: chat session services on top of coach-stream
//!
//! - [`MultiStreamOrchestrator`] sends one message to several models at once
//! - [`OfflineQueue`] holds mutating actions until connectivity returns
//! - [`RecencyCache`] keeps recently opened conversations in memory
//! - [`ChatService`] wires them to a [`ConversationRepository`]

pub mod cache;
pub mod connectivity;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod repository;
pub mod service;
pub mod store;
pub mod types;

pub use cache::{CacheConfig, CachedConversation, RecencyCache};
pub use connectivity::{Connectivity, ConnectivityEvent};
pub use error::{Error, Result};
pub use orchestrator::{
    DispatchRequest, ModelOutcome, MultiStreamCallbacks, MultiStreamHandle, MultiStreamOrchestrator,
    NoopMultiCallbacks, StreamDispatcher,
};
pub use queue::{
    ActionExecutor, ActionKind, DrainReport, OfflineQueue, QueueConfig, QueueObserver, QueuedAction,
    RetryConfig, SubmitOutcome,
};
pub use repository::{ConversationRepository, InMemoryRepository};
pub use service::{ChatService, DispatchedSend, SendOutcome};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use types::{
    ChatMessage, Conversation, ConversationUpdate, ListOptions, LoadedConversation, MessageUpdate,
    NewConversation, Role,
};
