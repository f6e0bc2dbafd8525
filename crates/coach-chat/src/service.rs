//! Chat session service: the entry point the UI layer talks to.
//!
//! Reads go through the recency cache before the repository. Mutations run
//! directly while online and fall back to the offline queue otherwise; the
//! queue replays them through the executors registered here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::cache::RecencyCache;
use crate::error::{Error, Result};
use crate::orchestrator::{
    DispatchRequest, ModelOutcome, MultiStreamCallbacks, MultiStreamHandle, MultiStreamOrchestrator,
    NoopMultiCallbacks,
};
use crate::queue::{ActionExecutor, ActionKind, DrainReport, OfflineQueue, QueuedAction, SubmitOutcome};
use crate::repository::ConversationRepository;
use crate::types::{
    ChatMessage, Conversation, ConversationUpdate, ListOptions, LoadedConversation, MessageUpdate,
    NewConversation, Role,
};

/// Queued payload for a message send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub message: ChatMessage,
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// Queued payload for a conversation update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConversationPayload {
    pub id: String,
    pub update: ConversationUpdate,
}

/// Queued payload for a conversation delete
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConversationPayload {
    pub id: String,
}

/// A send that is streaming now
pub struct DispatchedSend {
    pub user_message: ChatMessage,
    pub streams: MultiStreamHandle,
    /// Resolves to the assistant messages persisted once every stream ends
    pub persisted: JoinHandle<Vec<ChatMessage>>,
}

/// Result of [`ChatService::send_message`]
pub enum SendOutcome {
    Dispatched(DispatchedSend),
    Queued(QueuedAction),
}

/// Collaborators shared by the service and its queue executors
struct Backend {
    repository: Arc<dyn ConversationRepository>,
    orchestrator: MultiStreamOrchestrator,
    cache: RecencyCache,
}

impl Backend {
    /// Commit finished streams as assistant messages. Aborted streams with
    /// nothing to show are skipped.
    async fn persist_outcomes(&self, outcomes: &[ModelOutcome]) -> Vec<ChatMessage> {
        let mut persisted = Vec::with_capacity(outcomes.len());
        for model in outcomes {
            let outcome = &model.outcome;
            if outcome.is_aborted() && !outcome.message.has_content() {
                continue;
            }

            let message = ChatMessage::from_outcome(&model.model_id, outcome);
            let conversation_id = message.conversation_id.clone();
            match self
                .repository
                .persist_message(&conversation_id, message.clone())
                .await
            {
                Ok(()) => {
                    self.cache.add_message(&conversation_id, message.clone());
                    persisted.push(message);
                }
                Err(e) => {
                    tracing::warn!("Failed to persist reply from {}: {}", model.model_id, e);
                }
            }
        }
        persisted
    }

    /// Dispatch to every model and persist the replies in the background
    fn dispatch(
        self: &Arc<Self>,
        request: &DispatchRequest,
        models: &[String],
        callbacks: Arc<dyn MultiStreamCallbacks>,
    ) -> Result<(MultiStreamHandle, JoinHandle<Vec<ChatMessage>>)> {
        let streams = self
            .orchestrator
            .send_multi_model_message(request, models, callbacks)?;

        let backend = self.clone();
        let waiter = streams.clone();
        let persisted = tokio::spawn(async move {
            let outcomes = waiter.wait_all().await;
            backend.persist_outcomes(&outcomes).await
        });
        Ok((streams, persisted))
    }

    fn cache_conversation(&self, conversation: Conversation) {
        if !self.cache.update_conversation(conversation.clone()) {
            self.cache.set(conversation, Vec::new());
        }
    }
}

/// Chat operations over a repository, an orchestrator, a cache and a queue.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatService {
    backend: Arc<Backend>,
    queue: OfflineQueue,
}

impl ChatService {
    /// Wire the service together and register the queue executors
    pub fn new(
        repository: Arc<dyn ConversationRepository>,
        orchestrator: MultiStreamOrchestrator,
        cache: RecencyCache,
        queue: OfflineQueue,
    ) -> Self {
        let backend = Arc::new(Backend {
            repository,
            orchestrator,
            cache,
        });

        queue.register_executor(
            ActionKind::SendMessage,
            Arc::new(SendMessageExecutor(backend.clone())),
        );
        queue.register_executor(
            ActionKind::CreateConversation,
            Arc::new(CreateConversationExecutor(backend.clone())),
        );
        queue.register_executor(
            ActionKind::UpdateConversation,
            Arc::new(UpdateConversationExecutor(backend.clone())),
        );
        queue.register_executor(
            ActionKind::DeleteConversation,
            Arc::new(DeleteConversationExecutor(backend.clone())),
        );

        Self { backend, queue }
    }

    pub fn cache(&self) -> &RecencyCache {
        &self.backend.cache
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn repository(&self) -> &Arc<dyn ConversationRepository> {
        &self.backend.repository
    }

    /// Load a conversation, from the cache when possible
    pub async fn open_conversation(&self, id: &str) -> Result<LoadedConversation> {
        if let Some(cached) = self.backend.cache.get(id) {
            tracing::debug!("Cache hit for conversation {}", id);
            return Ok(cached.into());
        }

        let loaded = self
            .backend
            .repository
            .load_conversation(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))?;
        self.backend
            .cache
            .set(loaded.conversation.clone(), loaded.messages.clone());
        Ok(loaded)
    }

    pub async fn list_conversations(&self, user_id: &str, options: ListOptions) -> Result<Vec<Conversation>> {
        self.backend.repository.load_conversations(user_id, options).await
    }

    /// Create a conversation. Offline, the returned record is local and the
    /// creation is replayed later under the same id.
    pub async fn create_conversation(&self, mut params: NewConversation) -> Result<Conversation> {
        let id = params
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let local = Conversation::from_params(&params);

        match self
            .queue
            .submit(ActionKind::CreateConversation, serde_json::to_value(&params)?)
            .await?
        {
            SubmitOutcome::Executed => Ok(self
                .backend
                .cache
                .get(&id)
                .map(|c| c.conversation)
                .unwrap_or(local)),
            SubmitOutcome::Queued(_) => {
                self.backend.cache.set(local.clone(), Vec::new());
                Ok(local)
            }
        }
    }

    pub async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> Result<SubmitOutcome> {
        if let Some(mut cached) = self.backend.cache.get(id) {
            update.apply(&mut cached.conversation);
            self.backend.cache.update_conversation(cached.conversation);
        }

        let payload = UpdateConversationPayload {
            id: id.to_string(),
            update,
        };
        self.queue
            .submit(ActionKind::UpdateConversation, serde_json::to_value(&payload)?)
            .await
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<SubmitOutcome> {
        self.backend.cache.invalidate(id);
        let payload = DeleteConversationPayload { id: id.to_string() };
        self.queue
            .submit(ActionKind::DeleteConversation, serde_json::to_value(&payload)?)
            .await
    }

    /// Send a user message to every selected model.
    ///
    /// Online, the user message is persisted, the streams start, and each
    /// reply is persisted as it completes. Offline, or behind earlier queued
    /// actions, the whole send is queued. The cache only gains the user
    /// message once it is stored or queued.
    pub async fn send_message(
        &self,
        request: DispatchRequest,
        models: &[String],
        callbacks: Arc<dyn MultiStreamCallbacks>,
    ) -> Result<SendOutcome> {
        if models.is_empty() {
            return Err(Error::Validation("no models selected".to_string()));
        }

        let message = ChatMessage::user(request.conversation_id.clone(), request.content.clone());
        let payload = SendMessagePayload {
            message: message.clone(),
            models: models.to_vec(),
            context: request.context.clone(),
        };

        if !self.queue.is_online() || !self.queue.is_empty() {
            return Ok(SendOutcome::Queued(self.queue_send(&payload)?));
        }

        if let Err(e) = self
            .backend
            .repository
            .persist_message(&request.conversation_id, message.clone())
            .await
        {
            if !e.is_retryable() {
                return Err(e);
            }
            tracing::warn!("Failed to persist user message, queueing send: {}", e);
            return Ok(SendOutcome::Queued(self.queue_send(&payload)?));
        }
        self.backend
            .cache
            .add_message(&request.conversation_id, message.clone());

        let (streams, persisted) = self.backend.dispatch(&request, models, callbacks)?;
        Ok(SendOutcome::Dispatched(DispatchedSend {
            user_message: message,
            streams,
            persisted,
        }))
    }

    fn queue_send(&self, payload: &SendMessagePayload) -> Result<QueuedAction> {
        let action = self
            .queue
            .enqueue(ActionKind::SendMessage, serde_json::to_value(payload)?);
        self.backend
            .cache
            .add_message(&payload.message.conversation_id, payload.message.clone());
        if self.queue.is_online() {
            let queue = self.queue.clone();
            tokio::spawn(async move { queue.process_queue().await });
        }
        Ok(action)
    }

    /// Regenerate replies from `index`: everything after the closest user
    /// message at or before `index` is deleted and that message is resent.
    pub async fn retry_from(
        &self,
        conversation_id: &str,
        index: usize,
        models: &[String],
        callbacks: Arc<dyn MultiStreamCallbacks>,
    ) -> Result<DispatchedSend> {
        if models.is_empty() {
            return Err(Error::Validation("no models selected".to_string()));
        }
        if !self.queue.is_online() {
            return Err(Error::Offline);
        }

        let loaded = self.open_conversation(conversation_id).await?;
        let last = index.min(loaded.messages.len().saturating_sub(1));
        let user_index = loaded
            .messages
            .get(..=last)
            .and_then(|m| m.iter().rposition(|m| m.role == Role::User))
            .ok_or_else(|| Error::Validation(format!("no user message at or before {}", index)))?;
        let user_message = loaded.messages[user_index].clone();

        self.backend
            .repository
            .delete_messages_from(conversation_id, user_index + 1)
            .await?;
        self.backend
            .cache
            .update_messages(conversation_id, loaded.messages[..=user_index].to_vec());

        let request = DispatchRequest::new(conversation_id, user_message.content.clone());
        let (streams, persisted) = self.backend.dispatch(&request, models, callbacks)?;
        Ok(DispatchedSend {
            user_message,
            streams,
            persisted,
        })
    }

    pub async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Result<ChatMessage> {
        let message = self
            .backend
            .repository
            .update_message(conversation_id, message_id, update)
            .await?;
        self.backend.cache.add_message(conversation_id, message.clone());
        Ok(message)
    }

    /// Drain queued actions now
    pub async fn flush_queue(&self) -> DrainReport {
        self.queue.process_queue().await
    }
}

struct SendMessageExecutor(Arc<Backend>);

#[async_trait]
impl ActionExecutor for SendMessageExecutor {
    async fn execute(&self, action: &QueuedAction) -> Result<()> {
        let payload: SendMessagePayload = action.payload_as()?;
        let conversation_id = payload.message.conversation_id.clone();

        // Upsert, so a replay after a partial failure never duplicates
        self.0
            .repository
            .persist_message(&conversation_id, payload.message.clone())
            .await?;

        // Replies keyed by the action, so each attempt overwrites the last
        let request = DispatchRequest {
            conversation_id,
            content: payload.message.content.clone(),
            context: payload.context,
            reply_key: Some(action.id.clone()),
        };
        let streams = self.0.orchestrator.send_multi_model_message(
            &request,
            &payload.models,
            Arc::new(NoopMultiCallbacks),
        )?;
        let outcomes = streams.wait_all().await;
        self.0.persist_outcomes(&outcomes).await;

        // Only fail when no model produced a reply
        if outcomes.iter().all(|o| o.outcome.error().is_some()) {
            if let Some(error) = outcomes.iter().find_map(|o| o.outcome.error()) {
                return Err(coach_stream::Error::Stream(error.clone()).into());
            }
        }
        Ok(())
    }
}

struct CreateConversationExecutor(Arc<Backend>);

#[async_trait]
impl ActionExecutor for CreateConversationExecutor {
    async fn execute(&self, action: &QueuedAction) -> Result<()> {
        let params: NewConversation = action.payload_as()?;
        let conversation = self.0.repository.create_conversation(params).await?;
        self.0.cache_conversation(conversation);
        Ok(())
    }
}

struct UpdateConversationExecutor(Arc<Backend>);

#[async_trait]
impl ActionExecutor for UpdateConversationExecutor {
    async fn execute(&self, action: &QueuedAction) -> Result<()> {
        let payload: UpdateConversationPayload = action.payload_as()?;
        let conversation = self
            .0
            .repository
            .update_conversation(&payload.id, payload.update)
            .await?;
        self.0.cache.update_conversation(conversation);
        Ok(())
    }
}

struct DeleteConversationExecutor(Arc<Backend>);

#[async_trait]
impl ActionExecutor for DeleteConversationExecutor {
    async fn execute(&self, action: &QueuedAction) -> Result<()> {
        let payload: DeleteConversationPayload = action.payload_as()?;
        match self.0.repository.delete_conversation(&payload.id).await {
            Ok(()) | Err(Error::NotFound(_)) => {
                self.0.cache.invalidate(&payload.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
