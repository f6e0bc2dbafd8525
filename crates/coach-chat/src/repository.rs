//! Persistence collaborator seam

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::{
    ChatMessage, Conversation, ConversationUpdate, ListOptions, LoadedConversation, MessageUpdate,
    NewConversation,
};

/// CRUD access to stored conversations and messages.
///
/// Implementations are never called while a stream is running; the chat
/// service persists once a stream has completed.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// List a user's conversations, most recently updated first
    async fn load_conversations(&self, user_id: &str, options: ListOptions) -> Result<Vec<Conversation>>;

    /// Load one conversation with its messages, or `None` if it does not exist
    async fn load_conversation(&self, id: &str) -> Result<Option<LoadedConversation>>;

    async fn create_conversation(&self, params: NewConversation) -> Result<Conversation>;

    async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> Result<Conversation>;

    async fn delete_conversation(&self, id: &str) -> Result<()>;

    /// Store a message. A message whose id already exists is replaced in place.
    async fn persist_message(&self, conversation_id: &str, message: ChatMessage) -> Result<()>;

    /// Remove the message at `index` and everything after it
    async fn delete_messages_from(&self, conversation_id: &str, index: usize) -> Result<()>;

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Result<ChatMessage>;
}

/// Repository that keeps everything in process memory
#[derive(Default)]
pub struct InMemoryRepository {
    conversations: Mutex<HashMap<String, LoadedConversation>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages in a conversation
    pub fn message_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|c| c.messages.len())
            .unwrap_or(0)
    }
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("conversation {}", id))
}

#[async_trait]
impl ConversationRepository for InMemoryRepository {
    async fn load_conversations(&self, user_id: &str, options: ListOptions) -> Result<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .lock()
            .values()
            .map(|c| &c.conversation)
            .filter(|c| c.user_id == user_id && (options.include_archived || !c.archived))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = options.limit {
            conversations.truncate(limit);
        }
        Ok(conversations)
    }

    async fn load_conversation(&self, id: &str) -> Result<Option<LoadedConversation>> {
        Ok(self.conversations.lock().get(id).cloned())
    }

    async fn create_conversation(&self, params: NewConversation) -> Result<Conversation> {
        let conversation = Conversation::from_params(&params);
        let mut conversations = self.conversations.lock();
        // Replaying a queued creation returns the existing record
        let entry = conversations
            .entry(conversation.id.clone())
            .or_insert_with(|| LoadedConversation {
                conversation,
                messages: Vec::new(),
            });
        Ok(entry.conversation.clone())
    }

    async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> Result<Conversation> {
        let mut conversations = self.conversations.lock();
        let loaded = conversations.get_mut(id).ok_or_else(|| not_found(id))?;
        update.apply(&mut loaded.conversation);
        Ok(loaded.conversation.clone())
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.conversations
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }

    async fn persist_message(&self, conversation_id: &str, message: ChatMessage) -> Result<()> {
        let mut conversations = self.conversations.lock();
        let loaded = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| not_found(conversation_id))?;

        match loaded.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => loaded.messages.push(message),
        }
        loaded.conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_messages_from(&self, conversation_id: &str, index: usize) -> Result<()> {
        let mut conversations = self.conversations.lock();
        let loaded = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| not_found(conversation_id))?;
        loaded.messages.truncate(index);
        loaded.conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Result<ChatMessage> {
        let mut conversations = self.conversations.lock();
        let loaded = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| not_found(conversation_id))?;
        let message = loaded
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        update.apply(message);
        Ok(message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo_with_conversation() -> (InMemoryRepository, Conversation) {
        let repo = InMemoryRepository::new();
        let conversation = repo
            .create_conversation(NewConversation {
                id: Some("c1".into()),
                user_id: "u1".into(),
                title: Some("System design".into()),
            })
            .await
            .unwrap();
        (repo, conversation)
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_id() {
        let (repo, first) = repo_with_conversation().await;
        let second = repo
            .create_conversation(NewConversation {
                id: Some("c1".into()),
                user_id: "u1".into(),
                title: Some("Other".into()),
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.load_conversations("u1", ListOptions::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_message_upserts() {
        let (repo, _) = repo_with_conversation().await;
        let mut message = ChatMessage::user("c1", "first");
        repo.persist_message("c1", message.clone()).await.unwrap();
        message.content = "edited".into();
        repo.persist_message("c1", message).await.unwrap();

        let loaded = repo.load_conversation("c1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "edited");
    }

    #[tokio::test]
    async fn test_delete_messages_from_truncates() {
        let (repo, _) = repo_with_conversation().await;
        for text in ["a", "b", "c"] {
            repo.persist_message("c1", ChatMessage::user("c1", text)).await.unwrap();
        }
        repo.delete_messages_from("c1", 1).await.unwrap();
        let loaded = repo.load_conversation("c1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "a");
    }

    #[tokio::test]
    async fn test_list_filters_archived_and_limits() {
        let (repo, _) = repo_with_conversation().await;
        repo.create_conversation(NewConversation {
            id: Some("c2".into()),
            user_id: "u1".into(),
            title: None,
        })
        .await
        .unwrap();
        repo.update_conversation(
            "c2",
            ConversationUpdate {
                title: None,
                archived: Some(true),
            },
        )
        .await
        .unwrap();

        let visible = repo.load_conversations("u1", ListOptions::default()).await.unwrap();
        assert_eq!(visible.len(), 1);

        let all = repo
            .load_conversations(
                "u1",
                ListOptions {
                    limit: Some(1),
                    include_archived: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "c2");
    }

    #[tokio::test]
    async fn test_missing_conversation_errors() {
        let repo = InMemoryRepository::new();
        assert!(repo.load_conversation("nope").await.unwrap().is_none());
        assert!(matches!(
            repo.delete_conversation("nope").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            repo.update_message("nope", "m", MessageUpdate::default()).await,
            Err(Error::NotFound(_))
        ));
    }
}
