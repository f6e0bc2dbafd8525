//! Conversation and message records exchanged with the persistence layer

use chrono::{DateTime, Utc};
use coach_stream::{StreamError, StreamOutcome, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A conversation header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Build a conversation record locally from creation parameters
    pub fn from_params(params: &NewConversation) -> Self {
        let now = Utc::now();
        Self {
            id: params
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: params.user_id.clone(),
            title: params
                .title
                .clone()
                .unwrap_or_else(|| "New conversation".to_string()),
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a user message with a fresh id
    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role: Role::User,
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            model_id: None,
            metadata: Map::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Commit a finished stream as an assistant message
    pub fn from_outcome(model_id: &str, outcome: &StreamOutcome) -> Self {
        let message = &outcome.message;
        let mut metadata = message.metadata.clone();
        if outcome.is_aborted() {
            metadata.insert("aborted".to_string(), Value::Bool(true));
        }
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            role: Role::Assistant,
            content: message.content.clone(),
            reasoning: (!message.reasoning.is_empty()).then(|| message.reasoning.clone()),
            tool_calls: message.tool_calls.clone(),
            model_id: Some(model_id.to_string()),
            metadata,
            error: message.error.clone(),
            created_at: outcome.finished_at,
        }
    }
}

/// Parameters for creating a conversation.
///
/// `id` may be chosen by the caller so that a conversation created while
/// offline keeps the same identity once the queued creation is replayed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Partial update of a conversation header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl ConversationUpdate {
    pub fn apply(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(archived) = self.archived {
            conversation.archived = archived;
        }
        conversation.updated_at = Utc::now();
    }
}

/// Partial update of a stored message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl MessageUpdate {
    pub fn apply(&self, message: &mut ChatMessage) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                message.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Options for listing conversations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub include_archived: bool,
}

/// A conversation together with its messages
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConversation {
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
}
