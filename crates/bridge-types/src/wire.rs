use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::{ChatMessage, MessageRole};

/// Inbound chat turn as posted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatTurnRequest {
    #[serde(
        rename = "threadId",
        alias = "thread_id",
        alias = "threadID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: MessageRole,
    pub content: String,
}

impl AssistantMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Reply shape the chat runtime expects. `state` is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurnReply {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub message: AssistantMessage,
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatTurnReply {
    pub fn answer(thread_id: impl Into<String>, content: impl Into<String>, state: Value) -> Self {
        Self {
            thread_id: thread_id.into(),
            message: AssistantMessage::new(content),
            state,
            error: None,
        }
    }

    pub fn failure(
        thread_id: impl Into<String>,
        content: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            message: AssistantMessage::new(content),
            state: empty_state(),
            error: Some(code.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn empty_state() -> Value {
    Value::Object(Map::new())
}
