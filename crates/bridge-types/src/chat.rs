use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
    Developer,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
            MessageRole::Developer => "developer",
        }
    }
}

/// One entry of a conversation history. Position in the owning list is the
/// conversation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

// Chat runtimes send either a plain string or a list of typed parts.
fn deserialize_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|v| flatten_content(&v)).unwrap_or_default())
}

pub fn flatten_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.clone()),
                Value::Object(map) => {
                    let kind = map.get("type").and_then(|v| v.as_str()).unwrap_or("text");
                    if kind != "text" {
                        return None;
                    }
                    map.get("text").and_then(|v| v.as_str()).map(str::to_string)
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn new_thread_id() -> String {
    format!("thread_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_accepts_plain_string() {
        let msg: ChatMessage =
            serde_json::from_value(json!({"role": "user", "content": "hello"})).expect("msg");
        assert_eq!(msg, ChatMessage::user("hello"));
    }

    #[test]
    fn content_joins_text_parts_and_skips_others() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "url": "https://example.invalid/x.png"},
                {"type": "text", "text": "second"}
            ]
        }))
        .expect("msg");
        assert_eq!(msg.content, "first\nsecond");
    }

    #[test]
    fn missing_content_is_empty() {
        let msg: ChatMessage =
            serde_json::from_value(json!({"role": "assistant"})).expect("msg");
        assert_eq!(msg.content, "");
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = serde_json::from_value::<ChatMessage>(json!({"role": "robot", "content": "x"}));
        assert!(err.is_err());
    }

    #[test]
    fn thread_ids_are_unique() {
        assert_ne!(new_thread_id(), new_thread_id());
        assert!(new_thread_id().starts_with("thread_"));
    }
}
