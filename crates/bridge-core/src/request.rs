use serde_json::{json, Value};

use bridge_types::{empty_state, BridgeError, ChatMessage, MessageRole, Result};

/// Most recent user-authored message. Assistant, system and tool entries
/// after it are skipped. A blank latest user turn is `EmptyInput`; older
/// user turns are never replayed in its place.
pub fn latest_user_message(messages: &[ChatMessage]) -> Result<&ChatMessage> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .filter(|m| !m.content.trim().is_empty())
        .ok_or(BridgeError::EmptyInput)
}

pub fn create_session_envelope(user_id: &str) -> Value {
    json!({
        "class_method": "create_session",
        "input": { "user_id": user_id },
    })
}

/// Per-session turn. The backend keeps conversation state in the session,
/// so only the utterance travels; the caller's state stays on the bridge
/// side and is merged with the reply's state deltas.
pub fn session_query_envelope(user_id: &str, session_id: &str, message: &str) -> Value {
    json!({
        "class_method": "stream_query",
        "input": {
            "user_id": user_id,
            "session_id": session_id,
            "message": message,
        },
    })
}

/// Full-history envelope. Fails with `EmptyInput` when no user message is
/// present, same as the session path.
pub fn stateless_envelope(
    messages: &[ChatMessage],
    state: Option<&Value>,
    thread_id: &str,
) -> Result<Value> {
    latest_user_message(messages)?;
    let history = messages
        .iter()
        .filter_map(|m| {
            backend_role(m.role).map(|role| json!({ "role": role, "content": m.content }))
        })
        .collect::<Vec<_>>();
    Ok(json!({
        "input": {
            "messages": history,
            "state": state.cloned().unwrap_or_else(empty_state),
            "thread_id": thread_id,
        }
    }))
}

pub fn feedback_envelope(feedback: &Value) -> Value {
    json!({
        "class_method": "register_feedback",
        "input": { "feedback": feedback },
    })
}

/// Backend role naming. Tool output has no backend counterpart and is dropped.
pub fn backend_role(role: MessageRole) -> Option<&'static str> {
    match role {
        MessageRole::User => Some("user"),
        MessageRole::Assistant => Some("model"),
        MessageRole::System | MessageRole::Developer => Some("system"),
        MessageRole::Tool => None,
    }
}
