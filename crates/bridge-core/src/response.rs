use serde_json::{Map, Value};

use bridge_types::{empty_state, BridgeError, Result};

/// Fields checked for answer text, highest priority first.
pub const TEXT_FIELDS: [&str; 5] = ["output", "text", "response", "message", "result"];

/// Reported as the matched field when text came from event content parts.
pub const EVENT_TEXT_FIELD: &str = "content.parts";

const MAX_NESTING: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedReply {
    pub content: String,
    pub state: Value,
    /// `None` when the whole reply was serialized as a last resort.
    pub matched_field: Option<&'static str>,
}

pub fn translate_reply(reply: &Value) -> TranslatedReply {
    let state = extract_state(reply);
    if let Value::String(text) = reply {
        if !text.trim().is_empty() {
            return TranslatedReply {
                content: text.clone(),
                state,
                matched_field: None,
            };
        }
    }
    for field in TEXT_FIELDS {
        if let Some(text) = reply.get(field).and_then(|v| text_of(v, 0)) {
            return TranslatedReply {
                content: text,
                state,
                matched_field: Some(field),
            };
        }
    }
    TranslatedReply {
        content: serde_json::to_string(reply).unwrap_or_else(|_| reply.to_string()),
        state,
        matched_field: None,
    }
}

fn text_of(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_NESTING {
        return None;
    }
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => {
            for field in TEXT_FIELDS {
                if let Some(text) = map.get(field).and_then(|v| text_of(v, depth + 1)) {
                    return Some(text);
                }
            }
            let mut out = String::new();
            collect_text_fragments(value, &mut out);
            non_blank(out)
        }
        Value::Array(_) => {
            let mut out = String::new();
            collect_text_fragments(value, &mut out);
            non_blank(out)
        }
        _ => None,
    }
}

fn collect_text_fragments(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => push_fragment(out, s),
        Value::Array(items) => {
            for item in items {
                collect_text_fragments(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                push_fragment(out, text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
            if let Some(parts) = map.get("parts") {
                collect_text_fragments(parts, out);
            }
        }
        _ => {}
    }
}

fn push_fragment(out: &mut String, fragment: &str) {
    if fragment.trim().is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(fragment);
}

fn non_blank(out: String) -> Option<String> {
    (!out.trim().is_empty()).then_some(out)
}

/// Folds a buffered agent event stream into one reply. Text parts of every
/// complete event are joined in order; thought parts and partial events are
/// skipped. State starts from what the caller sent and takes each event's
/// `actions.state_delta` on top.
pub fn translate_events(events: &[Value], inbound_state: Option<&Value>) -> TranslatedReply {
    let complete = events
        .iter()
        .filter(|e| e.get("partial").and_then(Value::as_bool) != Some(true))
        .collect::<Vec<_>>();

    let mut state = match inbound_state {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let mut content = String::new();
    for event in &complete {
        if let Some(Value::Object(delta)) = event.pointer("/actions/state_delta") {
            for (key, value) in delta {
                state.insert(key.clone(), value.clone());
            }
        }
        let parts = event
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                push_fragment(&mut content, text);
            }
        }
    }
    let state = Value::Object(state);

    if !content.is_empty() {
        return TranslatedReply {
            content,
            state,
            matched_field: Some(EVENT_TEXT_FIELD),
        };
    }
    match complete.last() {
        Some(last) => TranslatedReply {
            state,
            ..translate_reply(last)
        },
        None => TranslatedReply {
            content: fallback_from_raw_body(""),
            state,
            matched_field: None,
        },
    }
}

/// State blob from the reply (top level, then inside `output`), else `{}`.
fn extract_state(reply: &Value) -> Value {
    reply
        .get("state")
        .filter(|v| !v.is_null())
        .or_else(|| {
            reply
                .get("output")
                .and_then(|o| o.get("state"))
                .filter(|v| !v.is_null())
        })
        .cloned()
        .unwrap_or_else(empty_state)
}

pub fn extract_session_id(reply: &Value) -> Result<String> {
    let candidates = [
        reply.get("output").and_then(|o| o.get("id")),
        reply.get("output").and_then(|o| o.get("session_id")),
        reply.get("id"),
        reply.get("session_id"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| BridgeError::BackendProtocol {
            detail: "session creation reply carries no session id".to_string(),
            body: reply.to_string(),
        })
}

/// Best-effort content for a 2xx reply that was not JSON.
pub fn fallback_from_raw_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "The agent returned an empty response.".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_wins_over_text() {
        let reply = translate_reply(&json!({"output": "A", "text": "B"}));
        assert_eq!(reply.content, "A");
        assert_eq!(reply.matched_field, Some("output"));
    }

    #[test]
    fn falls_through_priority_order() {
        assert_eq!(
            translate_reply(&json!({"result": "R", "message": "M"})).content,
            "M"
        );
        assert_eq!(
            translate_reply(&json!({"output": "  ", "response": "R"})).content,
            "R"
        );
        assert_eq!(translate_reply(&json!({"result": "R"})).content, "R");
    }

    #[test]
    fn unrecognised_reply_is_serialized_whole() {
        let reply = translate_reply(&json!({"foo": "bar"}));
        assert_eq!(reply.content, r#"{"foo":"bar"}"#);
        assert_eq!(reply.matched_field, None);
        assert_eq!(translate_reply(&json!({})).content, "{}");
    }

    #[test]
    fn nested_output_objects_are_searched() {
        let reply = translate_reply(&json!({
            "output": {"message": {"content": [{"type": "text", "text": "hello"}, {"text": "there"}]}}
        }));
        assert_eq!(reply.content, "hello\nthere");
        assert_eq!(reply.matched_field, Some("output"));
    }

    #[test]
    fn non_text_output_does_not_block_lower_fields() {
        let reply = translate_reply(&json!({"output": 42, "text": "answer"}));
        assert_eq!(reply.content, "answer");
    }

    #[test]
    fn state_passes_through_or_defaults_to_empty_object() {
        let reply = translate_reply(&json!({"output": "x", "state": {"step": 3}}));
        assert_eq!(reply.state, json!({"step": 3}));
        let reply = translate_reply(&json!({"output": {"text": "x", "state": {"k": 1}}}));
        assert_eq!(reply.state, json!({"k": 1}));
        assert_eq!(translate_reply(&json!({"output": "x"})).state, json!({}));
    }

    #[test]
    fn session_id_lookup_order() {
        assert_eq!(
            extract_session_id(&json!({"output": {"id": "a", "session_id": "b"}, "id": "c"}))
                .expect("id"),
            "a"
        );
        assert_eq!(
            extract_session_id(&json!({"output": {"session_id": "b"}})).expect("id"),
            "b"
        );
        assert_eq!(extract_session_id(&json!({"id": 77})).expect("id"), "77");
        let err = extract_session_id(&json!({"output": {}})).expect_err("error");
        assert!(matches!(err, BridgeError::BackendProtocol { .. }));
    }

    #[test]
    fn raw_body_fallback_is_never_empty() {
        assert_eq!(fallback_from_raw_body("  plain answer \n"), "plain answer");
        assert!(!fallback_from_raw_body("").is_empty());
    }

    fn model_text(text: &str) -> Value {
        json!({"author": "locus", "content": {"role": "model", "parts": [{"text": text}]}})
    }

    #[test]
    fn event_text_parts_are_joined_in_order() {
        let events = vec![
            json!({"content": {"role": "model", "parts": [
                {"text": "thinking about it", "thought": true},
                {"text": "Let me look that up."},
                {"function_call": {"name": "find_trails", "args": {}}}
            ]}}),
            json!({"content": {"role": "user", "parts": [
                {"function_response": {"name": "find_trails", "response": {"count": 3}}}
            ]}}),
            model_text("Here are three trails."),
        ];
        let reply = translate_events(&events, None);
        assert_eq!(reply.content, "Let me look that up.\nHere are three trails.");
        assert_eq!(reply.matched_field, Some(EVENT_TEXT_FIELD));
        assert_eq!(reply.state, json!({}));
    }

    #[test]
    fn partial_events_are_not_duplicated() {
        let mut partial = model_text("Here are");
        partial["partial"] = json!(true);
        let reply = translate_events(&[partial, model_text("Here are two.")], None);
        assert_eq!(reply.content, "Here are two.");
    }

    #[test]
    fn state_deltas_apply_over_inbound_state() {
        let mut first = model_text("ok");
        first["actions"] = json!({"state_delta": {"page": 1, "units": "mi"}});
        let mut second = model_text("done");
        second["actions"] = json!({"state_delta": {"page": 2}});
        let reply = translate_events(&[first, second], Some(&json!({"units": "km", "cart": []})));
        assert_eq!(reply.state, json!({"units": "mi", "cart": [], "page": 2}));
    }

    #[test]
    fn events_without_text_fall_back_to_field_search() {
        let reply = translate_events(&[json!({"output": "legacy shape"})], Some(&json!({"k": 1})));
        assert_eq!(reply.content, "legacy shape");
        assert_eq!(reply.matched_field, Some("output"));
        assert_eq!(reply.state, json!({"k": 1}));

        let empty = translate_events(&[], None);
        assert!(!empty.content.is_empty());
        assert_eq!(empty.matched_field, None);
    }
}
