use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::Level;

use bridge_auth::{
    CachedTokenProvider, ServiceAccountTokenProvider, StaticTokenProvider, TokenProvider,
};
use bridge_backend::{AgentInvoker, HttpAgentInvoker};
use bridge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use bridge_types::{
    empty_state, new_thread_id, truncate_for_error, BridgeError, ChatTurnReply,
    ChatTurnRequest, Result,
};

use crate::config::{AgentEndpoints, BackendMode, CredentialSource, ResolvedConfig};
use crate::request::{
    create_session_envelope, feedback_envelope, latest_user_message, session_query_envelope,
    stateless_envelope,
};
use crate::response::{
    extract_session_id, fallback_from_raw_body, translate_events, translate_reply,
    TranslatedReply,
};
use crate::session::{InMemorySessionStore, SessionManager, SessionPhase, SessionStore};

const LOGGED_BODY_LIMIT: usize = 2_000;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub agent_name: String,
    pub user_id: String,
    pub mode: BackendMode,
    pub endpoints: AgentEndpoints,
}

impl From<&ResolvedConfig> for BridgeSettings {
    fn from(resolved: &ResolvedConfig) -> Self {
        Self {
            agent_name: resolved.agent_name.clone(),
            user_id: resolved.agent_user_id.clone(),
            mode: resolved.mode,
            endpoints: resolved.endpoints.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSession {
    pub thread_id: String,
    pub phase: SessionPhase,
    pub session_id: Option<String>,
}

/// Entry point for one chat turn: credential, optional session, backend
/// query, reply translation.
pub struct AgentBridge {
    settings: BridgeSettings,
    tokens: Arc<dyn TokenProvider>,
    invoker: Arc<dyn AgentInvoker>,
    sessions: SessionManager,
    process: ProcessKind,
}

impl AgentBridge {
    pub fn new(
        settings: BridgeSettings,
        tokens: Arc<dyn TokenProvider>,
        invoker: Arc<dyn AgentInvoker>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            settings,
            tokens,
            invoker,
            sessions: SessionManager::new(store),
            process: ProcessKind::Server,
        }
    }

    /// Wires the HTTP invoker and the configured credential source with an
    /// in-memory session store.
    pub fn from_resolved(resolved: &ResolvedConfig) -> Result<Self> {
        let invoker = HttpAgentInvoker::new(resolved.request_timeout, resolved.retry)?;
        let tokens: Arc<dyn TokenProvider> = match &resolved.credential {
            CredentialSource::ServiceAccount(key) => {
                let provider =
                    ServiceAccountTokenProvider::new(key.clone(), invoker.client().clone())?;
                Arc::new(CachedTokenProvider::new(Arc::new(provider)))
            }
            CredentialSource::Static(token) => Arc::new(StaticTokenProvider::new(token.clone())?),
        };
        Ok(Self::new(
            BridgeSettings::from(resolved),
            tokens,
            Arc::new(invoker),
            Arc::new(InMemorySessionStore::new()),
        ))
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.settings.agent_name
    }

    pub fn mode(&self) -> BackendMode {
        self.settings.mode
    }

    pub fn serves_agent(&self, requested: &str) -> bool {
        requested.trim().is_empty() || requested.trim() == self.settings.agent_name
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn thread_session(&self, thread_id: &str) -> ThreadSession {
        ThreadSession {
            thread_id: thread_id.to_string(),
            phase: self.sessions.phase(thread_id).await,
            session_id: self.sessions.session_for(thread_id).await,
        }
    }

    /// Runs one turn. Only configuration errors are returned as `Err`; every
    /// other failure becomes an assistant message carrying the error code.
    pub async fn handle_turn(&self, request: ChatTurnRequest) -> Result<ChatTurnReply> {
        let thread_id = request
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_thread_id);

        match self.run_turn(&thread_id, &request).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_fatal() => {
                self.log_failure(&thread_id, &err, Level::ERROR);
                Err(err)
            }
            Err(err) => {
                let level = if err == BridgeError::EmptyInput {
                    Level::INFO
                } else {
                    Level::WARN
                };
                self.log_failure(&thread_id, &err, level);
                Ok(ChatTurnReply::failure(
                    thread_id,
                    assistant_notice(&err),
                    err.code(),
                ))
            }
        }
    }

    /// Forwards user feedback on a previous answer to the backend.
    pub async fn send_feedback(&self, feedback: &Value) -> Result<()> {
        let body = feedback_envelope(feedback);
        self.invoke_authorized(&self.settings.endpoints.query_url, &body)
            .await?;
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "feedback.sent",
                component: "bridge",
                agent: Some(self.settings.agent_name.as_str()),
                status: Some("ok"),
                ..ObservabilityEvent::default()
            },
        );
        Ok(())
    }

    async fn run_turn(&self, thread_id: &str, request: &ChatTurnRequest) -> Result<ChatTurnReply> {
        match self.settings.mode {
            BackendMode::Session => self.run_session_turn(thread_id, request).await,
            BackendMode::Stateless => self.run_stateless_turn(thread_id, request).await,
        }
    }

    async fn run_session_turn(
        &self,
        thread_id: &str,
        request: &ChatTurnRequest,
    ) -> Result<ChatTurnReply> {
        let utterance = latest_user_message(&request.messages)?.content.as_str();
        let lease = self
            .sessions
            .get_or_create(thread_id, || self.create_session(thread_id))
            .await?;

        let query = |session_id: &str| {
            session_query_envelope(&self.settings.user_id, session_id, utterance)
        };
        let url = &self.settings.endpoints.stream_query_url;

        let outcome = match self.stream_authorized(url, &query(&lease.session_id)).await {
            // A reused session may have expired on the backend side.
            Err(BridgeError::BackendHttp { status: 404, .. }) if !lease.created => {
                self.sessions.invalidate(thread_id, &lease.session_id).await;
                tracing::info!(
                    thread_id,
                    stale_session = %lease.session_id,
                    "backend no longer knows session; recreating"
                );
                let fresh = self
                    .sessions
                    .get_or_create(thread_id, || self.create_session(thread_id))
                    .await?;
                self.stream_authorized(url, &query(&fresh.session_id))
                    .await
                    .map(|events| (events, fresh.session_id))
            }
            other => other.map(|events| (events, lease.session_id.clone())),
        };

        match outcome {
            Ok((events, session_id)) => {
                let translated = translate_events(&events, request.state.as_ref());
                Ok(self.answer(thread_id, Some(session_id.as_str()), translated))
            }
            Err(err) => self.recover_protocol(thread_id, err),
        }
    }

    async fn run_stateless_turn(
        &self,
        thread_id: &str,
        request: &ChatTurnRequest,
    ) -> Result<ChatTurnReply> {
        let body = stateless_envelope(&request.messages, request.state.as_ref(), thread_id)?;
        match self
            .invoke_authorized(&self.settings.endpoints.query_url, &body)
            .await
        {
            Ok(reply) => Ok(self.answer(thread_id, None, translate_reply(&reply))),
            Err(err) => self.recover_protocol(thread_id, err),
        }
    }

    async fn create_session(&self, thread_id: &str) -> Result<String> {
        let body = create_session_envelope(&self.settings.user_id);
        let reply = self
            .invoke_authorized(&self.settings.endpoints.session_url, &body)
            .await?;
        let session_id = extract_session_id(&reply)?;
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "session.created",
                component: "session",
                thread_id: Some(thread_id),
                session_id: Some(session_id.as_str()),
                agent: Some(self.settings.agent_name.as_str()),
                status: Some("active"),
                ..ObservabilityEvent::default()
            },
        );
        Ok(session_id)
    }

    async fn invoke_authorized(&self, url: &str, body: &Value) -> Result<Value> {
        self.with_token_refresh(url, move |token: String| async move {
            self.invoker.invoke(url, &token, body).await
        })
        .await
    }

    async fn stream_authorized(&self, url: &str, body: &Value) -> Result<Vec<Value>> {
        self.with_token_refresh(url, move |token: String| async move {
            self.invoker.invoke_stream(url, &token, body).await
        })
        .await
    }

    /// Runs `call` with a current token; a 401 drops the cached token and
    /// retries once with a freshly fetched one.
    async fn with_token_refresh<T, F, Fut>(&self, url: &str, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.tokens.access_token().await?;
        match call(token).await {
            Err(BridgeError::BackendHttp { status: 401, .. }) => {
                tracing::info!(url, "backend rejected token; refreshing credential");
                self.tokens.invalidate().await;
                let token = self.tokens.access_token().await?;
                call(token).await
            }
            other => other,
        }
    }

    fn answer(
        &self,
        thread_id: &str,
        session_id: Option<&str>,
        translated: TranslatedReply,
    ) -> ChatTurnReply {
        if translated.matched_field.is_none() {
            tracing::warn!(
                thread_id,
                "backend reply had no recognised text field; returning it serialized"
            );
        }
        let redacted = redact_text(&translated.content);
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "turn.completed",
                component: "bridge",
                thread_id: Some(thread_id),
                session_id,
                agent: Some(self.settings.agent_name.as_str()),
                status: Some(translated.matched_field.unwrap_or("serialized")),
                detail: Some(redacted.as_str()),
                ..ObservabilityEvent::default()
            },
        );
        ChatTurnReply::answer(thread_id, translated.content, translated.state)
    }

    /// A 2xx reply that was not JSON still carries something renderable.
    fn recover_protocol(&self, thread_id: &str, err: BridgeError) -> Result<ChatTurnReply> {
        match err {
            BridgeError::BackendProtocol { detail, body } => {
                tracing::warn!(
                    thread_id,
                    detail = %detail,
                    body = %truncate_for_error(&body, LOGGED_BODY_LIMIT),
                    "backend reply was not JSON; using raw body"
                );
                Ok(ChatTurnReply::answer(
                    thread_id,
                    fallback_from_raw_body(&body),
                    empty_state(),
                ))
            }
            other => Err(other),
        }
    }

    fn log_failure(&self, thread_id: &str, err: &BridgeError, level: Level) {
        let detail = match err {
            BridgeError::BackendHttp { status, body } => format!(
                "HTTP {status}: {}",
                truncate_for_error(body, LOGGED_BODY_LIMIT)
            ),
            BridgeError::BackendProtocol { detail, body } => format!(
                "{detail}: {}",
                truncate_for_error(body, LOGGED_BODY_LIMIT)
            ),
            other => other.to_string(),
        };
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event: "turn.failed",
                component: "bridge",
                thread_id: Some(thread_id),
                agent: Some(self.settings.agent_name.as_str()),
                status: Some("error"),
                error_code: Some(err.code()),
                detail: Some(detail.as_str()),
                ..ObservabilityEvent::default()
            },
        );
    }
}

/// User-facing text for a recovered failure. Diagnostic detail stays in logs.
pub fn assistant_notice(err: &BridgeError) -> String {
    match err {
        BridgeError::EmptyInput => "Please type a message so I can help.".to_string(),
        BridgeError::Auth(_) => {
            "I couldn't authenticate with the agent service. Please try again shortly.".to_string()
        }
        BridgeError::BackendHttp { status: 429, .. } => {
            "The agent service is busy right now (HTTP 429). Please try again in a moment."
                .to_string()
        }
        BridgeError::BackendHttp { status, .. } => {
            format!("The agent service returned an error (HTTP {status}). Please try again.")
        }
        BridgeError::BackendTransport(_) => {
            "The agent service did not respond in time. Please try again.".to_string()
        }
        BridgeError::BackendProtocol { .. } => {
            "The agent service sent a response I couldn't read.".to_string()
        }
        BridgeError::Configuration(_) => "The bridge is not configured.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bridge_auth::AccessToken;
    use bridge_types::ChatMessage;
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct Call {
        url: String,
        token: String,
        body: Value,
    }

    /// Scripted backend: session creations get sequential ids, turns pop
    /// from a queue of canned outcomes. Unscripted stateless turns answer
    /// `{"output": "ok"}`, unscripted streamed turns one model event "ok".
    #[derive(Default)]
    struct FakeInvoker {
        calls: Mutex<Vec<Call>>,
        query_replies: Mutex<VecDeque<Result<Value>>>,
        create_failure: Mutex<Option<BridgeError>>,
    }

    impl FakeInvoker {
        fn record(&self, url: &str, token: &str, body: &Value) -> usize {
            let mut calls = self.calls.lock().expect("lock");
            calls.push(Call {
                url: url.to_string(),
                token: token.to_string(),
                body: body.clone(),
            });
            calls
                .iter()
                .filter(|c| c.body["class_method"] == "create_session")
                .count()
        }

        fn next_reply(&self) -> Option<Result<Value>> {
            self.query_replies.lock().expect("lock").pop_front()
        }

        fn queue(&self, reply: Result<Value>) {
            self.query_replies.lock().expect("lock").push_back(reply);
        }

        fn calls_with_method(&self, method: &str) -> Vec<Call> {
            self.calls
                .lock()
                .expect("lock")
                .iter()
                .filter(|c| c.body["class_method"] == method)
                .cloned()
                .collect()
        }

        fn all_calls(&self) -> Vec<Call> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for FakeInvoker {
        async fn invoke(&self, url: &str, token: &str, body: &Value) -> Result<Value> {
            let created = self.record(url, token, body);
            if body["class_method"] == "create_session" {
                if let Some(err) = self.create_failure.lock().expect("lock").clone() {
                    return Err(err);
                }
                return Ok(json!({"output": {"id": format!("session-{created}")}}));
            }
            self.next_reply()
                .unwrap_or_else(|| Ok(json!({"output": "ok"})))
        }

        async fn invoke_stream(
            &self,
            url: &str,
            token: &str,
            body: &Value,
        ) -> Result<Vec<Value>> {
            self.record(url, token, body);
            match self.next_reply() {
                Some(Ok(Value::Array(events))) => Ok(events),
                Some(Ok(event)) => Ok(vec![event]),
                Some(Err(err)) => Err(err),
                None => Ok(vec![model_event("ok")]),
            }
        }
    }

    /// Token source that numbers each fetch (`tok-1`, `tok-2`, ..) or fails
    /// every fetch with the given error.
    #[derive(Default)]
    struct CountingTokens {
        fetches: AtomicUsize,
        invalidations: AtomicUsize,
        failure: Option<BridgeError>,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch_token(&self) -> Result<AccessToken> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            Ok(AccessToken {
                token: format!("tok-{n}"),
                expires_at: None,
            })
        }

        async fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn model_event(text: &str) -> Value {
        json!({"author": "locus", "content": {"role": "model", "parts": [{"text": text}]}})
    }

    fn settings(mode: BackendMode) -> BridgeSettings {
        BridgeSettings {
            agent_name: "locus".to_string(),
            user_id: "bridge_user".to_string(),
            mode,
            endpoints: AgentEndpoints {
                base: None,
                session_url: "http://backend/session".to_string(),
                query_url: "http://backend/query".to_string(),
                stream_query_url: "http://backend/stream".to_string(),
            },
        }
    }

    fn bridge_with(mode: BackendMode, invoker: Arc<FakeInvoker>) -> AgentBridge {
        let tokens = Arc::new(StaticTokenProvider::new("tok-static").expect("token"));
        bridge_with_tokens(mode, invoker, tokens)
    }

    fn bridge_with_tokens(
        mode: BackendMode,
        invoker: Arc<FakeInvoker>,
        tokens: Arc<dyn TokenProvider>,
    ) -> AgentBridge {
        AgentBridge::new(
            settings(mode),
            tokens,
            invoker,
            Arc::new(InMemorySessionStore::new()),
        )
    }

    fn turn(thread: &str, text: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            thread_id: Some(thread.to_string()),
            messages: vec![ChatMessage::user(text)],
            state: None,
            agent: None,
        }
    }

    #[tokio::test]
    async fn same_thread_creates_one_session_and_queries_twice() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker.clone());

        bridge.handle_turn(turn("t-1", "hello")).await.expect("reply");
        bridge.handle_turn(turn("t-1", "again")).await.expect("reply");

        assert_eq!(invoker.calls_with_method("create_session").len(), 1);
        let queries = invoker.calls_with_method("stream_query");
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.url == "http://backend/stream"));
        assert!(queries
            .iter()
            .all(|q| q.body["input"]["session_id"] == "session-1"));
        assert_eq!(queries[1].body["input"]["message"], "again");
        assert!(invoker.all_calls().iter().all(|c| c.token == "tok-static"));
        assert_eq!(invoker.all_calls()[0].url, "http://backend/session");
    }

    #[tokio::test]
    async fn distinct_threads_create_distinct_sessions() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker.clone());

        bridge.handle_turn(turn("t-1", "hi")).await.expect("reply");
        bridge.handle_turn(turn("t-2", "hi")).await.expect("reply");

        assert_eq!(invoker.calls_with_method("create_session").len(), 2);
        assert_eq!(bridge.session_count().await, 2);
        let t2 = bridge.thread_session("t-2").await;
        assert_eq!(t2.phase, SessionPhase::SessionActive);
        assert_eq!(t2.session_id.as_deref(), Some("session-2"));
    }

    #[tokio::test]
    async fn session_reply_joins_event_text_and_applies_state_delta() {
        let invoker = Arc::new(FakeInvoker::default());
        let mut last = model_event("Try the Mesa Trail.");
        last["actions"] = json!({"state_delta": {"step": 2}});
        invoker.queue(Ok(json!([model_event("Checking trails."), last])));
        let bridge = bridge_with(BackendMode::Session, invoker);
        let mut request = turn("t-1", "q");
        request.state = Some(json!({"units": "km"}));

        let reply = bridge.handle_turn(request).await.expect("reply");
        assert_eq!(reply.message.content, "Checking trails.\nTry the Mesa Trail.");
        assert_eq!(reply.state, json!({"units": "km", "step": 2}));
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn output_field_wins_and_state_passes_through() {
        let invoker = Arc::new(FakeInvoker::default());
        invoker.queue(Ok(json!({"output": "A", "text": "B", "state": {"step": 2}})));
        let bridge = bridge_with(BackendMode::Stateless, invoker);

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");
        assert_eq!(reply.message.content, "A");
        assert_eq!(reply.state, json!({"step": 2}));
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn unrecognised_reply_is_serialized() {
        let invoker = Arc::new(FakeInvoker::default());
        invoker.queue(Ok(json!({"foo": "bar"})));
        let bridge = bridge_with(BackendMode::Session, invoker);

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");
        assert_eq!(reply.message.content, r#"{"foo":"bar"}"#);
        assert_eq!(reply.state, json!({}));
    }

    #[tokio::test]
    async fn throttled_backend_becomes_assistant_message() {
        let invoker = Arc::new(FakeInvoker::default());
        invoker.queue(Err(BridgeError::BackendHttp {
            status: 429,
            body: "quota exceeded for project 1234".to_string(),
        }));
        let bridge = bridge_with(BackendMode::Session, invoker);

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");
        assert!(reply.message.content.contains("429"));
        assert!(!reply.message.content.contains("quota exceeded"));
        assert_eq!(reply.error.as_deref(), Some("BACKEND_HTTP_ERROR"));
        assert_eq!(reply.thread_id, "t-1");
    }

    #[tokio::test]
    async fn empty_input_is_a_prompt_and_never_reaches_backend() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker.clone());
        let request = ChatTurnRequest {
            thread_id: Some("t-1".to_string()),
            messages: vec![ChatMessage::assistant("How can I help?")],
            state: None,
            agent: None,
        };

        let reply = bridge.handle_turn(request).await.expect("reply");
        assert_eq!(reply.error.as_deref(), Some("EMPTY_INPUT"));
        assert!(invoker.all_calls().is_empty());
        assert_eq!(
            bridge.thread_session("t-1").await.phase,
            SessionPhase::NoSession
        );
    }

    #[tokio::test]
    async fn failed_session_creation_leaves_thread_without_session() {
        let invoker = Arc::new(FakeInvoker::default());
        *invoker.create_failure.lock().expect("lock") = Some(BridgeError::BackendHttp {
            status: 500,
            body: "boom".to_string(),
        });
        let bridge = bridge_with(BackendMode::Session, invoker.clone());

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");
        assert_eq!(reply.error.as_deref(), Some("BACKEND_HTTP_ERROR"));
        assert!(invoker.calls_with_method("stream_query").is_empty());
        assert_eq!(
            bridge.thread_session("t-1").await.phase,
            SessionPhase::NoSession
        );
    }

    #[tokio::test]
    async fn expired_session_is_recreated_once() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker.clone());
        bridge.handle_turn(turn("t-1", "first")).await.expect("reply");

        invoker.queue(Err(BridgeError::BackendHttp {
            status: 404,
            body: "session not found".to_string(),
        }));
        invoker.queue(Ok(model_event("fresh answer")));
        let reply = bridge.handle_turn(turn("t-1", "second")).await.expect("reply");

        assert_eq!(reply.message.content, "fresh answer");
        assert_eq!(invoker.calls_with_method("create_session").len(), 2);
        assert_eq!(
            bridge.thread_session("t-1").await.session_id.as_deref(),
            Some("session-2")
        );
    }

    #[tokio::test]
    async fn not_found_on_fresh_session_is_surfaced_without_recreating() {
        let invoker = Arc::new(FakeInvoker::default());
        invoker.queue(Err(BridgeError::BackendHttp {
            status: 404,
            body: "session not found".to_string(),
        }));
        let bridge = bridge_with(BackendMode::Session, invoker.clone());

        let reply = bridge.handle_turn(turn("t-1", "first")).await.expect("reply");

        assert_eq!(reply.error.as_deref(), Some("BACKEND_HTTP_ERROR"));
        assert!(reply.message.content.contains("404"));
        assert_eq!(invoker.calls_with_method("create_session").len(), 1);
        assert_eq!(invoker.calls_with_method("stream_query").len(), 1);
        let session = bridge.thread_session("t-1").await;
        assert_eq!(session.phase, SessionPhase::SessionActive);
        assert_eq!(session.session_id.as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_call_retried_once() {
        let invoker = Arc::new(FakeInvoker::default());
        invoker.queue(Err(BridgeError::BackendHttp {
            status: 401,
            body: "token expired".to_string(),
        }));
        let tokens = Arc::new(CountingTokens::default());
        let bridge = bridge_with_tokens(BackendMode::Stateless, invoker.clone(), tokens.clone());

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");

        assert_eq!(reply.message.content, "ok");
        assert_eq!(reply.error, None);
        assert_eq!(tokens.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
        let calls = invoker.all_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].token, "tok-1");
        assert_eq!(calls[1].token, "tok-2");
    }

    #[tokio::test]
    async fn second_rejection_after_refresh_is_not_retried_again() {
        let invoker = Arc::new(FakeInvoker::default());
        for _ in 0..2 {
            invoker.queue(Err(BridgeError::BackendHttp {
                status: 401,
                body: "denied".to_string(),
            }));
        }
        let tokens = Arc::new(CountingTokens::default());
        let bridge = bridge_with_tokens(BackendMode::Stateless, invoker.clone(), tokens.clone());

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");

        assert_eq!(reply.error.as_deref(), Some("BACKEND_HTTP_ERROR"));
        assert_eq!(invoker.all_calls().len(), 2);
        assert_eq!(tokens.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn identity_provider_rejection_becomes_assistant_message() {
        let invoker = Arc::new(FakeInvoker::default());
        let tokens = Arc::new(CountingTokens {
            failure: Some(BridgeError::Auth("invalid_grant: account disabled".to_string())),
            ..CountingTokens::default()
        });
        let bridge = bridge_with_tokens(BackendMode::Session, invoker.clone(), tokens);

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");

        assert_eq!(reply.error.as_deref(), Some("AUTH_ERROR"));
        assert_eq!(reply.message.role, bridge_types::MessageRole::Assistant);
        assert!(reply.message.content.contains("authenticate"));
        assert!(!reply.message.content.contains("invalid_grant"));
        assert!(invoker.all_calls().is_empty());
        assert_eq!(
            bridge.thread_session("t-1").await.phase,
            SessionPhase::NoSession
        );
    }

    #[tokio::test]
    async fn blank_latest_user_turn_never_replays_older_question() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker.clone());
        let request = ChatTurnRequest {
            thread_id: Some("t-1".to_string()),
            messages: vec![
                ChatMessage::user("Find me a trail"),
                ChatMessage::assistant("Where are you?"),
                ChatMessage::user("   "),
            ],
            state: None,
            agent: None,
        };

        let reply = bridge.handle_turn(request).await.expect("reply");

        assert_eq!(reply.error.as_deref(), Some("EMPTY_INPUT"));
        assert!(invoker.all_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_thread_id_is_generated() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker);
        let mut request = turn("", "hi");
        request.thread_id = None;

        let reply = bridge.handle_turn(request).await.expect("reply");
        assert!(reply.thread_id.starts_with("thread_"));
    }

    #[tokio::test]
    async fn stateless_mode_forwards_history_without_sessions() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Stateless, invoker.clone());
        let request = ChatTurnRequest {
            thread_id: Some("t-1".to_string()),
            messages: vec![
                ChatMessage::user("q1"),
                ChatMessage::assistant("a1"),
                ChatMessage::user("q2"),
            ],
            state: Some(json!({"cart": []})),
            agent: None,
        };

        let reply = bridge.handle_turn(request).await.expect("reply");
        assert_eq!(reply.message.content, "ok");
        let calls = invoker.all_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://backend/query");
        assert_eq!(calls[0].body["input"]["messages"][1]["role"], "model");
        assert_eq!(calls[0].body["input"]["state"], json!({"cart": []}));
        assert_eq!(bridge.session_count().await, 0);
    }

    #[tokio::test]
    async fn non_json_reply_falls_back_to_raw_text() {
        let invoker = Arc::new(FakeInvoker::default());
        invoker.queue(Err(BridgeError::BackendProtocol {
            detail: "not json".to_string(),
            body: "plain words".to_string(),
        }));
        let bridge = bridge_with(BackendMode::Stateless, invoker);

        let reply = bridge.handle_turn(turn("t-1", "q")).await.expect("reply");
        assert_eq!(reply.message.content, "plain words");
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn feedback_uses_register_feedback_envelope() {
        let invoker = Arc::new(FakeInvoker::default());
        let bridge = bridge_with(BackendMode::Session, invoker.clone());
        bridge
            .send_feedback(&json!({"score": 1, "text": "great"}))
            .await
            .expect("feedback");
        let calls = invoker.calls_with_method("register_feedback");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body["input"]["feedback"]["score"], 1);
    }

    #[test]
    fn agent_name_matching() {
        let bridge = bridge_with(BackendMode::Session, Arc::new(FakeInvoker::default()));
        assert!(bridge.serves_agent("locus"));
        assert!(bridge.serves_agent(""));
        assert!(!bridge.serves_agent("other"));
    }
}
