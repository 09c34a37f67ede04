use std::net::SocketAddr;

use axum::extract::{Path, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use bridge_observability::{emit_event, ObservabilityEvent, ProcessKind};
use bridge_types::{BridgeError, ChatTurnRequest, ErrorEnvelope};

use crate::AppState;

type ApiError = (StatusCode, Json<ErrorEnvelope>);

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let agent = state.bridge.agent_name().to_string();
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?.to_string();
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "server.listening",
            component: "http",
            agent: Some(agent.as_str()),
            detail: Some(bound.as_str()),
            ..ObservabilityEvent::default()
        },
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    tracing::info!("agent bridge stopped");
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&state.allowed_origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/chat", post(chat_turn))
        .route("/api/copilotkit", post(chat_turn))
        .route("/api/feedback", post(feedback))
        .route("/thread/{thread_id}/session", get(thread_session))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn allowed_origins(origins: &[String]) -> AllowOrigin {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return AllowOrigin::from(Any);
    }
    let parsed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    AllowOrigin::list(parsed)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/global/health" {
        return next.run(request).await;
    }
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = extract_request_token(request.headers());
    if provided.as_deref() == Some(expected) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorEnvelope {
            error: "Unauthorized: missing or invalid API token".to_string(),
            code: Some("AUTH_REQUIRED".to_string()),
        }),
    )
        .into_response()
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-bridge-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "agent": state.bridge.agent_name(),
        "mode": state.bridge.mode().as_str(),
        "version": crate::build_version(),
        "sessions": state.bridge.session_count().await,
        "startedAtMs": state.started_at_ms,
    }))
}

async fn chat_turn(
    State(state): State<AppState>,
    Json(request): Json<ChatTurnRequest>,
) -> Result<Response, ApiError> {
    if let Some(agent) = request.agent.as_deref() {
        if !state.bridge.serves_agent(agent) {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorEnvelope {
                    error: format!("Agent `{agent}` is not served by this bridge"),
                    code: Some("AGENT_NOT_FOUND".to_string()),
                }),
            ));
        }
    }

    match state.bridge.handle_turn(request).await {
        Ok(reply) => Ok(Json(reply).into_response()),
        Err(err) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)),
    }
}

async fn feedback(
    State(state): State<AppState>,
    Json(input): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if input.is_null() || input.as_object().is_some_and(|o| o.is_empty()) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorEnvelope {
                error: "feedback body is empty".to_string(),
                code: Some("INVALID_FEEDBACK".to_string()),
            }),
        ));
    }
    state
        .bridge
        .send_feedback(&input)
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "feedback forwarding failed");
            let status = if err.is_fatal() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_GATEWAY
            };
            error_response(status, &err)
        })?;
    Ok(Json(json!({"ok": true})))
}

async fn thread_session(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Json<Value> {
    let session = state.bridge.thread_session(&thread_id).await;
    Json(json!({
        "threadId": session.thread_id,
        "phase": session.phase,
        "sessionId": session.session_id,
    }))
}

fn error_response(status: StatusCode, err: &BridgeError) -> ApiError {
    let error = match err {
        // Backend bodies can carry project details; those stay in the logs.
        BridgeError::BackendHttp {
            status: http_status,
            ..
        } => format!("backend returned HTTP {http_status}"),
        BridgeError::BackendProtocol { detail, .. } => format!("backend protocol error: {detail}"),
        other => other.to_string(),
    };
    (
        status,
        Json(ErrorEnvelope {
            error,
            code: Some(err.code().to_string()),
        }),
    )
}
