//! Inbound OpenAI-compatible HTTP surface.
//!
//! `POST /v1/chat/completions` drives the agent loop, either returning a
//! single completion body or a `text/event-stream` of completion chunks.
//! Agent events (`tool_start`, `tool_end`, `thinking_start`) ride inside
//! the chunk `delta`. Authorization is a static bearer-token comparison.

use crate::agent::AgentEngine;
use crate::breaker::BreakerRegistry;
use crate::config::RuntimeSettings;
use crate::health::HealthState;
use crate::protocol::{AgentEvent, FunctionTool, Message, Usage};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<AgentEngine>,
    pub settings: Arc<RuntimeSettings>,
    pub health: Arc<HealthState>,
    pub breakers: Arc<BreakerRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<FunctionTool>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health_report))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| short_id());

    // Guard against recursion and bare model names; the loop picks the
    // default when nothing usable was requested.
    let model = body
        .model
        .filter(|m| m.contains(':') && m != "agent:mcp");

    info!(
        "[{request_id}] chat request: {} messages, model={:?}, stream={}",
        body.messages.len(),
        model,
        body.stream
    );

    if body.stream {
        let model_label = model.clone().unwrap_or_else(|| "agent".to_string());
        let events = state
            .engine
            .stream(body.messages, model, request_id.clone());

        let frames = events
            .map(move |event| sse_frame(&event, &request_id, &model_label))
            .chain(futures::stream::once(async {
                Ok::<Event, Infallible>(Event::default().data("[DONE]"))
            }));
        return Sse::new(frames).into_response();
    }

    match state
        .engine
        .run(body.messages, model.as_deref(), body.tools, &request_id)
        .await
    {
        Ok(completion) => Json(completion).into_response(),
        Err(err) => {
            error!("[{request_id}] agent execution failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut ids = vec![state.settings.agent_model.clone()];
    if !ids.contains(&state.settings.fallback_model) {
        ids.push(state.settings.fallback_model.clone());
    }

    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = ids
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "created": created, "owned_by": "agent-runtime"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn health_report(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "internet_available": state.health.internet_available(),
        "providers": state.health.report(),
        "breakers": state.breakers.snapshots(),
    }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.settings.server_auth_token else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented == format!("Bearer {expected}") {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid or missing bearer token"))
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    // Callers always receive a well-formed body, even on failure: the
    // error object plus an assistant-style acknowledgement.
    let body = json!({
        "error": {
            "message": message,
            "type": "internal_server_error",
            "code": status.as_u16(),
        },
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": format!("I encountered an error processing your request: {message}"),
            },
            "finish_reason": "stop",
        }],
    });
    (status, Json(body)).into_response()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

/// Map one agent event onto an SSE `data:` frame in chunk shape.
fn sse_frame(event: &AgentEvent, request_id: &str, model: &str) -> Result<Event, Infallible> {
    let frame = match event {
        AgentEvent::Token { content } => chunk_frame(request_id, model, json!({"content": content}), None, None),
        AgentEvent::Done { usage, .. } => {
            chunk_frame(request_id, model, json!({}), Some("stop"), usage.clone())
        }
        AgentEvent::Error { error, .. } => json!({
            "error": {"message": error, "type": "internal_server_error", "code": 500}
        }),
        // Auxiliary events travel inside the delta, tagged by type.
        other => {
            let delta = serde_json::to_value(other).unwrap_or_else(|_| json!({}));
            chunk_frame(request_id, model, delta, None, None)
        }
    };
    Ok(Event::default().data(frame.to_string()))
}

fn chunk_frame(
    request_id: &str,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Usage>,
) -> Value {
    let mut frame = json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        frame["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
    }
    frame
}
