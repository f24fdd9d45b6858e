// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface
//
// Responsibilities:
// - Caller identity resolution (bearer key)
// - Chat completion body validation
// - Dispatch via the injected ChatService trait
// - Pool status, model list and heartbeat endpoints
// - 404 for unknown paths

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::identity::{Identity, IdentityResolver};
use crate::models::ModelSchema;
use crate::params::SamplingParams;
use crate::pool::PoolStats;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// A validated `POST /v1/chat/completions` body.
///
/// `tools` and `tool_choice` are accepted and ignored; the upstream has no
/// tool-calling surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub stream: bool,
    pub sampling: SamplingParams,
}

impl ChatRequest {
    pub fn from_body(body: &[u8]) -> Result<Self, GatewayError> {
        if body.is_empty() {
            return Err(GatewayError::invalid_request("request body is empty"));
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| GatewayError::invalid_request("request body is not valid JSON"))?;

        let model = value
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("`model` is required"))?
            .to_string();
        let messages = value
            .get("messages")
            .and_then(Value::as_array)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("`messages` must be a non-empty array"))?
            .clone();

        Ok(Self {
            model,
            messages,
            stream: value.get("stream").and_then(Value::as_bool).unwrap_or(false),
            sampling: SamplingParams::from_request(&value),
        })
    }
}

// ---------------------------------------------------------------------------
// Trait: ChatService (dependency injection point)
// ---------------------------------------------------------------------------

/// The request flow behind the HTTP surface.
///
/// Implementations must be Send + Sync so they can be shared across request
/// handlers via `Arc`.
#[async_trait::async_trait]
pub trait ChatService: Send + Sync {
    async fn chat_completion(
        &self,
        identity: Identity,
        request: ChatRequest,
    ) -> Result<Response, GatewayError>;

    fn pool_stats(&self) -> PoolStats;

    fn models(&self) -> Vec<ModelSchema>;
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<dyn ChatService>,
    pub identities: Arc<dyn IdentityResolver>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Heartbeat endpoint: GET /v1/heartbeat -> 200 OK
pub async fn heartbeat() -> StatusCode {
    StatusCode::OK
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let identity = match state.identities.resolve(&headers) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::info!(error = %e, "caller rejected");
            return e.into_response();
        }
    };

    let request = match ChatRequest::from_body(&body) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    match state.chat.chat_completion(identity, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// GET /v1/status/websocket-pool
pub async fn pool_status(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.chat.pool_stats())
}

/// GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .chat
        .models()
        .into_iter()
        .map(|m| json!({"id": m.name, "object": "model", "owned_by": "busgate"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn not_found(uri: Uri) -> GatewayError {
    GatewayError::NotFound(uri.path().to_string())
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

/// Build the axum router with all gateway routes.
///
/// The chat service and identity resolver are injected; no side effects.
pub fn build_router(chat: Arc<dyn ChatService>, identities: Arc<dyn IdentityResolver>) -> Router {
    let state = AppState { chat, identities };

    Router::new()
        .route("/v1/heartbeat", get(heartbeat))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/status/websocket-pool", get(pool_status))
        .route("/v1/models", get(list_models))
        .fallback(not_found)
        .with_state(state)
}

/// Host the gateway binds to. Always localhost, never 0.0.0.0.
pub const BIND_HOST: [u8; 4] = [127, 0, 0, 1];

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
