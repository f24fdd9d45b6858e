// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Request flow
//
// normalize -> upload attachments -> (create session || acquire bus
// connection) -> subscribe -> submit run -> translate frames -> emit. The overall deadline is armed at
// request start and bounds every stage; the translator enforces it once
// frames are flowing.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::attachments::{resolve_attachments, AttachmentStore, ControlPlaneAttachmentStore};
use crate::bus::WsBusConnector;
use crate::config::Config;
use crate::emitter::{self, ResponseMode};
use crate::error::GatewayError;
use crate::http::ReqwestHttpSender;
use crate::identity::Identity;
use crate::models::{ModelCatalog, ModelSchema, StaticModelCatalog};
use crate::params;
use crate::pool::{ConnectionLease, ConnectionPool, PoolStats};
use crate::proxy::{ChatRequest, ChatService};
use crate::retry::RetryPolicy;
use crate::session::{ControlPlane, SessionEstablisher};
use crate::translator::{translate, RequestContext, Translator};

/// Emissions buffered between the translator task and the response body.
const EMISSION_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Engine dependencies
// ---------------------------------------------------------------------------

pub struct EngineDeps {
    pub config: Arc<Config>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub pool: Arc<ConnectionPool>,
}

/// A run that has been submitted and is ready to translate.
struct OpenRun {
    lease: ConnectionLease,
    frames: broadcast::Receiver<Arc<str>>,
    correlation_id: String,
    prompt_chars: usize,
}

// ---------------------------------------------------------------------------
// ChatEngine
// ---------------------------------------------------------------------------

/// Chat service that runs the full session + bus pipeline.
pub struct ChatEngine {
    deps: EngineDeps,
}

impl ChatEngine {
    pub fn new_with(deps: EngineDeps) -> Self {
        Self { deps }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.deps.pool
    }

    /// Upload inline attachments, then create the session and lease a
    /// connection concurrently, subscribe, and submit the run. A failure on
    /// either side of the join cancels the other and returns the lease.
    async fn open_run(
        &self,
        identity: &Identity,
        schema: &ModelSchema,
        parameters: &Map<String, Value>,
        mut messages: Vec<Value>,
    ) -> Result<OpenRun, GatewayError> {
        resolve_attachments(self.deps.attachments.as_ref(), identity, &mut messages).await?;
        let prompt_chars = prompt_chars(&messages);
        let messages = Value::Array(messages);

        let (session_id, lease) = tokio::try_join!(
            self.deps
                .control_plane
                .create_session(identity, schema, parameters),
            self.deps.pool.acquire(identity),
        )?;

        // Subscribe before submitting so no frame for the run is missed.
        let Some(frames) = lease.subscribe() else {
            lease.discard();
            return Err(GatewayError::upstream(None, "bus connection closed"));
        };

        let correlation_id = self
            .deps
            .control_plane
            .submit_job(identity, &session_id, schema, &messages, parameters)
            .await?;

        Ok(OpenRun {
            lease,
            frames,
            correlation_id,
            prompt_chars,
        })
    }
}

#[async_trait]
impl ChatService for ChatEngine {
    async fn chat_completion(
        &self,
        identity: Identity,
        request: ChatRequest,
    ) -> Result<Response, GatewayError> {
        let limit = self.deps.config.request.deadline;
        let deadline = Instant::now() + limit;
        let request_id = Uuid::new_v4().to_string();

        let schema = self
            .deps
            .catalog
            .schema_for(&request.model)
            .ok_or_else(|| GatewayError::InvalidRequest {
                message: format!("The model `{}` does not exist", request.model),
                code: "model_not_found",
            })?;
        let parameters = params::normalize(&request.sampling).for_schema(&schema);

        tracing::info!(
            request_id = %request_id,
            account_id = %identity.account_id,
            model = %request.model,
            stream = request.stream,
            "chat completion started"
        );

        let opened = tokio::time::timeout_at(
            deadline,
            self.open_run(&identity, &schema, &parameters, request.messages),
        )
        .await;
        let run = match opened {
            Ok(Ok(run)) => run,
            Ok(Err(e)) => {
                tracing::warn!(request_id = %request_id, error = %e, "run setup failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(request_id = %request_id, "deadline exceeded during run setup");
                return Err(GatewayError::RequestTimeout(limit));
            }
        };

        tracing::debug!(
            request_id = %request_id,
            correlation_id = %run.correlation_id,
            connection_id = run.lease.connection_id(),
            "run submitted, translating"
        );

        let ctx = RequestContext::new(request_id, request.model, request.stream)
            .with_correlation(run.correlation_id)
            .with_prompt_chars(run.prompt_chars);
        let (tx, rx) = mpsc::channel(EMISSION_BUFFER);
        tokio::spawn(translate(
            Translator::new(ctx),
            run.frames,
            run.lease,
            tx,
            deadline,
            limit,
        ));

        Ok(emitter::respond(ResponseMode::for_request(request.stream), rx).await)
    }

    fn pool_stats(&self) -> PoolStats {
        self.deps.pool.stats()
    }

    fn models(&self) -> Vec<ModelSchema> {
        self.deps.catalog.list()
    }
}

// ---------------------------------------------------------------------------
// Public factory for default engine
// ---------------------------------------------------------------------------

pub fn build_engine(config: Arc<Config>) -> ChatEngine {
    let http = Arc::new(ReqwestHttpSender::new(reqwest::Client::new()));
    let control_plane = SessionEstablisher::new(
        http.clone(),
        config.upstream.control_plane_url.clone(),
        RetryPolicy::from(config.retry.clone()),
    );
    let connector = WsBusConnector::new(config.upstream.bus_url.clone());
    let pool = ConnectionPool::new(config.pool.clone(), Arc::new(connector));

    let deps = EngineDeps {
        catalog: Arc::new(StaticModelCatalog::new(config.models.clone())),
        control_plane: Arc::new(control_plane),
        attachments: Arc::new(
            ControlPlaneAttachmentStore::new(http, config.upstream.control_plane_url.clone())
                .with_timeout(config.retry.attempt_timeout),
        ),
        pool: Arc::new(pool),
        config,
    };

    ChatEngine::new_with(deps)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Characters of text content across all messages.
fn prompt_chars(messages: &[Value]) -> usize {
    messages
        .iter()
        .map(|m| match m.get("content") {
            Some(Value::String(text)) => text.chars().count(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(|t| t.chars().count())
                .sum(),
            _ => 0,
        })
        .sum()
}
