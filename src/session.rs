// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Session establisher.
//
// Two sequential control-plane calls per request:
// - PUT  {base}/sessions                 -> sessionId
// - POST {base}/sessions/{sessionId}/runs -> runId (the correlation id)
//
// Both go through `RetryPolicy`. A 200 carrying `success: false` is retried
// exactly like a transport failure. Every attempt allocates a fresh
// identifier upstream; nothing is resumed across retries.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::GatewayError;
use crate::http::{HttpRequest, HttpSender};
use crate::identity::Identity;
use crate::models::ModelSchema;
use crate::retry::RetryPolicy;

/// Control-plane operations the request flow depends on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_session(
        &self,
        identity: &Identity,
        schema: &ModelSchema,
        parameters: &Map<String, Value>,
    ) -> Result<String, GatewayError>;

    /// Submit a generation run. Returns the correlation id bus frames carry.
    async fn submit_job(
        &self,
        identity: &Identity,
        session_id: &str,
        schema: &ModelSchema,
        messages: &Value,
        parameters: &Map<String, Value>,
    ) -> Result<String, GatewayError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlPlaneReply {
    #[serde(default)]
    success: bool,
    session_id: Option<String>,
    run_id: Option<String>,
    message: Option<String>,
}

/// HTTP implementation of `ControlPlane`.
pub struct SessionEstablisher {
    http: Arc<dyn HttpSender>,
    base_url: String,
    retry: RetryPolicy,
}

impl SessionEstablisher {
    pub fn new(http: Arc<dyn HttpSender>, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            retry,
        }
    }

    /// One attempt: send, then insist on 2xx, `success: true` and the
    /// expected identifier.
    async fn call_once(
        &self,
        request: HttpRequest,
        pick: fn(&ControlPlaneReply) -> Option<&String>,
    ) -> Result<String, GatewayError> {
        let resp = self
            .http
            .send(request)
            .await
            .map_err(|e| GatewayError::upstream(None, e.to_string()))?;

        let status = resp.status.as_u16();
        let reply: Option<ControlPlaneReply> = serde_json::from_slice(&resp.body).ok();

        if !resp.status.is_success() {
            let detail = reply
                .and_then(|r| r.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&resp.body).chars().take(200).collect());
            return Err(GatewayError::upstream(
                Some(status),
                format!("status {status}: {detail}"),
            ));
        }

        let reply = reply.ok_or_else(|| {
            GatewayError::upstream(Some(status), "response body is not a control-plane reply")
        })?;

        if !reply.success {
            return Err(GatewayError::upstream(
                Some(status),
                reply
                    .message
                    .unwrap_or_else(|| "control plane reported failure".to_string()),
            ));
        }

        match pick(&reply) {
            Some(id) if !id.is_empty() => Ok(id.clone()),
            _ => Err(GatewayError::upstream(
                Some(status),
                "control plane reply is missing its identifier",
            )),
        }
    }
}

#[async_trait]
impl ControlPlane for SessionEstablisher {
    async fn create_session(
        &self,
        identity: &Identity,
        schema: &ModelSchema,
        parameters: &Map<String, Value>,
    ) -> Result<String, GatewayError> {
        let url = format!("{}/sessions", self.base_url);
        let body = serde_json::json!({
            "accountId": identity.account_id,
            "model": schema.upstream_model,
            "parameters": parameters,
        });

        let template = HttpRequest::json(Method::PUT, url, &identity.control_plane_token, &body)
            .map_err(|e| GatewayError::upstream(None, format!("create session: {e}")))?
            .with_timeout(self.retry.attempt_timeout);

        let session_id = self
            .retry
            .run("create session", |attempt| {
                let request = template.clone();
                tracing::debug!(account_id = %identity.account_id, attempt, "creating session");
                self.call_once(request, |r| r.session_id.as_ref())
            })
            .await?;

        tracing::debug!(account_id = %identity.account_id, session_id = %session_id, "session created");
        Ok(session_id)
    }

    async fn submit_job(
        &self,
        identity: &Identity,
        session_id: &str,
        schema: &ModelSchema,
        messages: &Value,
        parameters: &Map<String, Value>,
    ) -> Result<String, GatewayError> {
        let url = format!("{}/sessions/{}/runs", self.base_url, session_id);
        let body = serde_json::json!({
            "accountId": identity.account_id,
            "model": schema.upstream_model,
            "messages": messages,
            "parameters": parameters,
        });

        let template = HttpRequest::json(Method::POST, url, &identity.control_plane_token, &body)
            .map_err(|e| GatewayError::upstream(None, format!("submit run: {e}")))?
            .with_timeout(self.retry.attempt_timeout);

        let run_id = self
            .retry
            .run("submit run", |attempt| {
                let request = template.clone();
                tracing::debug!(account_id = %identity.account_id, session_id, attempt, "submitting run");
                self.call_once(request, |r| r.run_id.as_ref())
            })
            .await?;

        tracing::debug!(account_id = %identity.account_id, correlation_id = %run_id, "run submitted");
        Ok(run_id)
    }
}
