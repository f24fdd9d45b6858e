// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Control-plane HTTP transport.
//
// The session establisher and the attachment uploader talk to the control
// plane through `HttpSender` so tests can substitute canned responses.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// JSON request with a bearer token. Fails when the token cannot be
    /// carried in a header.
    pub fn json(
        method: Method,
        url: String,
        token: &str,
        body: &serde_json::Value,
    ) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let auth = format!("Bearer {token}")
            .parse()
            .map_err(|_| HttpError::InvalidHeader("authorization".to_string()))?;
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        Ok(Self {
            method,
            url,
            headers,
            body: Bytes::from(body.to_string()),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out: {0}")]
    Timeout(String),
    #[error("credential is not a valid {0} header value")]
    InvalidHeader(String),
}

/// Sends HTTP requests to the control plane.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// Reqwest HTTP sender
// ---------------------------------------------------------------------------

pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut req = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body);

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(e.to_string())
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(e.to_string())
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
