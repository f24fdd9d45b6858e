// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Attachments.
//
// Inline `data:` image URLs in caller messages are uploaded through an
// `AttachmentStore` and replaced by the URL it returns. The default store
// posts to the control plane and remembers uploads by content hash, per
// account, for the life of the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::http::{HttpRequest, HttpSender};
use crate::identity::Identity;

/// Uploads raw bytes and returns a URL the upstream can fetch.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn upload(
        &self,
        identity: &Identity,
        mime_type: &str,
        bytes: Bytes,
    ) -> Result<String, GatewayError>;
}

/// A decoded `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Parse a base64 data URL. Returns `Ok(None)` for anything that is not a
/// data URL, and an error for a data URL that cannot be decoded.
pub fn parse_data_url(url: &str) -> Result<Option<DataUrl>, GatewayError> {
    let Some(rest) = url.strip_prefix("data:") else {
        return Ok(None);
    };
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| GatewayError::invalid_request("malformed data URL"))?;
    let Some(mime_type) = meta.strip_suffix(";base64") else {
        return Err(GatewayError::invalid_request(
            "only base64 data URLs are supported",
        ));
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| GatewayError::invalid_request(format!("invalid base64 in data URL: {e}")))?;
    Ok(Some(DataUrl {
        mime_type: if mime_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            mime_type.to_string()
        },
        bytes: Bytes::from(bytes),
    }))
}

/// Replace inline image data in `messages` with uploaded URLs.
pub async fn resolve_attachments(
    store: &dyn AttachmentStore,
    identity: &Identity,
    messages: &mut [Value],
) -> Result<usize, GatewayError> {
    let mut uploaded = 0;
    for message in messages.iter_mut() {
        let Some(parts) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts.iter_mut() {
            if part.get("type").and_then(Value::as_str) != Some("image_url") {
                continue;
            }
            let Some(url) = part.pointer_mut("/image_url/url") else {
                continue;
            };
            let Some(data) = url.as_str().map(parse_data_url).transpose()?.flatten() else {
                continue;
            };
            let remote = store.upload(identity, &data.mime_type, data.bytes).await?;
            *url = Value::String(remote);
            uploaded += 1;
        }
    }
    Ok(uploaded)
}

// ---------------------------------------------------------------------------
// Control-plane store
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UploadReply {
    #[serde(default)]
    success: bool,
    url: Option<String>,
    message: Option<String>,
}

pub struct ControlPlaneAttachmentStore {
    http: Arc<dyn HttpSender>,
    base_url: String,
    timeout: Option<Duration>,
    /// (account id, sha256 hex) -> url
    cache: DashMap<(String, String), String>,
}

impl ControlPlaneAttachmentStore {
    pub fn new(http: Arc<dyn HttpSender>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout: None,
            cache: DashMap::new(),
        }
    }

    /// Bound each upload call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[async_trait]
impl AttachmentStore for ControlPlaneAttachmentStore {
    async fn upload(
        &self,
        identity: &Identity,
        mime_type: &str,
        bytes: Bytes,
    ) -> Result<String, GatewayError> {
        let key = (identity.account_id.clone(), content_hash(&bytes));
        if let Some(url) = self.cache.get(&key) {
            debug!(account_id = %identity.account_id, hash = %key.1, "attachment cache hit");
            return Ok(url.value().clone());
        }

        let body = json!({
            "accountId": identity.account_id,
            "mimeType": mime_type,
            "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
        });
        let mut request = HttpRequest::json(
            Method::POST,
            format!("{}/uploads", self.base_url),
            &identity.control_plane_token,
            &body,
        )
        .map_err(|e| GatewayError::upstream(None, format!("attachment upload: {e}")))?;
        request.timeout = self.timeout;
        let response = self
            .http
            .send(request)
            .await
            .map_err(|e| GatewayError::upstream(None, format!("attachment upload: {e}")))?;
        let status = response.status.as_u16();
        if !response.status.is_success() {
            warn!(account_id = %identity.account_id, status, "attachment upload rejected");
            return Err(GatewayError::upstream(
                Some(status),
                format!("attachment upload returned {status}"),
            ));
        }
        let reply: UploadReply = serde_json::from_slice(&response.body).map_err(|e| {
            GatewayError::upstream(Some(status), format!("attachment upload reply: {e}"))
        })?;
        match reply.url.filter(|u| reply.success && !u.is_empty()) {
            Some(url) => {
                self.cache.insert(key, url.clone());
                Ok(url)
            }
            None => Err(GatewayError::upstream(
                Some(status),
                reply
                    .message
                    .unwrap_or_else(|| "attachment upload failed".to_string()),
            )),
        }
    }
}
