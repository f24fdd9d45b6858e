// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Gateway error taxonomy.
//
// Every failure, whether returned as an HTTP status before the first byte or
// sent in-band on an event stream, is rendered through `envelope()` so both
// paths share one shape: {error:{message, type, param:null, code}}.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Why credential resolution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No usable bearer credential on the request.
    Missing,
    /// A credential was presented but is not recognised.
    Rejected,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing bearer credential"),
            Self::Rejected => f.write_str("invalid credential"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { message: String, code: &'static str },

    #[error("unknown path: {0}")]
    NotFound(String),

    #[error("{0}")]
    Authentication(AuthFailure),

    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable {
        /// Last upstream HTTP status, if the failure carried one.
        status: Option<u16>,
        message: String,
    },

    #[error("timed out establishing bus connection after {}ms", .0.as_millis())]
    ConnectionTimeout(Duration),

    #[error("no bus connection became available within {}ms", .0.as_millis())]
    QueuePolicyTimeout(Duration),

    #[error("upstream finished without producing any content")]
    EmptyUpstreamResponse,

    #[error("request exceeded deadline of {}s", .0.as_secs())]
    RequestTimeout(Duration),

    #[error("failed to write response stream: {0}")]
    StreamWriteError(String),
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            code: "invalid_request",
        }
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            status,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Authentication(AuthFailure::Missing) => StatusCode::UNAUTHORIZED,
            Self::Authentication(AuthFailure::Rejected) => StatusCode::FORBIDDEN,
            Self::QueuePolicyTimeout(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable { .. } | Self::EmptyUpstreamResponse => {
                StatusCode::BAD_GATEWAY
            }
            Self::ConnectionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::StreamWriteError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error `type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } | Self::NotFound(_) => "invalid_request_error",
            Self::Authentication(AuthFailure::Missing) => "authentication_error",
            Self::Authentication(AuthFailure::Rejected) => "permission_error",
            Self::QueuePolicyTimeout(_) => "rate_limit_error",
            Self::UpstreamUnavailable { .. } | Self::EmptyUpstreamResponse => "upstream_error",
            Self::ConnectionTimeout(_) | Self::RequestTimeout(_) => "timeout_error",
            Self::StreamWriteError(_) => "server_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { code, .. } => code,
            Self::NotFound(_) => "not_found",
            Self::Authentication(AuthFailure::Missing) => "missing_api_key",
            Self::Authentication(AuthFailure::Rejected) => "invalid_api_key",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::ConnectionTimeout(_) => "connection_timeout",
            Self::QueuePolicyTimeout(_) => "queue_timeout",
            Self::EmptyUpstreamResponse => "empty_upstream_response",
            Self::RequestTimeout(_) => "request_timeout",
            Self::StreamWriteError(_) => "stream_write_error",
        }
    }

    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "param": null,
                "code": self.code(),
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), axum::Json(self.envelope())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_failure_kind() {
        let cases = [
            (GatewayError::invalid_request("bad"), 400),
            (GatewayError::NotFound("/v2/chat".into()), 404),
            (GatewayError::Authentication(AuthFailure::Missing), 401),
            (GatewayError::Authentication(AuthFailure::Rejected), 403),
            (GatewayError::QueuePolicyTimeout(Duration::from_secs(30)), 429),
            (GatewayError::upstream(Some(500), "boom"), 502),
            (GatewayError::EmptyUpstreamResponse, 502),
            (GatewayError::ConnectionTimeout(Duration::from_secs(10)), 503),
            (GatewayError::RequestTimeout(Duration::from_secs(600)), 504),
            (GatewayError::StreamWriteError("closed".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{err:?}");
        }
    }

    #[test]
    fn envelope_shape() {
        let env = GatewayError::QueuePolicyTimeout(Duration::from_millis(30_000)).envelope();
        let error = &env["error"];
        assert_eq!(error["type"], "rate_limit_error");
        assert_eq!(error["code"], "queue_timeout");
        assert!(error["param"].is_null());
        assert_eq!(
            error["message"],
            "no bus connection became available within 30000ms"
        );
    }

    #[test]
    fn upstream_message_is_propagated() {
        let err = GatewayError::upstream(Some(503), "create session: status 503: maintenance");
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn into_response_carries_status_and_json_body() {
        let resp = GatewayError::Authentication(AuthFailure::Missing).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "missing_api_key");
        assert_eq!(json["error"]["message"], "missing bearer credential");
    }
}
