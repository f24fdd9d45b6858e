// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Response emitter.
//
// The encoding is fixed before any byte is written. A streaming response
// commits its 200 status only once the first emission is known to be a
// success; from then on failures travel in-band as an error event followed
// by the `[DONE]` sentinel.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::translator::Emission;

pub const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Json,
    EventStream,
}

impl ResponseMode {
    pub fn for_request(stream: bool) -> Self {
        if stream {
            ResponseMode::EventStream
        } else {
            ResponseMode::Json
        }
    }
}

/// One `data: <json>\n\n` event.
pub fn sse_event(payload: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Encode one emission as SSE bytes. Terminal emissions are followed by
/// the sentinel.
pub fn encode_event(emission: &Emission) -> Vec<Bytes> {
    match emission {
        Emission::Chunk(chunk) => vec![sse_event(chunk)],
        Emission::Done(stop) => vec![sse_event(stop), Bytes::from_static(DONE_EVENT)],
        Emission::Failed(error) => vec![
            sse_event(&error.envelope()),
            Bytes::from_static(DONE_EVENT),
        ],
    }
}

/// Build the caller-facing response from the translator's output.
pub async fn respond(mode: ResponseMode, mut emissions: mpsc::Receiver<Emission>) -> Response {
    let Some(first) = emissions.recv().await else {
        return GatewayError::upstream(None, "run ended without a result").into_response();
    };
    match mode {
        ResponseMode::Json => json_response(first, emissions).await,
        ResponseMode::EventStream => event_stream(first, emissions),
    }
}

async fn json_response(first: Emission, mut rest: mpsc::Receiver<Emission>) -> Response {
    let mut next = Some(first);
    while let Some(emission) = next {
        match emission {
            Emission::Done(body) => return (StatusCode::OK, Json(body)).into_response(),
            Emission::Failed(error) => return error.into_response(),
            Emission::Chunk(_) => next = rest.recv().await,
        }
    }
    GatewayError::upstream(None, "run ended without a result").into_response()
}

fn event_stream(first: Emission, rest: mpsc::Receiver<Emission>) -> Response {
    // Nothing has been sent yet, so an immediate failure still gets a status.
    if let Emission::Failed(error) = first {
        return error.into_response();
    }
    let terminal = first.is_terminal();
    let head = stream::iter(encode_event(&first));
    let tail = ReceiverStream::new(rest)
        .take(if terminal { 0 } else { usize::MAX })
        .flat_map(|emission| stream::iter(encode_event(&emission)));
    let body = head.chain(tail).map(Ok::<Bytes, std::io::Error>);

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn channel(emissions: Vec<Emission>) -> mpsc::Receiver<Emission> {
        let (tx, rx) = mpsc::channel(emissions.len().max(1));
        for e in emissions {
            tx.try_send(e).unwrap();
        }
        rx
    }

    #[test]
    fn mode_is_chosen_from_stream_flag() {
        assert_eq!(ResponseMode::for_request(true), ResponseMode::EventStream);
        assert_eq!(ResponseMode::for_request(false), ResponseMode::Json);
    }

    #[tokio::test]
    async fn json_mode_returns_completion_body() {
        let rx = channel(vec![Emission::Done(json!({"object": "chat.completion"}))]);
        let response = respond(ResponseMode::Json, rx).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["object"], "chat.completion");
    }

    #[tokio::test]
    async fn json_mode_failure_uses_status_and_envelope() {
        let rx = channel(vec![Emission::Failed(GatewayError::EmptyUpstreamResponse)]);
        let response = respond(ResponseMode::Json, rx).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(body["error"]["message"].is_string());
        assert!(body["error"]["param"].is_null());
    }

    #[tokio::test]
    async fn stream_mode_emits_events_then_done() {
        let rx = channel(vec![
            Emission::Chunk(json!({"n": 1})),
            Emission::Chunk(json!({"n": 2})),
            Emission::Done(json!({"n": 3})),
        ]);
        let response = respond(ResponseMode::EventStream, rx).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(
            body_text(response).await,
            "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: {\"n\":3}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn stream_failure_after_first_byte_is_in_band() {
        let rx = channel(vec![
            Emission::Chunk(json!({"n": 1})),
            Emission::Failed(GatewayError::RequestTimeout(Duration::from_secs(600))),
        ]);
        let response = respond(ResponseMode::EventStream, rx).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        let events: Vec<&str> = text.split("\n\n").filter(|s| !s.is_empty()).collect();
        assert_eq!(events.len(), 3);
        let error: serde_json::Value =
            serde_json::from_str(events[1].trim_start_matches("data: ")).unwrap();
        assert_eq!(error["error"]["code"], GatewayError::RequestTimeout(Duration::ZERO).code());
        assert_eq!(events[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn stream_failure_before_first_byte_sets_status() {
        let rx = channel(vec![Emission::Failed(GatewayError::EmptyUpstreamResponse)]);
        let response = respond(ResponseMode::EventStream, rx).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn closed_channel_without_result_is_an_upstream_error() {
        let rx = channel(Vec::new());
        let response = respond(ResponseMode::Json, rx).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
