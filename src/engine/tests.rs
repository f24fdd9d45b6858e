// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::bus::{
    bus_channel, encode_message, BusConnector, BusError, BusFeed, BusLink, ContentSegment,
    EVENT_COMPLETE, EVENT_UPDATE,
};
use crate::config::{load_config, StringSource};
use crate::translator::{REASONING_CLOSE, REASONING_OPEN};
use axum::http::StatusCode;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeBus {
    feeds: Mutex<Vec<BusFeed>>,
}

impl FakeBus {
    fn publish(&self, frame: String) {
        for feed in self.feeds.lock().unwrap().iter() {
            feed.publish(frame.as_str());
        }
    }
}

#[async_trait]
impl BusConnector for FakeBus {
    async fn connect(&self, _identity: &Identity, buffer: usize) -> Result<BusLink, BusError> {
        let (feed, link) = bus_channel(buffer);
        self.feeds.lock().unwrap().push(feed);
        Ok(link)
    }
}

type Script = Vec<(&'static str, Vec<ContentSegment>)>;

/// Control plane that publishes a scripted run on the fake bus as soon as
/// the job is submitted.
struct FakeControlPlane {
    bus: Arc<FakeBus>,
    script: Script,
    fail_session: bool,
    sessions: Mutex<Vec<Map<String, Value>>>,
    submitted: Mutex<Vec<Value>>,
}

impl FakeControlPlane {
    fn new(bus: Arc<FakeBus>, script: Script) -> Self {
        Self {
            bus,
            script,
            fail_session: false,
            sessions: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_session(
        &self,
        _identity: &Identity,
        _schema: &ModelSchema,
        parameters: &Map<String, Value>,
    ) -> Result<String, GatewayError> {
        self.sessions.lock().unwrap().push(parameters.clone());
        if self.fail_session {
            return Err(GatewayError::upstream(Some(503), "session failed after 3 attempts"));
        }
        Ok("sess-1".into())
    }

    async fn submit_job(
        &self,
        identity: &Identity,
        session_id: &str,
        _schema: &ModelSchema,
        messages: &Value,
        _parameters: &Map<String, Value>,
    ) -> Result<String, GatewayError> {
        assert_eq!(session_id, "sess-1");
        self.submitted.lock().unwrap().push(messages.clone());
        // A frame for someone else's run on the same channel.
        self.bus.publish(encode_message(
            &identity.channel(),
            EVENT_UPDATE,
            "run-other",
            &[ContentSegment::answer("not yours")],
        ));
        for (event, segments) in &self.script {
            self.bus
                .publish(encode_message(&identity.channel(), event, "run-1", segments));
        }
        Ok("run-1".into())
    }
}

struct FakeAttachments;

#[async_trait]
impl AttachmentStore for FakeAttachments {
    async fn upload(
        &self,
        _identity: &Identity,
        _mime_type: &str,
        bytes: Bytes,
    ) -> Result<String, GatewayError> {
        Ok(format!("https://files.test/{}", bytes.len()))
    }
}

/// Upload that never answers.
struct StalledAttachments;

#[async_trait]
impl AttachmentStore for StalledAttachments {
    async fn upload(
        &self,
        _identity: &Identity,
        _mime_type: &str,
        _bytes: Bytes,
    ) -> Result<String, GatewayError> {
        std::future::pending().await
    }
}

fn config() -> Config {
    let source = StringSource {
        content: r#"busgate: v1
upstream:
  control_plane_url: "https://control.example.com"
  bus_url: "wss://bus.example.com"
"#
        .to_string(),
    };
    load_config(&source).unwrap()
}

fn identity() -> Identity {
    Identity {
        account_id: "acct".into(),
        bus_credential: "cred".into(),
        bus_client_id: "client".into(),
        control_plane_token: "token".into(),
    }
}

struct Harness {
    engine: ChatEngine,
    control_plane: Arc<FakeControlPlane>,
}

fn harness_with(config: Config, control_plane: FakeControlPlane, bus: Arc<FakeBus>) -> Harness {
    harness_with_attachments(config, control_plane, bus, Arc::new(FakeAttachments))
}

fn harness_with_attachments(
    config: Config,
    control_plane: FakeControlPlane,
    bus: Arc<FakeBus>,
    attachments: Arc<dyn AttachmentStore>,
) -> Harness {
    let config = Arc::new(config);
    let control_plane = Arc::new(control_plane);
    let pool = Arc::new(ConnectionPool::new(config.pool.clone(), bus));
    let engine = ChatEngine::new_with(EngineDeps {
        catalog: Arc::new(StaticModelCatalog::new(config.models.clone())),
        control_plane: control_plane.clone(),
        attachments,
        pool,
        config,
    });
    Harness {
        engine,
        control_plane,
    }
}

fn harness(script: Script) -> Harness {
    let bus = Arc::new(FakeBus::default());
    let control_plane = FakeControlPlane::new(bus.clone(), script);
    harness_with(config(), control_plane, bus)
}

fn image_request(stream: bool) -> ChatRequest {
    ChatRequest::from_body(
        serde_json::json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGVsbG8="}},
            ]}],
            "stream": stream,
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap()
}

fn request(model: &str, stream: bool) -> ChatRequest {
    ChatRequest::from_body(
        serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hello there"}],
            "stream": stream,
            "max_tokens": 100,
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_contents(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .filter_map(|data| serde_json::from_str::<Value>(data).ok())
        .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(String::from))
        .collect()
}

fn reasoning_script() -> Script {
    vec![
        (EVENT_UPDATE, vec![ContentSegment::reasoning("He")]),
        (EVENT_UPDATE, vec![ContentSegment::reasoning("Hello")]),
        (EVENT_UPDATE, vec![ContentSegment::answer("Hi")]),
        (EVENT_COMPLETE, vec![]),
    ]
}

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_reasoning_then_answer() {
    let h = harness(reasoning_script());
    let response = h
        .engine
        .chat_completion(identity(), request("claude-sonnet-4-thinking", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    assert_eq!(
        sse_contents(&body),
        vec![
            format!("{REASONING_OPEN}He"),
            "llo".to_string(),
            format!("{REASONING_CLOSE}Hi"),
        ]
    );
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let stats = h.engine.pool_stats();
    assert_eq!(stats.user_stats["acct"].active_connections, 0);
    assert_eq!(stats.user_stats["acct"].active_count, 1);
}

#[tokio::test]
async fn non_streaming_returns_assembled_body() {
    let h = harness(reasoning_script());
    let response = h
        .engine
        .chat_completion(identity(), request("claude-sonnet-4-thinking", false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        format!("{REASONING_OPEN}Hello{REASONING_CLOSE}Hi").as_str()
    );
    assert_eq!(body["model"], "claude-sonnet-4-thinking");
    assert_eq!(body["usage"]["prompt_tokens"], 3);
}

#[tokio::test]
async fn parameters_are_normalized_for_the_schema() {
    let h = harness(reasoning_script());
    h.engine
        .chat_completion(identity(), request("claude-sonnet-4-thinking", false))
        .await
        .unwrap();

    let sessions = h.control_plane.sessions.lock().unwrap();
    let params = &sessions[0];
    // max_tokens 100 is out of range.
    assert_eq!(params["maxOutputTokens"], 16384);
    assert_eq!(params["thinkingBudget"], 4096);
    let temperature = params["temperature"].as_f64().unwrap();
    assert!((0.80..=0.90).contains(&temperature));
    assert!(params.get("topP").is_none());
}

#[tokio::test]
async fn connection_is_reused_across_requests() {
    let h = harness(vec![
        (EVENT_UPDATE, vec![ContentSegment::answer("ok")]),
        (EVENT_COMPLETE, vec![]),
    ]);
    for _ in 0..3 {
        let response = h
            .engine
            .chat_completion(identity(), request("gpt-4.1", false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.engine.pool_stats().total_connections, 1);
}

#[tokio::test]
async fn inline_images_are_uploaded_before_submission() {
    let h = harness(vec![
        (EVENT_UPDATE, vec![ContentSegment::answer("a cat")]),
        (EVENT_COMPLETE, vec![]),
    ]);
    h.engine
        .chat_completion(identity(), image_request(false))
        .await
        .unwrap();

    let submitted = h.control_plane.submitted.lock().unwrap();
    assert_eq!(
        submitted[0][0]["content"][1]["image_url"]["url"],
        "https://files.test/5"
    );
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_model_is_rejected_before_any_upstream_call() {
    let h = harness(reasoning_script());
    let err = h
        .engine
        .chat_completion(identity(), request("no-such-model", false))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(err.code(), "model_not_found");
    assert!(h.control_plane.sessions.lock().unwrap().is_empty());
    assert_eq!(h.engine.pool_stats().total_users, 0);
}

#[tokio::test]
async fn session_failure_returns_status_and_frees_connection() {
    let bus = Arc::new(FakeBus::default());
    let mut control_plane = FakeControlPlane::new(bus.clone(), reasoning_script());
    control_plane.fail_session = true;
    let h = harness_with(config(), control_plane, bus);

    let err = h
        .engine
        .chat_completion(identity(), request("gpt-4.1", true))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamUnavailable { status: Some(503), .. }));
    assert!(h.control_plane.submitted.lock().unwrap().is_empty());
    for user in h.engine.pool_stats().user_stats.values() {
        assert_eq!(user.active_connections, 0);
    }
}

#[tokio::test]
async fn empty_run_is_bad_gateway() {
    let h = harness(vec![(EVENT_COMPLETE, vec![])]);
    let response = h
        .engine
        .chat_completion(identity(), request("gpt-4.1", false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["error"]["code"], "empty_upstream_response");
    assert_eq!(h.engine.pool_stats().user_stats["acct"].active_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_run_hits_the_request_deadline() {
    let mut config = config();
    config.request.deadline = Duration::from_secs(5);
    let bus = Arc::new(FakeBus::default());
    let control_plane = FakeControlPlane::new(bus.clone(), Vec::new());
    let h = harness_with(config, control_plane, bus);

    let response = h
        .engine
        .chat_completion(identity(), request("gpt-4.1", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(h.engine.pool_stats().user_stats["acct"].active_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_attachment_upload_hits_the_request_deadline() {
    let mut config = config();
    config.request.deadline = Duration::from_secs(5);
    let bus = Arc::new(FakeBus::default());
    let control_plane = FakeControlPlane::new(bus.clone(), reasoning_script());
    let h = harness_with_attachments(config, control_plane, bus, Arc::new(StalledAttachments));

    let started = Instant::now();
    let err = h
        .engine
        .chat_completion(identity(), image_request(true))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::RequestTimeout(_)));
    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    assert!(h.control_plane.sessions.lock().unwrap().is_empty());
    assert_eq!(h.engine.pool_stats().total_users, 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_after_first_chunk_is_reported_in_band() {
    let mut config = config();
    config.request.deadline = Duration::from_secs(5);
    let bus = Arc::new(FakeBus::default());
    let control_plane = FakeControlPlane::new(
        bus.clone(),
        vec![(EVENT_UPDATE, vec![ContentSegment::answer("partial")])],
    );
    let h = harness_with(config, control_plane, bus);

    let response = h
        .engine
        .chat_completion(identity(), request("gpt-4.1", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert_eq!(sse_contents(&body), vec!["partial".to_string()]);
    assert!(body.contains("\"code\":\"request_timeout\""));
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[test]
fn prompt_chars_counts_text_parts() {
    let messages = vec![
        serde_json::json!({"role": "system", "content": "abc"}),
        serde_json::json!({"role": "user", "content": [
            {"type": "text", "text": "de"},
            {"type": "image_url", "image_url": {"url": "https://x"}},
        ]}),
    ];
    assert_eq!(prompt_chars(&messages), 5);
}
