// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Delta stream translator.
//
// Turns the cumulative reasoning/answer frames for one run into OpenAI chat
// completion payloads. `Translator` is a synchronous state machine over one
// `RequestContext`; `translate` drives it from a pooled connection's frame
// subscription until the run reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{parse_envelope, ContentSegment, DeltaEvent, DeltaFrame, SegmentKind};
use crate::error::GatewayError;
use crate::pool::ConnectionLease;

pub const REASONING_OPEN: &str = "<think>\n";
pub const REASONING_CLOSE: &str = "\n</think>\n\n";

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorState {
    AwaitingFirstFrame,
    Streaming,
    Completed,
    Failed,
}

impl TranslatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TranslatorState::Completed | TranslatorState::Failed)
    }
}

/// Per-request translation state. Owned by exactly one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub correlation_id: String,
    pub model: String,
    pub stream: bool,
    pub message_id: String,
    pub created: i64,
    /// Prompt size in characters, for the usage estimate.
    pub prompt_chars: usize,
    reasoning: String,
    answer: String,
    reasoning_opened: bool,
    reasoning_closed: bool,
    completed: bool,
    role_sent: bool,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>, stream: bool) -> Self {
        Self {
            request_id: request_id.into(),
            correlation_id: String::new(),
            model: model.into(),
            stream,
            message_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            prompt_chars: 0,
            reasoning: String::new(),
            answer: String::new(),
            reasoning_opened: false,
            reasoning_closed: false,
            completed: false,
            role_sent: false,
        }
    }

    /// Bind the context to the run id returned by job submission.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_prompt_chars(mut self, chars: usize) -> Self {
        self.prompt_chars = chars;
        self
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }
}

// ---------------------------------------------------------------------------
// Emissions
// ---------------------------------------------------------------------------

/// Output of the translator, consumed by the response emitter.
#[derive(Debug, Clone)]
pub enum Emission {
    /// An incremental `chat.completion.chunk` (streaming only).
    Chunk(Value),
    /// Terminal success. The stop chunk when streaming, otherwise the full
    /// `chat.completion` body.
    Done(Value),
    /// Terminal failure.
    Failed(GatewayError),
}

impl Emission {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Emission::Chunk(_))
    }
}

/// The part of `current` not already covered by `previous`.
///
/// Normally `current` extends `previous`. When upstream rewrites earlier
/// text, the suffix after the longest common prefix is returned.
pub fn cumulative_delta<'a>(previous: &str, current: &'a str) -> &'a str {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest;
    }
    let mut split = 0;
    for ((i, a), b) in previous.char_indices().zip(current.chars()) {
        if a != b {
            break;
        }
        split = i + a.len_utf8();
    }
    &current[split..]
}

/// Token estimate used for the `usage` block: one token per four chars.
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

// ---------------------------------------------------------------------------
// Translator
// ---------------------------------------------------------------------------

pub struct Translator {
    ctx: RequestContext,
    state: TranslatorState,
}

impl Translator {
    pub fn new(ctx: RequestContext) -> Self {
        Self {
            ctx,
            state: TranslatorState::AwaitingFirstFrame,
        }
    }

    pub fn state(&self) -> TranslatorState {
        self.state
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Apply one inbound frame. Frames for other runs, and anything after a
    /// terminal state, produce nothing.
    pub fn apply(&mut self, frame: &DeltaFrame) -> Vec<Emission> {
        if self.state.is_terminal() || frame.correlation_id != self.ctx.correlation_id {
            return Vec::new();
        }
        if self.state == TranslatorState::AwaitingFirstFrame {
            self.state = TranslatorState::Streaming;
        }
        match frame.event {
            DeltaEvent::Update => self.on_update(&frame.segments),
            DeltaEvent::Complete => self.on_complete(),
        }
    }

    /// Fail the run from outside (deadline, lost connection). Returns `None`
    /// if a terminal emission was already produced.
    pub fn fail(&mut self, error: GatewayError) -> Option<Emission> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = TranslatorState::Failed;
        self.ctx.completed = true;
        Some(Emission::Failed(error))
    }

    fn on_update(&mut self, segments: &[ContentSegment]) -> Vec<Emission> {
        let sole = segments.len() == 1;
        let mut emissions = Vec::new();
        for segment in segments {
            let delta = match segment.kind {
                SegmentKind::Answer => self.answer_delta(&segment.text),
                // Reasoning alongside an answer is a restatement; skip it.
                SegmentKind::Reasoning if sole => self.reasoning_delta(&segment.text),
                SegmentKind::Reasoning => continue,
            };
            if delta.is_empty() || !self.ctx.stream {
                continue;
            }
            emissions.push(Emission::Chunk(self.chunk(json!({ "content": delta }), None)));
        }
        emissions
    }

    fn answer_delta(&mut self, cumulative: &str) -> String {
        let fresh = cumulative_delta(&self.ctx.answer, cumulative).to_string();
        self.ctx.answer = cumulative.to_string();
        if fresh.is_empty() {
            return fresh;
        }
        if self.ctx.reasoning_opened && !self.ctx.reasoning_closed {
            self.ctx.reasoning_closed = true;
            return format!("{REASONING_CLOSE}{fresh}");
        }
        fresh
    }

    fn reasoning_delta(&mut self, cumulative: &str) -> String {
        if self.ctx.reasoning_closed {
            debug!(
                request_id = %self.ctx.request_id,
                "reasoning after answer started, ignored"
            );
            return String::new();
        }
        let fresh = cumulative_delta(&self.ctx.reasoning, cumulative).to_string();
        self.ctx.reasoning = cumulative.to_string();
        if fresh.is_empty() {
            return fresh;
        }
        if !self.ctx.reasoning_opened {
            self.ctx.reasoning_opened = true;
            return format!("{REASONING_OPEN}{fresh}");
        }
        fresh
    }

    fn on_complete(&mut self) -> Vec<Emission> {
        if self.ctx.completed {
            return Vec::new();
        }
        self.ctx.completed = true;

        if self.ctx.reasoning.is_empty() && self.ctx.answer.is_empty() {
            self.state = TranslatorState::Failed;
            return vec![Emission::Failed(GatewayError::EmptyUpstreamResponse)];
        }
        self.state = TranslatorState::Completed;

        if !self.ctx.stream {
            return vec![Emission::Done(self.completion_body())];
        }

        let mut emissions = Vec::new();
        if self.ctx.reasoning_opened && !self.ctx.reasoning_closed {
            self.ctx.reasoning_closed = true;
            emissions.push(Emission::Chunk(
                self.chunk(json!({ "content": REASONING_CLOSE }), None),
            ));
        }
        emissions.push(Emission::Done(self.chunk(json!({}), Some("stop"))));
        emissions
    }

    /// Assembled content for a non-streaming response.
    pub fn full_content(&self) -> String {
        if self.ctx.reasoning.is_empty() {
            return self.ctx.answer.clone();
        }
        format!(
            "{REASONING_OPEN}{}{REASONING_CLOSE}{}",
            self.ctx.reasoning, self.ctx.answer
        )
    }

    fn chunk(&mut self, mut delta: Value, finish_reason: Option<&str>) -> Value {
        if !self.ctx.role_sent {
            self.ctx.role_sent = true;
            if let Some(obj) = delta.as_object_mut() {
                obj.insert("role".into(), json!("assistant"));
            }
        }
        json!({
            "id": self.ctx.message_id,
            "object": "chat.completion.chunk",
            "created": self.ctx.created,
            "model": self.ctx.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn completion_body(&self) -> Value {
        let content = self.full_content();
        let prompt_tokens = estimate_tokens(self.ctx.prompt_chars);
        let completion_tokens = estimate_tokens(content.chars().count());
        json!({
            "id": self.ctx.message_id,
            "object": "chat.completion",
            "created": self.ctx.created,
            "model": self.ctx.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Feed `translator` from `frames` until the run terminates, the deadline
/// passes, or the connection drops. Exactly one terminal emission is sent
/// and the lease is returned on every path.
pub async fn translate(
    mut translator: Translator,
    mut frames: broadcast::Receiver<Arc<str>>,
    lease: ConnectionLease,
    out: mpsc::Sender<Emission>,
    deadline: Instant,
    limit: Duration,
) {
    let request_id = translator.context().request_id.clone();
    let correlation_id = translator.context().correlation_id.clone();
    let started = Instant::now();

    loop {
        let text = match tokio::time::timeout_at(deadline, frames.recv()).await {
            Ok(Ok(text)) => text,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(%request_id, %correlation_id, skipped, "translator lagged behind bus");
                continue;
            }
            Ok(Err(RecvError::Closed)) => {
                warn!(%request_id, %correlation_id, connection_id = lease.connection_id(), "bus connection closed mid-run");
                if let Some(failure) =
                    translator.fail(GatewayError::upstream(None, "bus connection closed"))
                {
                    let _ = out.send(failure).await;
                }
                lease.discard();
                return;
            }
            Err(_) => {
                warn!(%request_id, %correlation_id, deadline_secs = limit.as_secs(), "request deadline exceeded");
                if let Some(failure) = translator.fail(GatewayError::RequestTimeout(limit)) {
                    let _ = out.send(failure).await;
                }
                return;
            }
        };

        for frame in parse_envelope(&text) {
            for emission in translator.apply(&frame) {
                let terminal = emission.is_terminal();
                if out.send(emission).await.is_err() {
                    let error = GatewayError::StreamWriteError("client went away".into());
                    warn!(%request_id, %correlation_id, error = %error, "abandoning run");
                    return;
                }
                if terminal {
                    info!(
                        %request_id,
                        %correlation_id,
                        state = ?translator.state(),
                        latency_ms = started.elapsed().as_millis() as u64,
                        "run finished"
                    );
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
