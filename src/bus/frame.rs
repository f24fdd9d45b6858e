// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Bus frame codec.
//
// Inbound text frames are envelopes:
//   {"action":"message","channel":"..","messages":[{"name":EVENT,"data":PAYLOAD}]}
// where PAYLOAD is a JSON string (or object) of the form
//   {"runId":"..","content":[{"type":"reasoning"|"answer","text":".."}]}
//
// One envelope can carry several messages. Anything that does not decode is
// discarded here and never surfaces as an error.

use serde::Deserialize;
use serde_json::Value;

use crate::identity::Identity;

pub const EVENT_UPDATE: &str = "UPDATE_LAST_MESSAGE";
pub const EVENT_COMPLETE: &str = "RUN_COMPLETE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Reasoning,
    Answer,
}

impl SegmentKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "reasoning" | "thinking" => Some(Self::Reasoning),
            "answer" | "text" => Some(Self::Answer),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Answer => "answer",
        }
    }
}

/// One channel's cumulative text-so-far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSegment {
    pub kind: SegmentKind,
    pub text: String,
}

impl ContentSegment {
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Reasoning,
            text: text.into(),
        }
    }

    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Answer,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaEvent {
    Update,
    Complete,
}

/// A decoded frame addressed to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub event: DeltaEvent,
    pub correlation_id: String,
    pub segments: Vec<ContentSegment>,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope {
    action: String,
    channel: Option<String>,
    #[serde(default)]
    messages: Vec<EnvelopeMessage>,
}

#[derive(Deserialize)]
struct EnvelopeMessage {
    name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(rename = "runId")]
    run_id: String,
    #[serde(default)]
    content: Vec<RawSegment>,
}

#[derive(Deserialize)]
struct RawSegment {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode every usable delta frame in an inbound envelope.
pub fn parse_envelope(text: &str) -> Vec<DeltaFrame> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(error = %e, "discarding undecodable bus frame");
            return Vec::new();
        }
    };
    if envelope.action != "message" {
        return Vec::new();
    }

    envelope
        .messages
        .into_iter()
        .filter_map(|m| {
            let event = match m.name.as_str() {
                EVENT_UPDATE => DeltaEvent::Update,
                EVENT_COMPLETE => DeltaEvent::Complete,
                _ => return None,
            };
            let payload = decode_payload(m.data)?;
            if payload.run_id.is_empty() {
                return None;
            }
            let segments = payload
                .content
                .into_iter()
                .filter_map(|s| {
                    Some(ContentSegment {
                        kind: SegmentKind::parse(&s.kind)?,
                        text: s.text?,
                    })
                })
                .collect();
            Some(DeltaFrame {
                event,
                correlation_id: payload.run_id,
                segments,
            })
        })
        .collect()
}

/// The payload arrives either as a JSON string holding JSON, or inline.
fn decode_payload(data: Value) -> Option<Payload> {
    match data {
        Value::String(s) => serde_json::from_str(&s).ok(),
        other @ Value::Object(_) => serde_json::from_value(other).ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Frame sent right after the transport opens.
pub fn subscribe_frame(identity: &Identity) -> String {
    serde_json::json!({
        "action": "subscribe",
        "channel": identity.channel(),
        "clientId": identity.bus_client_id,
    })
    .to_string()
}

/// Whether `text` confirms the subscription to `channel`.
pub fn is_attach_confirmation(text: &str, channel: &str) -> bool {
    match serde_json::from_str::<Envelope>(text) {
        Ok(e) => e.action == "attached" && e.channel.as_deref() == Some(channel),
        Err(_) => false,
    }
}

/// Encode a single-message envelope. Used by fake buses in tests and benches.
pub fn encode_message(
    channel: &str,
    event: &str,
    correlation_id: &str,
    segments: &[ContentSegment],
) -> String {
    let content: Vec<Value> = segments
        .iter()
        .map(|s| serde_json::json!({"type": s.kind.as_str(), "text": s.text}))
        .collect();
    let payload = serde_json::json!({"runId": correlation_id, "content": content});
    serde_json::json!({
        "action": "message",
        "channel": channel,
        "messages": [{"name": event, "data": payload.to_string()}],
    })
    .to_string()
}
