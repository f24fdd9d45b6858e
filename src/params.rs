// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Parameter normalizer.
//
// Clamps or generates sampling parameters and projects them onto a model's
// upstream schema. Caller fields the gateway does not understand are ignored;
// parameters the model does not take are dropped.

use rand::Rng;
use serde_json::{Map, Value};

use crate::models::{CanonicalParam, ModelSchema};

/// Accepted `max_tokens` range; anything else becomes `MAX_TOKENS_CEILING`.
pub const MAX_TOKENS_FLOOR: u64 = 8192;
pub const MAX_TOKENS_CEILING: u64 = 16384;

/// Range substitute sampling values are drawn from.
const SAMPLING_FALLBACK: std::ops::RangeInclusive<f64> = 0.80..=0.90;

/// Sampling parameters as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<f64>,
}

impl SamplingParams {
    /// Read the recognised fields from a chat-completion body. Non-numeric
    /// values are treated as absent.
    pub fn from_request(body: &Value) -> Self {
        let num = |key: &str| body.get(key).and_then(Value::as_f64);
        Self {
            temperature: num("temperature"),
            top_p: num("top_p"),
            max_tokens: num("max_tokens"),
        }
    }
}

/// Corrected values, before projection onto a schema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u64,
    /// Derived as a quarter of `max_tokens`.
    pub reasoning_budget: u64,
}

impl NormalizedParams {
    /// Upstream parameter object for `schema`, containing only the keys the
    /// model declares.
    pub fn for_schema(&self, schema: &ModelSchema) -> Map<String, Value> {
        let mut out = Map::new();
        for (param, key) in &schema.parameters {
            let value = match param {
                CanonicalParam::Temperature => Value::from(self.temperature),
                CanonicalParam::TopP => Value::from(self.top_p),
                CanonicalParam::MaxTokens => Value::from(self.max_tokens),
                CanonicalParam::ReasoningBudget => {
                    // Only meaningful alongside a max-token limit.
                    if schema.upstream_key(CanonicalParam::MaxTokens).is_none() {
                        continue;
                    }
                    Value::from(self.reasoning_budget)
                }
            };
            out.insert(key.clone(), value);
        }
        out
    }
}

/// Normalise with the thread-local RNG.
pub fn normalize(params: &SamplingParams) -> NormalizedParams {
    normalize_with_rng(params, &mut rand::thread_rng())
}

/// Normalise `params`, drawing any substitute sampling values from `rng`.
pub fn normalize_with_rng<R: Rng + ?Sized>(params: &SamplingParams, rng: &mut R) -> NormalizedParams {
    let temperature = sampling_value(params.temperature, rng);
    let top_p = sampling_value(params.top_p, rng);
    let max_tokens = clamp_max_tokens(params.max_tokens);

    NormalizedParams {
        temperature,
        top_p,
        max_tokens,
        reasoning_budget: max_tokens / 4,
    }
}

/// Keep a sampling value in (0, 1]; otherwise draw a replacement.
fn sampling_value<R: Rng + ?Sized>(value: Option<f64>, rng: &mut R) -> f64 {
    match value {
        Some(v) if v > 0.0 && v <= 1.0 => v,
        _ => round2(rng.gen_range(SAMPLING_FALLBACK)),
    }
}

fn clamp_max_tokens(value: Option<f64>) -> u64 {
    match value {
        Some(v)
            if v.fract() == 0.0
                && v >= MAX_TOKENS_FLOOR as f64
                && v <= MAX_TOKENS_CEILING as f64 =>
        {
            v as u64
        }
        _ => MAX_TOKENS_CEILING,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
