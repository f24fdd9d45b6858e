// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Raw YAML deserialization types (internal).
// Kept apart from the public Config structs: interpolation, defaulting and
// validation happen between the two.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub busgate: String,
    pub server: Option<RawServerConfig>,
    pub upstream: Option<RawUpstreamConfig>,
    pub pool: Option<RawPoolConfig>,
    pub retry: Option<RawRetryConfig>,
    pub request: Option<RawRequestConfig>,
    #[serde(default)]
    pub identities: HashMap<String, RawIdentity>,
    #[serde(default)]
    pub models: Vec<RawModel>,
    /// If false, skip the embedded default model catalog. Default: true.
    pub use_default_models: Option<bool>,
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawServerConfig {
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct RawUpstreamConfig {
    pub control_plane_url: Option<String>,
    pub bus_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawPoolConfig {
    pub max_connections_per_identity: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub max_requests_per_connection: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub queue_timeout_ms: Option<u64>,
    pub frame_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RawRetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawRequestConfig {
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawIdentity {
    pub account_id: String,
    pub bus_credential: String,
    pub bus_client_id: String,
    pub control_plane_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RawModel {
    pub name: String,
    pub upstream_model: Option<String>,
    /// Canonical parameter name -> upstream parameter key.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RawModelCatalog {
    pub models: Vec<RawModel>,
}
