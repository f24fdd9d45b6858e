// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use crate::identity::Identity;
use crate::models::ModelSchema;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Parsed and validated gateway config.
#[derive(Debug, Clone)]
pub struct Config {
    /// Config format version. Always "v1".
    pub version: String,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub request: RequestConfig,
    /// Identities keyed by the API key callers present as a bearer token.
    pub identities: HashMap<String, Identity>,
    /// Model catalog: embedded defaults first, then user entries (which
    /// replace defaults with the same name).
    pub models: Vec<ModelSchema>,
    /// Environment label (e.g. "staging", "production").
    pub environment: String,
    /// SHA256 of the raw YAML: "sha256:{hex}".
    pub config_hash: String,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9800 }
    }
}

/// Upstream endpoints. Both are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Base URL of the control plane (session + run submission).
    pub control_plane_url: String,
    /// Websocket URL of the realtime bus.
    pub bus_url: String,
}

/// Connection pool tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on open bus connections per identity.
    pub max_connections_per_identity: usize,
    /// Non-busy connections idle longer than this are reaped.
    pub idle_timeout: Duration,
    /// Connections that served more than this many requests are reaped.
    pub max_requests_per_connection: u64,
    /// Reaper sweep period.
    pub sweep_interval: Duration,
    /// Bound on dialing a connection and receiving the subscribe confirmation.
    pub connect_timeout: Duration,
    /// Bound on waiting in an identity's queue for a connection.
    pub queue_timeout: Duration,
    /// Per-connection frame fan-out buffer.
    pub frame_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: 10,
            idle_timeout: Duration::from_secs(300),
            max_requests_per_connection: 100,
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(10_000),
            queue_timeout: Duration::from_millis(30_000),
            frame_buffer: 1024,
        }
    }
}

/// Control-plane retry behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after.
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2_000),
            attempt_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    /// Overall per-request deadline, armed when the request starts.
    pub deadline: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(600),
        }
    }
}
