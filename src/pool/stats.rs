// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::Serialize;

/// Snapshot served by `GET /v1/status/websocket-pool`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_users: usize,
    pub total_connections: usize,
    pub user_stats: BTreeMap<String, UserStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    /// Connections currently leased to a request.
    pub active_connections: usize,
    pub queue_length: usize,
    /// Connections held by the pool, busy or idle.
    pub active_count: usize,
}
