// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Per-identity pool state. Every field is guarded by the identity's mutex.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bus::BusLink;

use super::lease::Grant;

/// A live bus connection owned by the pool.
pub(crate) struct PooledConnection {
    pub(crate) link: BusLink,
    pub(crate) busy: bool,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) requests_served: u64,
}

impl PooledConnection {
    pub(crate) fn new(link: BusLink, now: Instant) -> Self {
        Self {
            link,
            busy: true,
            created_at: now,
            last_used_at: now,
            requests_served: 0,
        }
    }
}

/// A suspended `acquire` call.
pub(crate) struct Waiter {
    pub(crate) ticket: u64,
    pub(crate) tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
pub(crate) struct UserPool {
    pub(crate) connections: BTreeMap<u64, PooledConnection>,
    /// Served strictly front to back.
    pub(crate) wait_queue: VecDeque<Waiter>,
    /// Always equal to `connections.len()`.
    pub(crate) active_count: usize,
    /// Dials in flight. They count against the cap but are not yet pooled.
    pub(crate) dialing: usize,
    /// Set once the pool has been dropped from the top-level index.
    pub(crate) retired: bool,
}

impl UserPool {
    pub(crate) fn has_capacity(&self, cap: usize) -> bool {
        self.connections.len() + self.dialing < cap
    }

    pub(crate) fn insert(&mut self, connection_id: u64, connection: PooledConnection) {
        self.connections.insert(connection_id, connection);
        self.active_count += 1;
    }

    pub(crate) fn remove(&mut self, connection_id: u64) -> Option<PooledConnection> {
        let removed = self.connections.remove(&connection_id);
        if removed.is_some() {
            self.active_count -= 1;
        }
        removed
    }

    /// Drop a queued waiter. Returns false if it was already served.
    pub(crate) fn remove_waiter(&mut self, ticket: u64) -> bool {
        match self.wait_queue.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                self.wait_queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty() && self.wait_queue.is_empty() && self.dialing == 0
    }
}

pub(crate) type SharedUserPool = Arc<Mutex<UserPool>>;

/// Lock an identity's pool. A poisoned lock still guards consistent data:
/// no critical section panics midway through an update.
pub(crate) fn lock(user: &Mutex<UserPool>) -> MutexGuard<'_, UserPool> {
    user.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
