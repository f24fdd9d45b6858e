// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Leases and dial slots.
//
// Both are RAII guards over per-identity state. Releasing a lease hands the
// connection straight to the oldest waiter; dropping an unused dial slot
// frees its capacity for the next waiter. Neither may be dropped while the
// identity lock is held, so values bounced back from a dead waiter are
// disarmed before they go out of scope.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::BusLink;

use super::user::{lock, PooledConnection, SharedUserPool, UserPool};
use super::PoolInner;

/// What a queued waiter is woken with.
pub(crate) enum Grant {
    /// An idle connection, already marked busy for the waiter.
    Connection(ConnectionLease),
    /// Capacity freed up; the waiter dials its own connection.
    Slot(DialSlot),
}

impl Grant {
    fn disarm(self) {
        match self {
            Grant::Connection(mut lease) => lease.released = true,
            Grant::Slot(mut slot) => slot.armed = false,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionLease
// ---------------------------------------------------------------------------

/// Exclusive use of one pooled connection for the duration of a request.
///
/// Dropping the lease releases the connection back to the pool. Call
/// [`ConnectionLease::discard`] instead when the connection should not be
/// reused.
pub struct ConnectionLease {
    pool: Arc<PoolInner>,
    user: SharedUserPool,
    account_id: String,
    connection_id: u64,
    failed: bool,
    released: bool,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("account_id", &self.account_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl ConnectionLease {
    pub(crate) fn new(
        pool: Arc<PoolInner>,
        user: SharedUserPool,
        account_id: String,
        connection_id: u64,
    ) -> Self {
        Self {
            pool,
            user,
            account_id,
            connection_id,
            failed: false,
            released: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Attach a subscriber to the leased connection's inbound frames.
    /// Returns `None` when the connection is gone or already closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Arc<str>>> {
        let guard = lock(&self.user);
        guard
            .connections
            .get(&self.connection_id)
            .filter(|c| c.link.is_open())
            .map(|c| c.link.subscribe())
    }

    /// Remove the connection from the pool and close it.
    pub fn discard(mut self) {
        self.failed = true;
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let stopped = self.pool.is_stopped();
        let mut guard = lock(&self.user);
        let pool: &mut UserPool = &mut guard;
        let Some(conn) = pool.connections.get_mut(&self.connection_id) else {
            return;
        };
        conn.requests_served += 1;
        conn.last_used_at = Instant::now();

        if self.failed || stopped || !conn.link.is_open() {
            if let Some(mut removed) = pool.remove(self.connection_id) {
                removed.link.close();
            }
            info!(
                account_id = %self.account_id,
                connection_id = self.connection_id,
                failed = self.failed,
                "bus connection removed on release"
            );
            offer_slots(pool, &self.pool, &self.user);
            return;
        }

        hand_off(pool, &self.pool, &self.user, &self.account_id, self.connection_id);
    }
}

/// Give an idle connection to the oldest live waiter, or mark it idle.
pub(crate) fn hand_off(
    pool: &mut UserPool,
    inner: &Arc<PoolInner>,
    user: &SharedUserPool,
    account_id: &str,
    connection_id: u64,
) {
    while let Some(waiter) = pool.wait_queue.pop_front() {
        let lease = ConnectionLease::new(
            inner.clone(),
            user.clone(),
            account_id.to_string(),
            connection_id,
        );
        match waiter.tx.send(Grant::Connection(lease)) {
            Ok(()) => {
                if let Some(conn) = pool.connections.get_mut(&connection_id) {
                    conn.busy = true;
                    conn.last_used_at = Instant::now();
                }
                debug!(account_id, connection_id, "connection handed to queued request");
                return;
            }
            Err(grant) => grant.disarm(),
        }
    }
    if let Some(conn) = pool.connections.get_mut(&connection_id) {
        conn.busy = false;
    }
}

/// Wake waiters with dial slots while there is spare capacity.
/// Once the pool is stopped the queue is dropped instead, so every waiter
/// sees its grant channel close.
pub(crate) fn offer_slots(pool: &mut UserPool, inner: &Arc<PoolInner>, user: &SharedUserPool) {
    if inner.is_stopped() {
        if !pool.wait_queue.is_empty() {
            debug!(waiters = pool.wait_queue.len(), "pool stopped, failing queued requests");
            pool.wait_queue.clear();
        }
        return;
    }
    let cap = inner.config.max_connections_per_identity;
    while pool.has_capacity(cap) {
        let Some(waiter) = pool.wait_queue.pop_front() else {
            return;
        };
        pool.dialing += 1;
        let slot = DialSlot::new(inner.clone(), user.clone());
        if let Err(grant) = waiter.tx.send(Grant::Slot(slot)) {
            grant.disarm();
            pool.dialing -= 1;
        }
    }
}

// ---------------------------------------------------------------------------
// DialSlot
// ---------------------------------------------------------------------------

/// Reserved capacity for one connection that is being dialled.
pub(crate) struct DialSlot {
    pool: Arc<PoolInner>,
    user: SharedUserPool,
    armed: bool,
}

impl DialSlot {
    /// Caller must already have counted the slot in `dialing`.
    pub(crate) fn new(pool: Arc<PoolInner>, user: SharedUserPool) -> Self {
        Self {
            pool,
            user,
            armed: true,
        }
    }

    /// Turn the reservation into a pooled, busy connection.
    pub(crate) fn register(mut self, account_id: &str, link: BusLink) -> ConnectionLease {
        self.armed = false;
        let connection_id = self.pool.next_connection_id();
        {
            let mut guard = lock(&self.user);
            guard.dialing -= 1;
            guard.insert(connection_id, PooledConnection::new(link, Instant::now()));
        }
        info!(account_id, connection_id, "bus connection opened");
        ConnectionLease::new(
            self.pool.clone(),
            self.user.clone(),
            account_id.to_string(),
            connection_id,
        )
    }
}

impl Drop for DialSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = lock(&self.user);
        guard.dialing -= 1;
        offer_slots(&mut guard, &self.pool, &self.user);
    }
}
