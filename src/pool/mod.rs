// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Connection pool.
//
// Per identity: up to `max_connections_per_identity` bus connections, each
// leased to at most one request at a time. Requests beyond the cap wait in a
// FIFO queue bounded by `queue_timeout`. A background reaper retires idle,
// worn-out and closed connections and forgets identities with nothing left.
//
// Lock order: the top-level index shard lock is never held while taking an
// identity lock. Guards that re-enter an identity lock on drop are never
// dropped while it is held.

mod lease;
mod stats;
mod user;


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::BusConnector;
use crate::config::PoolConfig;
use crate::error::GatewayError;
use crate::identity::Identity;

use lease::{offer_slots, DialSlot, Grant};
use user::{lock, SharedUserPool, UserPool, Waiter};

pub use lease::ConnectionLease;
pub use stats::{PoolStats, UserStats};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    connector: Arc<dyn BusConnector>,
    users: DashMap<String, SharedUserPool>,
    next_connection: AtomicU64,
    next_ticket: AtomicU64,
    stopped: AtomicBool,
}

impl PoolInner {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn user_pool(&self, account_id: &str) -> SharedUserPool {
        if let Some(existing) = self.users.get(account_id) {
            return existing.value().clone();
        }
        self.users
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserPool::default())))
            .value()
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, SharedUserPool)> {
        self.users
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Remove every idle connection that is closed, idle too long, or past
    /// its usage cap. Drops identities left with nothing. Returns the
    /// number of connections removed.
    fn sweep(self: &Arc<Self>, now: Instant, drain: bool) -> usize {
        let mut reaped = 0;
        for (account_id, user) in self.snapshot() {
            let mut guard = lock(&user);
            let pool: &mut UserPool = &mut guard;

            let expired: Vec<(u64, &'static str)> = pool
                .connections
                .iter()
                .filter(|(_, c)| !c.busy)
                .filter_map(|(id, c)| {
                    let reason = if drain {
                        "shutdown"
                    } else if !c.link.is_open() {
                        "closed"
                    } else if now.saturating_duration_since(c.last_used_at) > self.config.idle_timeout
                    {
                        "idle"
                    } else if c.requests_served > self.config.max_requests_per_connection {
                        "usage_cap"
                    } else {
                        return None;
                    };
                    Some((*id, reason))
                })
                .collect();

            for (connection_id, reason) in &expired {
                if let Some(mut conn) = pool.remove(*connection_id) {
                    conn.link.close();
                    info!(
                        account_id = %account_id,
                        connection_id,
                        reason,
                        age_secs = now.saturating_duration_since(conn.created_at).as_secs(),
                        requests_served = conn.requests_served,
                        "bus connection reaped"
                    );
                    reaped += 1;
                }
            }
            if !expired.is_empty() {
                offer_slots(pool, self, &user);
            }

            if pool.is_empty() {
                pool.retired = true;
                self.users.remove_if(&account_id, |_, v| Arc::ptr_eq(v, &user));
                debug!(account_id = %account_id, "identity pool dropped");
            }
        }
        reaped
    }
}

enum Step {
    Ready(ConnectionLease),
    Dial(DialSlot),
    Wait(u64, oneshot::Receiver<Grant>),
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct Reaper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<Reaper>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn BusConnector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                users: DashMap::new(),
                next_connection: AtomicU64::new(0),
                next_ticket: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection for `identity`.
    ///
    /// Reuses an idle connection when one exists, dials a new one while
    /// under the cap, and otherwise queues behind earlier requests.
    pub async fn acquire(&self, identity: &Identity) -> Result<ConnectionLease, GatewayError> {
        if self.inner.is_stopped() {
            return Err(shut_down());
        }
        let account_id = identity.account_id.as_str();
        let (user, step) = loop {
            let user = self.inner.user_pool(account_id);
            if let Some(step) = self.reserve(account_id, &user) {
                break (user, step);
            }
        };
        match step {
            Step::Ready(lease) => {
                debug!(account_id, connection_id = lease.connection_id(), "reusing bus connection");
                Ok(lease)
            }
            Step::Dial(slot) => self.dial(identity, slot).await,
            Step::Wait(ticket, rx) => self.wait(identity, user, ticket, rx).await,
        }
    }

    /// Returns `None` when the identity pool was retired underneath us.
    fn reserve(&self, account_id: &str, user: &SharedUserPool) -> Option<Step> {
        let mut guard = lock(user);
        if guard.retired {
            return None;
        }
        let pool: &mut UserPool = &mut guard;

        let closed: Vec<u64> = pool
            .connections
            .iter()
            .filter(|(_, c)| !c.busy && !c.link.is_open())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            pool.remove(id);
        }

        if let Some((&connection_id, conn)) = pool.connections.iter_mut().find(|(_, c)| !c.busy) {
            conn.busy = true;
            conn.last_used_at = Instant::now();
            return Some(Step::Ready(ConnectionLease::new(
                self.inner.clone(),
                user.clone(),
                account_id.to_string(),
                connection_id,
            )));
        }

        if pool.has_capacity(self.inner.config.max_connections_per_identity) {
            pool.dialing += 1;
            return Some(Step::Dial(DialSlot::new(self.inner.clone(), user.clone())));
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pool.wait_queue.push_back(Waiter { ticket, tx });
        debug!(
            account_id,
            queue_length = pool.wait_queue.len(),
            "pool at capacity, request queued"
        );
        Some(Step::Wait(ticket, rx))
    }

    async fn dial(&self, identity: &Identity, slot: DialSlot) -> Result<ConnectionLease, GatewayError> {
        let limit = self.inner.config.connect_timeout;
        let connect = self
            .inner
            .connector
            .connect(identity, self.inner.config.frame_buffer);
        match tokio::time::timeout(limit, connect).await {
            Ok(Ok(link)) => Ok(slot.register(&identity.account_id, link)),
            Ok(Err(err)) => {
                warn!(account_id = %identity.account_id, error = %err, "bus connect failed");
                Err(GatewayError::upstream(None, err.to_string()))
            }
            Err(_) => {
                warn!(
                    account_id = %identity.account_id,
                    timeout_ms = limit.as_millis() as u64,
                    "bus connect timed out"
                );
                Err(GatewayError::ConnectionTimeout(limit))
            }
        }
    }

    async fn wait(
        &self,
        identity: &Identity,
        user: SharedUserPool,
        ticket: u64,
        mut rx: oneshot::Receiver<Grant>,
    ) -> Result<ConnectionLease, GatewayError> {
        let limit = self.inner.config.queue_timeout;
        let mut queued = QueueTicket {
            user,
            ticket,
            armed: true,
        };
        let grant = match tokio::time::timeout(limit, &mut rx).await {
            Ok(Ok(grant)) => {
                queued.armed = false;
                grant
            }
            Ok(Err(_)) if self.inner.is_stopped() => return Err(shut_down()),
            Ok(Err(_)) => return Err(GatewayError::QueuePolicyTimeout(limit)),
            Err(_) => {
                // A grant sent just before the deadline is still honoured.
                if queued.withdraw() {
                    warn!(
                        account_id = %identity.account_id,
                        timeout_ms = limit.as_millis() as u64,
                        "queued request timed out"
                    );
                    return Err(GatewayError::QueuePolicyTimeout(limit));
                }
                match rx.try_recv() {
                    Ok(grant) => grant,
                    Err(_) => return Err(GatewayError::QueuePolicyTimeout(limit)),
                }
            }
        };
        match grant {
            Grant::Connection(lease) => Ok(lease),
            Grant::Slot(slot) => self.dial(identity, slot).await,
        }
    }

    /// Return a connection to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    /// Run one reaper pass now.
    pub fn sweep(&self) -> usize {
        self.inner.sweep(Instant::now(), false)
    }

    /// Start the periodic reaper. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut reaper = self.reaper.lock().unwrap_or_else(|p| p.into_inner());
        if reaper.is_some() {
            return;
        }
        let (shutdown, mut stop) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let reaped = inner.sweep(Instant::now(), false);
                        if reaped > 0 {
                            debug!(reaped, "reaper pass complete");
                        }
                    }
                }
            }
        });
        *reaper = Some(Reaper { shutdown, handle });
        info!(interval_secs = period.as_secs(), "connection reaper started");
    }

    /// Stop the reaper and close every idle connection. Leases still out
    /// close their connection when released.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(reaper) = reaper {
            let _ = reaper.shutdown.send(());
            let _ = reaper.handle.await;
        }
        let closed = self.inner.sweep(Instant::now(), true);
        info!(closed, "connection pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for (account_id, user) in self.inner.snapshot() {
            let guard = lock(&user);
            if guard.retired {
                continue;
            }
            let busy = guard.connections.values().filter(|c| c.busy).count();
            stats.total_connections += guard.connections.len();
            stats.user_stats.insert(
                account_id,
                UserStats {
                    active_connections: busy,
                    queue_length: guard.wait_queue.len(),
                    active_count: guard.active_count,
                },
            );
        }
        stats.total_users = stats.user_stats.len();
        stats
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let reaper = self
            .reaper
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(reaper) = reaper {
            reaper.handle.abort();
        }
    }
}

fn shut_down() -> GatewayError {
    GatewayError::upstream(None, "connection pool is shut down")
}

/// Withdraws a queued request if the caller gives up on it.
struct QueueTicket {
    user: SharedUserPool,
    ticket: u64,
    armed: bool,
}

impl QueueTicket {
    /// Remove the waiter. False means a grant was already sent.
    fn withdraw(&mut self) -> bool {
        self.armed = false;
        lock(&self.user).remove_waiter(self.ticket)
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.user).remove_waiter(self.ticket);
        }
    }
}
