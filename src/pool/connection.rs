//! Route-aware connection pool with per-route and total caps
//!
//! This module provides the single pool shared by every client of a
//! connection manager:
//! - Per-route and global limits on open connections
//! - Bounded wait when a limit is exhausted
//! - Reuse of idle HTTP/1.1 connections until their keep-alive expires
//! - Eviction of expired and idle connections

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::connector::{Connector, Sender, SocketConfig};
use super::route::Route;
use crate::config::{ConnectionConfiguration, RequestConfig};
use crate::error::{ClientError, TransportError, TransportErrorKind};

/// Configuration for connection pool behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum open connections per route, leased or idle
    pub max_per_route: usize,

    /// Maximum open connections across all routes, leased or idle
    pub max_total: usize,

    /// Socket defaults for new connections
    pub socket: SocketConfig,
}

impl PoolConfig {
    pub fn from_configuration(config: &ConnectionConfiguration) -> Self {
        Self {
            max_per_route: config.max_per_route,
            max_total: config.max_total,
            socket: SocketConfig {
                so_timeout: config.socket_timeout(),
                so_keepalive: false,
                tcp_nodelay: true,
            },
        }
    }
}

/// Statistics for a route, or for the whole pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently leased
    pub leased: usize,

    /// Idle connections available for reuse
    pub available: usize,

    /// Lease requests waiting for a slot
    pub pending: usize,

    /// Open connection limit
    pub max: usize,

    /// Total connections opened
    pub total_created: u64,

    /// Total leases served by an idle connection
    pub total_reused: u64,
}

/// An idle connection waiting for reuse
struct IdleConnection {
    sender: Sender,
    idle_since: Instant,
    /// `None` keeps the connection until evicted for another reason
    expiry: Option<Instant>,
    created_at: Instant,
    use_count: u64,
}

impl IdleConnection {
    fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|at| now >= at)
    }

    fn is_reusable(&self, now: Instant) -> bool {
        !self.is_expired(now) && !self.sender.is_closed()
    }
}

/// Per-route pool state
#[derive(Default)]
struct RoutePool {
    leased: usize,
    /// Oldest first
    idle: Vec<IdleConnection>,
    pending: usize,
    total_created: u64,
    total_reused: u64,
}

impl RoutePool {
    fn is_unused(&self) -> bool {
        self.leased == 0 && self.pending == 0 && self.idle.is_empty()
    }
}

/// Pool bookkeeping; every open connection is either leased or idle
struct PoolState {
    routes: HashMap<Route, RoutePool>,
    leased_total: usize,
    idle_total: usize,
    total_created: u64,
    total_reused: u64,
    closed: bool,
}

impl PoolState {
    fn route_mut(&mut self, route: &Route) -> &mut RoutePool {
        self.routes.entry(route.clone()).or_default()
    }

    fn evict(&mut self, mut keep: impl FnMut(&IdleConnection) -> bool) -> usize {
        let mut removed = 0;
        for (route, pool) in self.routes.iter_mut() {
            let before = pool.idle.len();
            pool.idle.retain(|conn| !conn.sender.is_closed() && keep(conn));
            let n = before - pool.idle.len();
            if n > 0 {
                debug!(route = %route, removed = n, remaining = pool.idle.len(), "Evicted idle connections");
            }
            removed += n;
        }
        self.idle_total -= removed;
        self.prune();
        removed
    }

    /// Close the least recently used idle connection of any route
    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .routes
            .iter()
            .filter_map(|(route, pool)| pool.idle.first().map(|conn| (conn.idle_since, route)))
            .min_by_key(|(idle_since, _)| *idle_since)
            .map(|(_, route)| route.clone());

        let Some(route) = oldest else {
            return false;
        };
        if let Some(pool) = self.routes.get_mut(&route) {
            pool.idle.remove(0);
            self.idle_total -= 1;
            debug!(route = %route, "Closed least recently used idle connection");
        }
        self.prune();
        true
    }

    /// Forget routes with nothing leased, idle or waiting
    fn prune(&mut self) {
        self.routes.retain(|_, pool| !pool.is_unused());
    }
}

/// Outcome of one pass over the pool state during a lease
enum Claim {
    Reuse(IdleConnection),
    Connect,
    Wait,
}

/// Connection pool shared by all clients of a manager
///
/// Idle connections count against both caps. When the total cap is reached
/// and a route needs a new connection, the least recently used idle
/// connection of another route is closed to make room.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    released: Notify,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(config: PoolConfig) -> Self {
        info!(
            max_per_route = config.max_per_route,
            max_total = config.max_total,
            so_timeout_ms = config.socket.so_timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
            "Creating connection pool"
        );
        Self {
            state: Mutex::new(PoolState {
                routes: HashMap::new(),
                leased_total: 0,
                idle_total: 0,
                total_created: 0,
                total_reused: 0,
                closed: false,
            }),
            released: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a connection for `route`
    ///
    /// Reuses an idle connection of the route or opens a new one with
    /// `connector`. When both are blocked by a cap, waits at most
    /// `request.connection_request_timeout` for another lease to end.
    pub async fn lease(
        self: &Arc<Self>,
        route: &Route,
        connector: &Connector,
        request: &RequestConfig,
    ) -> Result<PooledConnection, ClientError> {
        let deadline = request
            .connection_request_timeout
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let released = self.released.notified();
            tokio::pin!(released);

            let claim = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ClientError::PoolClosed);
                }
                let claim = self.claim(&mut state, route);
                if matches!(claim, Claim::Wait) {
                    // Registered before the lock is released so no wakeup is lost
                    released.as_mut().enable();
                    state.route_mut(route).pending += 1;
                }
                claim
            };

            match claim {
                Claim::Reuse(mut idle) => {
                    let slot = LeaseSlot::new(self, route);
                    // The driver may still be finishing the previous exchange
                    if idle.sender.ready().await.is_err() {
                        debug!(route = %route, "Discarding closed connection");
                        continue;
                    }
                    debug!(
                        route = %route,
                        use_count = idle.use_count,
                        age_secs = idle.created_at.elapsed().as_secs(),
                        "Reusing connection"
                    );
                    self.count_reused(route);
                    return Ok(PooledConnection {
                        slot,
                        sender: idle.sender,
                        created_at: idle.created_at,
                        use_count: idle.use_count + 1,
                        reused: true,
                    });
                }
                Claim::Connect => {
                    let slot = LeaseSlot::new(self, route);
                    let sender = connector
                        .connect(route, request.connect_timeout, &self.config.socket)
                        .await?;
                    let total_created = self.count_created(route);
                    info!(route = %route, total_created = total_created, "Created new connection");

                    return Ok(PooledConnection {
                        slot,
                        sender,
                        created_at: Instant::now(),
                        use_count: 1,
                        reused: false,
                    });
                }
                Claim::Wait => {
                    let _pending = PendingGuard { pool: &**self, route };
                    let woken = match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, released).await.is_ok(),
                        None => {
                            released.await;
                            true
                        }
                    };
                    if !woken {
                        debug!(route = %route, "Timed out waiting for pooled connection");
                        return Err(TransportError::new(
                            TransportErrorKind::ConnectTimeout,
                            route,
                            "timeout waiting for connection from pool",
                        )
                        .into());
                    }
                }
            }
        }
    }

    /// Reserve a slot for `route`, taking an idle connection when one is live
    ///
    /// A successful claim counts as leased until its [`LeaseSlot`] drops.
    fn claim(&self, state: &mut PoolState, route: &Route) -> Claim {
        let now = Instant::now();
        state.evict(|conn| !conn.is_expired(now));

        // Most recently released first
        while let Some(conn) = state.routes.get_mut(route).and_then(|pool| pool.idle.pop()) {
            state.idle_total -= 1;
            if conn.is_reusable(now) {
                state.leased_total += 1;
                state.route_mut(route).leased += 1;
                return Claim::Reuse(conn);
            }
        }

        let route_leased = state.routes.get(route).map_or(0, |pool| pool.leased);
        if route_leased >= self.config.max_per_route {
            return Claim::Wait;
        }
        if state.leased_total + state.idle_total >= self.config.max_total && !state.evict_lru() {
            return Claim::Wait;
        }

        state.leased_total += 1;
        state.route_mut(route).leased += 1;
        Claim::Connect
    }

    fn count_reused(&self, route: &Route) {
        let mut state = self.state.lock();
        state.total_reused += 1;
        state.route_mut(route).total_reused += 1;
    }

    fn count_created(&self, route: &Route) -> u64 {
        let mut state = self.state.lock();
        state.total_created += 1;
        let pool = state.route_mut(route);
        pool.total_created += 1;
        pool.total_created
    }

    /// End a lease, parking `idle` for reuse when given
    fn finish_lease(&self, route: &Route, idle: Option<IdleConnection>) {
        {
            let mut state = self.state.lock();
            state.leased_total = state.leased_total.saturating_sub(1);
            let closed = state.closed;
            let pool = state.route_mut(route);
            pool.leased = pool.leased.saturating_sub(1);

            match idle {
                Some(conn) if !closed && !conn.sender.is_closed() => {
                    pool.idle.push(conn);
                    state.idle_total += 1;
                }
                _ => state.prune(),
            }
        }
        self.released.notify_waiters();
    }

    /// Close idle connections whose keep-alive has expired
    pub fn close_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.state.lock().evict(|conn| !conn.is_expired(now));
        self.released.notify_waiters();
        removed
    }

    /// Close connections that have been idle longer than `idle_time`
    pub fn close_idle(&self, idle_time: Duration) -> usize {
        let removed = self
            .state
            .lock()
            .evict(|conn| conn.idle_since.elapsed() < idle_time);
        self.released.notify_waiters();
        removed
    }

    /// Statistics for one route
    pub fn route_stats(&self, route: &Route) -> Option<PoolStats> {
        let state = self.state.lock();
        state.routes.get(route).map(|pool| PoolStats {
            leased: pool.leased,
            available: pool.idle.len(),
            pending: pool.pending,
            max: self.config.max_per_route,
            total_created: pool.total_created,
            total_reused: pool.total_reused,
        })
    }

    /// Statistics across all routes
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            leased: state.leased_total,
            available: state.idle_total,
            pending: state.routes.values().map(|pool| pool.pending).sum(),
            max: self.config.max_total,
            total_created: state.total_created,
            total_reused: state.total_reused,
        }
    }

    /// Routes with leased, idle or waiting connections
    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the pool and every idle connection
    ///
    /// Waiting and future leases fail with [`ClientError::PoolClosed`].
    /// Leased connections are closed when their holders drop them.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let closed = state.idle_total;
            for pool in state.routes.values_mut() {
                pool.idle.clear();
            }
            state.idle_total = 0;
            info!(closed_idle = closed, "Connection pool shut down");
        }
        self.released.notify_waiters();
    }
}

/// Tracks a lease waiting for a slot, undone when the wait ends or is cancelled
struct PendingGuard<'a> {
    pool: &'a ConnectionPool,
    route: &'a Route,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        if let Some(pool) = state.routes.get_mut(self.route) {
            pool.pending = pool.pending.saturating_sub(1);
        }
        state.prune();
    }
}

/// A claimed slot; freed on drop unless handed back with an idle connection
struct LeaseSlot {
    pool: Arc<ConnectionPool>,
    route: Route,
    armed: bool,
}

impl LeaseSlot {
    fn new(pool: &Arc<ConnectionPool>, route: &Route) -> Self {
        Self {
            pool: Arc::clone(pool),
            route: route.clone(),
            armed: true,
        }
    }

    fn finish(mut self, idle: IdleConnection) {
        self.armed = false;
        self.pool.finish_lease(&self.route, Some(idle));
    }
}

impl Drop for LeaseSlot {
    fn drop(&mut self) {
        if self.armed {
            self.pool.finish_lease(&self.route, None);
        }
    }
}

/// A leased connection
///
/// Dropping it closes the connection; [`PooledConnection::release`] returns
/// it to the pool for reuse. The route and global slots are freed either way.
pub struct PooledConnection {
    slot: LeaseSlot,
    sender: Sender,
    created_at: Instant,
    use_count: u64,
    reused: bool,
}

impl PooledConnection {
    pub fn route(&self) -> &Route {
        &self.slot.route
    }

    /// Whether this lease was served by an idle connection
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Send a request on this connection
    pub async fn send_request(
        &mut self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, TransportError> {
        let route = &self.slot.route;
        self.sender
            .ready()
            .await
            .map_err(|e| TransportError::from_hyper(route, e))?;
        self.sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::from_hyper(route, e))
    }

    /// Return the connection to the pool, reusable for `keep_alive`
    ///
    /// A zero `keep_alive` keeps the connection until it is evicted.
    pub fn release(self, keep_alive: Duration) {
        let PooledConnection {
            slot,
            sender,
            created_at,
            use_count,
            ..
        } = self;

        let now = Instant::now();
        let expiry = (!keep_alive.is_zero()).then(|| now + keep_alive);
        debug!(route = %slot.route, keep_alive_ms = keep_alive.as_millis() as u64, "Connection released");
        slot.finish(IdleConnection {
            sender,
            idle_since: now,
            expiry,
            created_at,
            use_count,
        });
    }
}
