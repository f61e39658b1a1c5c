//! Connection manager: the entry point that owns the shared pool
//!
//! A manager is built once from a [`ConnectionConfiguration`] and hands out
//! any number of [`PooledClient`]s. All of them lease from the same pool and
//! share one retry policy and keep-alive strategy.

use std::sync::Arc;
use tracing::{info, trace};

use crate::config::{ConnectionConfiguration, RequestConfig};
use crate::error::Result;
use crate::http::{KeepAliveStrategy, PooledClient, RetryPolicy};
use crate::pool::{ConnectionPool, Connector, PoolConfig, PoolStats};

/// Connection manager for an object store endpoint
///
/// Owns the one connection pool every client it creates shares. Dropping
/// the manager shuts the pool down and closes its idle connections.
pub struct ConnectionManager {
    config: Arc<ConnectionConfiguration>,
    connection_pool: Arc<ConnectionPool>,
    request_config: Arc<RequestConfig>,
    retry_policy: RetryPolicy,
    keep_alive: KeepAliveStrategy,
}

impl ConnectionManager {
    /// Build the pool and request defaults from `config`
    ///
    /// No connections are opened until a client issues a request.
    pub fn new(config: ConnectionConfiguration) -> Result<Self> {
        config.validate()?;

        trace!(max_per_route = config.max_per_route, "Setting default max per route");
        trace!(max_total = config.max_total, "Setting max total");
        trace!(socket_timeout_ms = config.socket_timeout_ms, "Using socket timeout");

        let connection_pool = Arc::new(ConnectionPool::new(PoolConfig::from_configuration(&config)));
        let request_config = Arc::new(RequestConfig::from_configuration(&config));
        let retry_policy = RetryPolicy::new(config.max_execution_count);

        info!(
            max_per_route = config.max_per_route,
            max_total = config.max_total,
            max_execution_count = config.max_execution_count,
            "Connection manager ready"
        );

        Ok(Self {
            config: Arc::new(config),
            connection_pool,
            request_config,
            retry_policy,
            keep_alive: KeepAliveStrategy::default(),
        })
    }

    /// Create a client bound to the shared pool
    ///
    /// Every client uses the same retry policy, keep-alive negotiation and
    /// request defaults, with TLS restricted to version 1.2.
    pub fn create_client(&self) -> Result<PooledClient> {
        trace!("Building client on shared connection pool");
        let connector = Connector::new()?;
        Ok(PooledClient::new(
            Arc::downgrade(&self.connection_pool),
            Arc::clone(&self.request_config),
            self.retry_policy,
            self.keep_alive,
            connector,
        ))
    }

    pub fn config(&self) -> &ConnectionConfiguration {
        &self.config
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.request_config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// The shared pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.connection_pool
    }

    pub fn stats(&self) -> PoolStats {
        self.connection_pool.stats()
    }

    /// Close idle connections whose keep-alive has expired
    pub fn close_expired(&self) -> usize {
        self.connection_pool.close_expired()
    }

    /// Close the pool explicitly; also done on drop
    pub fn shutdown(&self) {
        self.connection_pool.shutdown();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.connection_pool.shutdown();
    }
}
