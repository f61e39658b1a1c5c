//! Connection pooling module
//!
//! This module provides:
//! - A route-aware pool bounded per route and in total
//! - Bounded waits for a free connection slot
//! - Connection setup with TLS 1.2 and socket defaults

pub mod connection;
pub mod connector;
pub mod route;

pub use connection::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use connector::{Connector, SocketConfig};
pub use route::{Route, Scheme};

pub(crate) use connector::with_timeout;
