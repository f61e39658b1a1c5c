//! objconn - pooled HTTP connections with retry and keep-alive policy for object storage

pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod pool;

pub use config::ConnectionConfiguration;
pub use error::{ClientError, Result, TransportError, TransportErrorKind};
pub use http::{KeepAliveStrategy, PooledClient, RetryPolicy};
pub use manager::ConnectionManager;
pub use pool::{ConnectionPool, PoolStats, Route};
