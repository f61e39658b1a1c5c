//! HTTP execution on top of the shared connection pool
//!
//! This module provides:
//! - The pooled client handle with synchronous attempt/retry loop
//! - Retry decisions for failed attempts
//! - Keep-alive negotiation from response headers

pub mod client;
pub mod keepalive;
pub mod retry;

pub use client::PooledClient;
pub use keepalive::{KeepAliveStrategy, DEFAULT_KEEP_ALIVE};
pub use retry::{is_idempotent, RetryPolicy};
