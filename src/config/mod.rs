use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_total ({max_total}) must be at least max_per_route ({max_per_route})")]
    TotalBelowPerRoute { max_total: usize, max_per_route: usize },
}

/// Connection settings consumed by the connection manager
///
/// All timeouts are in milliseconds; `0` means no timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfiguration {
    /// Maximum concurrent connections per route
    #[serde(default = "default_max_per_route")]
    pub max_per_route: usize,

    /// Maximum concurrent connections across all routes
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Default socket read timeout
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Timeout for establishing a TCP connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for leasing a connection from the pool
    #[serde(default = "default_connection_request_timeout_ms")]
    pub connection_request_timeout_ms: u64,

    /// Per-request socket read timeout
    #[serde(default = "default_request_socket_timeout_ms")]
    pub request_socket_timeout_ms: u64,

    /// Maximum attempts per logical request, including the first
    #[serde(default = "default_max_execution_count")]
    pub max_execution_count: u32,
}

fn default_max_per_route() -> usize {
    25
}

fn default_max_total() -> usize {
    50
}

fn default_socket_timeout_ms() -> u64 {
    50_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_connection_request_timeout_ms() -> u64 {
    5_000
}

fn default_request_socket_timeout_ms() -> u64 {
    50_000
}

fn default_max_execution_count() -> u32 {
    100
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            max_per_route: default_max_per_route(),
            max_total: default_max_total(),
            socket_timeout_ms: default_socket_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connection_request_timeout_ms: default_connection_request_timeout_ms(),
            request_socket_timeout_ms: default_request_socket_timeout_ms(),
            max_execution_count: default_max_execution_count(),
        }
    }
}

impl ConnectionConfiguration {
    /// Check the invariants the pool and retry policy rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_per_route == 0 {
            return Err(ConfigError::Zero("max_per_route"));
        }
        if self.max_total == 0 {
            return Err(ConfigError::Zero("max_total"));
        }
        if self.max_total < self.max_per_route {
            return Err(ConfigError::TotalBelowPerRoute {
                max_total: self.max_total,
                max_per_route: self.max_per_route,
            });
        }
        if self.max_execution_count == 0 {
            return Err(ConfigError::Zero("max_execution_count"));
        }
        Ok(())
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        millis(self.socket_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn connection_request_timeout(&self) -> Option<Duration> {
        millis(self.connection_request_timeout_ms)
    }

    pub fn request_socket_timeout(&self) -> Option<Duration> {
        millis(self.request_socket_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Per-request defaults shared by every client of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestConfig {
    /// Send `Expect: 100-continue` on requests with a body
    pub expect_continue: bool,

    /// TCP connect timeout
    pub connect_timeout: Option<Duration>,

    /// Maximum wait for a pooled connection
    pub connection_request_timeout: Option<Duration>,

    /// Socket read timeout while waiting for the response
    pub socket_timeout: Option<Duration>,
}

impl RequestConfig {
    pub fn from_configuration(config: &ConnectionConfiguration) -> Self {
        Self {
            expect_continue: true,
            connect_timeout: config.connect_timeout(),
            connection_request_timeout: config.connection_request_timeout(),
            socket_timeout: config.request_socket_timeout(),
        }
    }
}
