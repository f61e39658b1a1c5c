//! Error types for pooled HTTP execution
//!
//! Transport failures are classified into a closed set of kinds so the
//! retry policy can decide with a plain `match`.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

use crate::config::ConfigError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Classification of a failed request attempt at the network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The server closed the connection without sending a response
    NoResponse,

    /// The route's host name could not be resolved
    UnknownHost,

    /// Connecting, or waiting for a pooled connection, timed out
    ConnectTimeout,

    /// Reading from an established connection timed out
    SocketTimeout,

    /// The I/O operation was interrupted
    Interrupted,

    /// TLS handshake or secure channel failure
    SecureChannel,

    /// Any other I/O failure
    Io,
}

impl TransportErrorKind {
    /// Failures where the request is assumed not to have been processed
    pub fn is_transient(self) -> bool {
        !matches!(self, TransportErrorKind::Io)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::NoResponse => "no response",
            TransportErrorKind::UnknownHost => "unknown host",
            TransportErrorKind::ConnectTimeout => "connect timeout",
            TransportErrorKind::SocketTimeout => "socket timeout",
            TransportErrorKind::Interrupted => "interrupted",
            TransportErrorKind::SecureChannel => "secure channel failure",
            TransportErrorKind::Io => "i/o error",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network-layer failure of a single request attempt
#[derive(Debug, Error)]
#[error("{kind} on {route}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    route: String,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, route: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            kind,
            route: route.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying error
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Classify an I/O error raised on an established connection
    pub fn from_io(route: impl fmt::Display, err: io::Error) -> Self {
        let kind = classify_io(&err);
        Self::new(kind, route, err.to_string()).with_source(err)
    }

    /// Classify an error returned by the hyper connection
    pub fn from_hyper(route: impl fmt::Display, err: hyper::Error) -> Self {
        let kind = if err.is_incomplete_message() || err.is_canceled() {
            TransportErrorKind::NoResponse
        } else if err.is_timeout() {
            TransportErrorKind::SocketTimeout
        } else {
            find_io_source(&err)
                .map(classify_io)
                .unwrap_or(TransportErrorKind::Io)
        };
        Self::new(kind, route, err.to_string()).with_source(err)
    }
}

fn classify_io(err: &io::Error) -> TransportErrorKind {
    match err.kind() {
        io::ErrorKind::TimedOut => TransportErrorKind::SocketTimeout,
        io::ErrorKind::Interrupted => TransportErrorKind::Interrupted,
        _ => TransportErrorKind::Io,
    }
}

fn find_io_source<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut cause = err.source();
    while let Some(e) = cause {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        cause = e.source();
    }
    None
}

/// Errors returned by a pooled client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Transport classification, if this is a network-layer failure
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            ClientError::Transport(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<hyper::http::Error> for ClientError {
    fn from(err: hyper::http::Error) -> Self {
        ClientError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
