//! Opening transport connections: DNS, TCP, TLS 1.2 and the HTTP/1.1 handshake

use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper_tls::MaybeHttpsStream;
use hyper_util::rt::TokioIo;
use native_tls::Protocol;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_native_tls::TlsConnector;
use tracing::{debug, warn};

use super::route::Route;
use crate::error::{TransportError, TransportErrorKind};

/// Request sender of an HTTP/1.1 connection
pub type Sender = http1::SendRequest<Full<Bytes>>;

/// Socket defaults applied to every connection the pool opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketConfig {
    /// Read timeout used where no per-request timeout applies
    pub so_timeout: Option<Duration>,

    /// TCP keep-alive probing
    pub so_keepalive: bool,

    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            so_timeout: None,
            so_keepalive: false,
            tcp_nodelay: true,
        }
    }
}

/// Opens connections for the pool
///
/// TLS is restricted to protocol version 1.2. Certificates are verified
/// against the platform trust store with standard hostname matching,
/// including wildcard certificates.
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
}

impl Connector {
    pub fn new() -> Result<Self, native_tls::Error> {
        let tls = native_tls::TlsConnector::builder()
            .min_protocol_version(Some(Protocol::Tlsv12))
            .max_protocol_version(Some(Protocol::Tlsv12))
            .build()?;
        Ok(Self { tls: tls.into() })
    }

    /// Open a new HTTP/1.1 connection to `route`
    pub async fn connect(
        &self,
        route: &Route,
        connect_timeout: Option<Duration>,
        socket: &SocketConfig,
    ) -> Result<Sender, TransportError> {
        let addrs = resolve(route).await?;
        let tcp = connect_any(route, &addrs, connect_timeout).await?;

        tcp.set_nodelay(socket.tcp_nodelay)
            .map_err(|e| TransportError::from_io(route, e))?;
        socket2::SockRef::from(&tcp)
            .set_keepalive(socket.so_keepalive)
            .map_err(|e| TransportError::from_io(route, e))?;

        let io = TokioIo::new(tcp);
        let stream: MaybeHttpsStream<TokioIo<TcpStream>> = if route.is_secure() {
            let handshake = self.tls.connect(route.host(), TokioIo::new(io));
            let tls = with_timeout(socket.so_timeout, handshake)
                .await
                .map_err(|_| {
                    TransportError::new(TransportErrorKind::SocketTimeout, route, "TLS handshake timed out")
                })?
                .map_err(|e| {
                    TransportError::new(TransportErrorKind::SecureChannel, route, e.to_string())
                        .with_source(e)
                })?;
            tls.into()
        } else {
            io.into()
        };

        let (sender, conn) = http1::handshake(stream)
            .await
            .map_err(|e| TransportError::from_hyper(route, e))?;

        // Connection driver task
        let route_name = route.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(route = %route_name, error = %e, "HTTP connection error");
            }
        });

        Ok(sender)
    }
}

async fn resolve(route: &Route) -> Result<Vec<SocketAddr>, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((route.host(), route.port()))
        .await
        .map_err(|e| {
            TransportError::new(TransportErrorKind::UnknownHost, route, e.to_string()).with_source(e)
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::new(
            TransportErrorKind::UnknownHost,
            route,
            "no addresses resolved",
        ));
    }
    Ok(addrs)
}

async fn connect_any(
    route: &Route,
    addrs: &[SocketAddr],
    connect_timeout: Option<Duration>,
) -> Result<TcpStream, TransportError> {
    let mut last_err = None;

    for addr in addrs {
        debug!(route = %route, addr = %addr, "Connecting");
        match with_timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                let kind = if e.kind() == io::ErrorKind::TimedOut {
                    TransportErrorKind::ConnectTimeout
                } else {
                    TransportErrorKind::Io
                };
                last_err = Some(
                    TransportError::new(kind, route, format!("connect to {} failed: {}", addr, e))
                        .with_source(e),
                );
            }
            Err(_) => {
                last_err = Some(TransportError::new(
                    TransportErrorKind::ConnectTimeout,
                    route,
                    format!("connect to {} timed out", addr),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        TransportError::new(TransportErrorKind::UnknownHost, route, "no addresses resolved")
    }))
}

/// Await `fut`, bounded by `limit` when one is set
pub(crate) async fn with_timeout<F: std::future::Future>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}
