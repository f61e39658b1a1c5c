//! Local HTTP/1.1 server for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use objconn::ConnectionConfiguration;

pub struct TestServer {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests received so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections accepted and not yet closed by either side
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// Serve every request with `handler`, which gets the 0-based request index
pub async fn spawn_server<F, Fut>(handler: F) -> TestServer
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));
    let open = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    {
        let requests = Arc::clone(&requests);
        let connections = Arc::clone(&connections);
        let open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                open.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&requests);
                let handler = Arc::clone(&handler);
                let open = Arc::clone(&open);

                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let n = requests.fetch_add(1, Ordering::SeqCst);
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, Infallible>(handler(n).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                    open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
    }

    TestServer {
        addr,
        requests,
        connections,
        open,
    }
}

/// Accept connections, read the request up to `terminator`, then hang up
/// without answering
pub async fn spawn_hangup_server(terminator: &'static [u8]) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));

    {
        let requests = Arc::clone(&requests);
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let mut received = Vec::new();
                let mut buf = [0u8; 4096];
                // Drain the whole request so closing sends FIN rather than RST
                while !received.ends_with(terminator) {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                if received.ends_with(terminator) {
                    requests.fetch_add(1, Ordering::SeqCst);
                }
                drop(stream);
            }
        });
    }

    TestServer {
        addr,
        requests,
        connections,
        open: Arc::new(AtomicUsize::new(0)),
    }
}

/// Answer every request with a chunked body of `chunks` frames, pausing
/// `gap` before each one
pub async fn spawn_trickle_server(chunks: usize, gap: Duration) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));

    {
        let requests = Arc::clone(&requests);
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&requests);
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let mut buf = [0u8; 4096];
                    while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => received.extend_from_slice(&buf[..n]),
                        }
                    }
                    requests.fetch_add(1, Ordering::SeqCst);

                    let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
                    if stream.write_all(head).await.is_err() {
                        return;
                    }
                    for _ in 0..chunks {
                        tokio::time::sleep(gap).await;
                        if stream.write_all(b"5\r\nchunk\r\n").await.is_err() {
                            return;
                        }
                    }
                    let _ = stream.write_all(b"0\r\n\r\n").await;
                });
            }
        });
    }

    TestServer {
        addr,
        requests,
        connections,
        open: Arc::new(AtomicUsize::new(0)),
    }
}

/// Accept connections, read the request head, then reset the connection
///
/// `connections()` counts the attempts that reached the server.
pub async fn spawn_reset_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    {
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let mut received = Vec::new();
                let mut buf = [0u8; 4096];
                while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                // Zero linger turns the close into RST
                let _ = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO));
                drop(stream);
            }
        });
    }

    TestServer {
        addr,
        requests: Arc::new(AtomicUsize::new(0)),
        connections,
        open: Arc::new(AtomicUsize::new(0)),
    }
}

pub fn ok(body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .header("Keep-Alive", "timeout=5, max=100")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

pub async fn slow(delay: Duration) -> Response<Full<Bytes>> {
    tokio::time::sleep(delay).await;
    ok("late")
}

/// Configuration with short timeouts for local tests
pub fn test_configuration() -> ConnectionConfiguration {
    ConnectionConfiguration {
        max_per_route: 2,
        max_total: 4,
        socket_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        connection_request_timeout_ms: 1_000,
        request_socket_timeout_ms: 2_000,
        max_execution_count: 3,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
