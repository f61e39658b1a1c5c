//! Pooled HTTP client handle
//!
//! Each logical request runs up to `max_execution_count` attempts:
//! - lease a connection from the shared pool
//! - send the request and read the full response; the socket timeout bounds
//!   each wait for the response head or the next body frame
//! - on success negotiate keep-alive and return the connection to the pool
//! - on a transport failure discard the connection and consult the retry policy

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, EXPECT, HOST};
use hyper::{Method, Request, Response, Uri};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use super::keepalive::KeepAliveStrategy;
use super::retry::{is_idempotent, RetryPolicy};
use crate::config::RequestConfig;
use crate::error::{ClientError, Result, TransportError, TransportErrorKind};
use crate::pool::{ConnectionPool, Connector, Route};

/// HTTP client bound to a connection manager's pool
///
/// Clone is cheap. The pool is owned by the manager; once the manager is
/// dropped requests fail with [`ClientError::PoolClosed`].
#[derive(Clone)]
pub struct PooledClient {
    pool: Weak<ConnectionPool>,
    request_config: Arc<RequestConfig>,
    retry_policy: RetryPolicy,
    keep_alive: KeepAliveStrategy,
    connector: Connector,
}

impl PooledClient {
    pub(crate) fn new(
        pool: Weak<ConnectionPool>,
        request_config: Arc<RequestConfig>,
        retry_policy: RetryPolicy,
        keep_alive: KeepAliveStrategy,
        connector: Connector,
    ) -> Self {
        Self {
            pool,
            request_config,
            retry_policy,
            keep_alive,
            connector,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.request_config
    }

    /// The shared pool, while its manager is alive
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.upgrade()
    }

    /// Execute a request, retrying failed attempts per the retry policy
    ///
    /// The URI must be absolute. Returns the last attempt's error once the
    /// policy stops retrying.
    pub async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let pool = self.pool.upgrade().ok_or(ClientError::PoolClosed)?;
        let route = Route::from_uri(request.uri())?;
        let idempotent = is_idempotent(&request);

        let mut execution_count = 0;
        loop {
            execution_count += 1;
            let attempt = self.prepare(&request, &route)?;

            match self.execute_once(&pool, &route, attempt).await {
                Ok(response) => {
                    if execution_count > 1 {
                        debug!(route = %route, execution_count, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(ClientError::Transport(err)) => {
                    if self.retry_policy.retry_request(err.kind(), execution_count, idempotent) {
                        debug!(
                            route = %route,
                            execution_count,
                            error = %err,
                            "Retrying request"
                        );
                        continue;
                    }
                    warn!(
                        route = %route,
                        method = %request.method(),
                        execution_count,
                        error = %err,
                        "Request failed"
                    );
                    return Err(err.into());
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn execute_once(
        &self,
        pool: &Arc<ConnectionPool>,
        route: &Route,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>> {
        let mut conn = pool.lease(route, &self.connector, &self.request_config).await?;
        let read_timeout = self
            .request_config
            .socket_timeout
            .or(pool.config().socket.so_timeout);

        let response = with_read_timeout(route, read_timeout, conn.send_request(request)).await??;
        let (parts, body) = response.into_parts();
        let body = read_body(route, read_timeout, body).await?;

        if wants_close(&parts.headers) {
            debug!(route = %route, "Server requested close");
            drop(conn);
        } else {
            conn.release(self.keep_alive.keep_alive_duration(&parts.headers));
        }

        Ok(Response::from_parts(parts, body))
    }

    /// Build one attempt's wire request: origin-form URI, `Host`, `Expect`
    fn prepare(&self, request: &Request<Bytes>, route: &Route) -> Result<Request<Full<Bytes>>> {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder()
            .method(request.method().clone())
            .uri(path)
            .version(request.version());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
            if !headers.contains_key(HOST) {
                let host = HeaderValue::from_str(&route.authority())
                    .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
                headers.insert(HOST, host);
            }
            if self.request_config.expect_continue && !request.body().is_empty() {
                headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
            }
        }

        Ok(builder.body(Full::new(request.body().clone()))?)
    }

    /// Issue a request built from its parts
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ClientError::InvalidRequest(e.to_string()))?;
        let mut request = Request::builder().method(method).uri(uri).body(body)?;
        *request.headers_mut() = headers;
        self.execute(request).await
    }

    pub async fn get(&self, url: &str) -> Result<Response<Bytes>> {
        self.send(Method::GET, url, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn head(&self, url: &str) -> Result<Response<Bytes>> {
        self.send(Method::HEAD, url, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response<Bytes>> {
        self.send(Method::DELETE, url, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn put(&self, url: &str, body: Bytes) -> Result<Response<Bytes>> {
        self.send(Method::PUT, url, HeaderMap::new(), body).await
    }

    pub async fn post(&self, url: &str, body: Bytes) -> Result<Response<Bytes>> {
        self.send(Method::POST, url, HeaderMap::new(), body).await
    }
}

async fn with_read_timeout<F: std::future::Future>(
    route: &Route,
    limit: Option<Duration>,
    fut: F,
) -> std::result::Result<F::Output, TransportError> {
    crate::pool::with_timeout(limit, fut).await.map_err(|_| {
        TransportError::new(TransportErrorKind::SocketTimeout, route, "read timed out")
    })
}

/// Read a response body, allowing at most `limit` between frames
///
/// The limit bounds each wait for data, not the whole transfer, so a large
/// body that keeps arriving is never cut off.
async fn read_body(
    route: &Route,
    limit: Option<Duration>,
    mut body: Incoming,
) -> std::result::Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = with_read_timeout(route, limit, body.frame()).await? {
        let frame = frame.map_err(|e| TransportError::from_hyper(route, e))?;
        if let Some(data) = frame.data_ref() {
            buf.extend_from_slice(data);
        }
    }
    Ok(buf.freeze())
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfiguration;
    use crate::manager::ConnectionManager;

    fn client() -> (ConnectionManager, PooledClient) {
        let manager = ConnectionManager::new(ConnectionConfiguration::default()).unwrap();
        let client = manager.create_client().unwrap();
        (manager, client)
    }

    #[test]
    fn test_wants_close() {
        let mut headers = HeaderMap::new();
        assert!(!wants_close(&headers));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!wants_close(&headers));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade, Close"));
        assert!(wants_close(&headers));
    }

    #[test]
    fn test_prepare_origin_form_and_host() {
        let (_manager, client) = client();
        let request = Request::get("http://s3.example.com:9000/bucket/key?versionId=3")
            .body(Bytes::new())
            .unwrap();
        let route = Route::from_uri(request.uri()).unwrap();

        let prepared = client.prepare(&request, &route).unwrap();
        assert_eq!(prepared.uri(), "/bucket/key?versionId=3");
        assert_eq!(prepared.headers()[HOST], "s3.example.com:9000");
        assert!(prepared.headers().get(EXPECT).is_none());
    }

    #[test]
    fn test_prepare_expect_continue_for_body() {
        let (_manager, client) = client();
        let request = Request::put("https://s3.example.com/bucket/key")
            .header(HOST, "bucket.s3.example.com")
            .body(Bytes::from_static(b"payload"))
            .unwrap();
        let route = Route::from_uri(request.uri()).unwrap();

        let prepared = client.prepare(&request, &route).unwrap();
        assert_eq!(prepared.headers()[HOST], "bucket.s3.example.com");
        assert_eq!(prepared.headers()[EXPECT], "100-continue");
    }

    #[tokio::test]
    async fn test_relative_url_rejected() {
        let (_manager, client) = client();
        let err = client.get("/bucket/key").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_dropped_manager_closes_client() {
        let (manager, client) = client();
        drop(manager);
        assert!(client.pool().is_none());
        let err = client.get("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, ClientError::PoolClosed));
    }
}
