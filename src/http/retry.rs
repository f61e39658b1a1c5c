//! Retry decisions for failed request attempts

use bytes::Bytes;
use hyper::{Method, Request};
use tracing::debug;

use crate::error::TransportErrorKind;

/// Decides whether a failed request attempt should be repeated
///
/// Stateless apart from the attempt ceiling, so a single value can be
/// shared by any number of concurrent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_execution_count: u32,
}

impl RetryPolicy {
    /// `max_execution_count` bounds the attempts per request, the first included
    pub fn new(max_execution_count: u32) -> Self {
        Self { max_execution_count }
    }

    pub fn max_execution_count(&self) -> u32 {
        self.max_execution_count
    }

    /// Decide whether to retry after attempt number `execution_count` failed
    ///
    /// Rules, first match wins:
    /// 1. at or past the attempt ceiling: stop
    /// 2. transient network failure: retry
    /// 3. otherwise retry only requests without a body
    pub fn retry_request(&self, kind: TransportErrorKind, execution_count: u32, idempotent: bool) -> bool {
        if execution_count >= self.max_execution_count {
            debug!(
                execution_count,
                max = self.max_execution_count,
                error = %kind,
                "Execution count reached the limit, not retrying"
            );
            return false;
        }

        match kind {
            TransportErrorKind::NoResponse
            | TransportErrorKind::UnknownHost
            | TransportErrorKind::ConnectTimeout
            | TransportErrorKind::SocketTimeout
            | TransportErrorKind::Interrupted
            | TransportErrorKind::SecureChannel => {
                debug!(execution_count, error = %kind, "Transient failure, retrying");
                true
            }
            TransportErrorKind::Io if idempotent => {
                debug!(execution_count, error = %kind, "Request has no body, retrying");
                true
            }
            TransportErrorKind::Io => {
                debug!(execution_count, error = %kind, "Request encloses a body, not retrying");
                false
            }
        }
    }
}

/// Whether a request is safe to repeat after an arbitrary I/O failure
///
/// Requests that enclose an entity (POST, PUT, PATCH, or any request with a
/// non-empty body) are treated as non-idempotent. This also rules out
/// body-bearing PUTs that would be safe to repeat.
pub fn is_idempotent(request: &Request<Bytes>) -> bool {
    let encloses_entity = matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
    !encloses_entity && request.body().is_empty()
}
