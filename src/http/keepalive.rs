//! Keep-alive duration negotiation from response headers

use hyper::header::HeaderMap;
use std::time::Duration;

/// Idle lifetime used when the server does not advertise one
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

const KEEP_ALIVE: &str = "keep-alive";

/// Derives how long an idle connection may be kept for reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveStrategy {
    default: Duration,
}

impl Default for KeepAliveStrategy {
    fn default() -> Self {
        Self {
            default: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl KeepAliveStrategy {
    pub fn with_default(default: Duration) -> Self {
        Self { default }
    }

    /// Honor the `timeout` element of the `Keep-Alive` header
    ///
    /// The first element that parses wins; otherwise the default applies.
    pub fn keep_alive_duration(&self, headers: &HeaderMap) -> Duration {
        headers
            .get_all(KEEP_ALIVE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(timeout_secs)
            .find_map(|secs| secs.checked_mul(1000))
            .map(Duration::from_millis)
            .unwrap_or(self.default)
    }
}

/// Seconds from a `timeout=<n>` header element
fn timeout_secs(element: &str) -> Option<u64> {
    // Parameters after ';' belong to the element, not its value
    let name_value = element.split(';').next()?;
    let (name, value) = name_value.split_once('=')?;
    if !name.trim().eq_ignore_ascii_case("timeout") {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    value.parse().ok()
}
