//! Type-safe identifiers for feeds, connections and subscriptions.
//!
//! | Type | Backing | Purpose |
//! |------|---------|---------|
//! | [`StreamIdentity`] | base URL + sorted params | Pool cache key, endpoint derivation |
//! | [`ConnectionId`] | process-wide counter | Distinguishes successive connections of one identity |
//! | [`SubscriptionId`] | UUID v4 | Names one consumer subscription |

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Path segment of the push endpoint.
const STREAM_SEGMENT: &str = "stream";

/// Path segment of the request/response endpoint.
const SEND_SEGMENT: &str = "send";

// ============================================================================
// StreamIdentity
// ============================================================================

/// Identity of one push feed: endpoint base URL plus query options.
///
/// Two identities are equal when they resolve to the same stream URL, so
/// parameter order and a trailing slash on the base do not matter.
///
/// # Example
///
/// ```
/// use intel_feed::StreamIdentity;
///
/// let identity = StreamIdentity::new("https://intel.example.org/api/v1")?
///     .with_param("ward", "ward-12")
///     .with_param("capabilities", "analysis");
///
/// assert_eq!(
///     identity.stream_url().as_str(),
///     "https://intel.example.org/api/v1/stream?capabilities=analysis&ward=ward-12"
/// );
/// assert_eq!(identity.send_url().as_str(), "https://intel.example.org/api/v1/send");
/// # Ok::<(), intel_feed::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    /// Base URL without query or fragment, no trailing slash.
    base: Url,
    /// Query options, sorted by key.
    params: BTreeMap<String, String>,
}

impl StreamIdentity {
    /// Parses a base URL into an identity.
    ///
    /// Query parameters already present on `base` become identity options.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `base` does not parse
    /// - [`Error::Config`] if the scheme is not `http`, `https`, `ws` or `wss`
    pub fn new(base: &str) -> Result<Self> {
        let mut url = Url::parse(base)?;

        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported feed scheme '{}' in {base}",
                url.scheme()
            )));
        }
        if url.cannot_be_a_base() {
            return Err(Error::config(format!("Feed URL cannot be a base: {base}")));
        }

        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.set_query(None);
        url.set_fragment(None);

        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);

        Ok(Self { base: url, params })
    }

    /// Adds or replaces a query option.
    #[inline]
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns the normalized base URL.
    #[inline]
    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Returns all query options.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Returns one query option.
    #[inline]
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns `true` for `ws://` and `wss://` feeds.
    #[inline]
    #[must_use]
    pub fn is_websocket(&self) -> bool {
        matches!(self.base.scheme(), "ws" | "wss")
    }

    /// Push endpoint: `<base>/stream?<params>`.
    #[must_use]
    pub fn stream_url(&self) -> Url {
        let mut url = self.endpoint(STREAM_SEGMENT);
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }
        url
    }

    /// Sibling request/response endpoint: `<base>/send`.
    ///
    /// WebSocket bases map to their HTTP equivalent.
    #[must_use]
    pub fn send_url(&self) -> Url {
        let mut url = self.endpoint(SEND_SEGMENT);
        let http_scheme = match url.scheme() {
            "ws" => Some("http"),
            "wss" => Some("https"),
            _ => None,
        };
        if let Some(scheme) = http_scheme {
            // ws/wss -> http/https is always a permitted special-scheme swap.
            let _ = url.set_scheme(scheme);
        }
        url
    }

    fn endpoint(&self, segment: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(segment);
        }
        url
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stream_url())
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Counter backing [`ConnectionId::next`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one pooled connection.
///
/// A new id is issued whenever the pool creates a connection, so a
/// replacement for the same [`StreamIdentity`] never compares equal to the
/// connection it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Issues the next process-unique id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Unique identifier of one stream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generates a random subscription id.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_without_params() {
        let identity = StreamIdentity::new("http://localhost:8000/api").unwrap();
        assert_eq!(
            identity.stream_url().as_str(),
            "http://localhost:8000/api/stream"
        );
    }

    #[test]
    fn test_stream_url_root_base() {
        let identity = StreamIdentity::new("http://localhost:8000").unwrap();
        assert_eq!(identity.stream_url().as_str(), "http://localhost:8000/stream");
        assert_eq!(identity.send_url().as_str(), "http://localhost:8000/send");
    }

    #[test]
    fn test_param_order_does_not_matter() {
        let a = StreamIdentity::new("http://localhost/api")
            .unwrap()
            .with_param("ward", "7")
            .with_param("session", "abc");
        let b = StreamIdentity::new("http://localhost/api/")
            .unwrap()
            .with_param("session", "abc")
            .with_param("ward", "7");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_query_on_base_becomes_params() {
        let identity = StreamIdentity::new("http://localhost/api?ward=3&session=s1").unwrap();
        assert_eq!(identity.param("ward"), Some("3"));
        assert_eq!(identity.param("session"), Some("s1"));
        assert_eq!(identity.send_url().as_str(), "http://localhost/api/send");
    }

    #[test]
    fn test_params_are_encoded() {
        let identity = StreamIdentity::new("http://localhost/api")
            .unwrap()
            .with_param("ward", "North & East");
        assert_eq!(
            identity.stream_url().as_str(),
            "http://localhost/api/stream?ward=North+%26+East"
        );
    }

    #[test]
    fn test_websocket_send_url_uses_http() {
        let identity = StreamIdentity::new("wss://feed.example.org/live").unwrap();
        assert!(identity.is_websocket());
        assert_eq!(identity.send_url().as_str(), "https://feed.example.org/live/send");
        assert_eq!(
            identity.stream_url().as_str(),
            "wss://feed.example.org/live/stream"
        );
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let err = StreamIdentity::new("ftp://example.org/feed").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = StreamIdentity::new("not a url").unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }
}
