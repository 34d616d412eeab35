use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::time::Instant;

/// A stored response. The expiry is stamped by [`super::ResponseCache::set`]; an entry built
/// outside the cache starts out already expired.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            expires_at: Instant::now(),
        }
    }

    /// Entry standing in for a failed upstream exchange: no headers, no body.
    pub fn failure(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub(super) fn stamp_expiry(&mut self, expires_at: Instant) {
        self.expires_at = expires_at;
    }
}
