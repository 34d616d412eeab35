use std::fmt;

use http::HeaderMap;
use http::header::RANGE;

/// Identifies a cacheable GET: the request target exactly as received plus the literal `Range`
/// header value (empty when absent). Equality is exact on both parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    uri: String,
    range: Vec<u8>,
}

impl CacheKey {
    pub fn new(uri: impl Into<String>, range: impl Into<Vec<u8>>) -> Self {
        Self {
            uri: uri.into(),
            range: range.into(),
        }
    }

    pub fn from_request(target: &str, headers: &HeaderMap) -> Self {
        let range = headers
            .get(RANGE)
            .map(|value| value.as_bytes().to_vec())
            .unwrap_or_default();
        Self::new(target, range)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Raw `Range` bytes; obs-text is kept as received.
    pub fn range(&self) -> &[u8] {
        &self.range
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.range.is_empty() {
            write!(f, "{}", self.uri)
        } else {
            write!(
                f,
                "{} [range {}]",
                self.uri,
                String::from_utf8_lossy(&self.range)
            )
        }
    }
}
