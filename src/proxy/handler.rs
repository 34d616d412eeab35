use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::debug;

use crate::util::reason_phrase;

use super::cache::{CacheEntry, CacheKey, ResponseCache};
use super::request::absolute_uri;
use super::upstream::{Upstream, UpstreamRequest, fetch_entry};

const USAGE_ERROR_BODY: &str = "request target must be an absolute URI\n";

/// An inbound request as seen by the cache layer.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Request target exactly as it appeared on the request line.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Bypass,
}

impl CacheLookup {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Bypass => "bypass",
        }
    }
}

/// What gets written back to the client.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundResponse {
    /// Translates a stored entry. Error statuses get the standardized plain-text body instead
    /// of whatever the origin sent.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        if entry.status.as_u16() >= 400 {
            return Self::error(entry.status);
        }
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
        }
    }

    pub fn error(status: StatusCode) -> Self {
        Self::plain_text(status, format!("{}\n", reason_phrase(status)))
    }

    fn plain_text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

#[derive(Debug)]
pub struct HandlerOutcome {
    pub response: OutboundResponse,
    pub cache_lookup: CacheLookup,
    /// Set when the response was synthesized from a failed upstream exchange in this call.
    pub upstream_error: Option<String>,
}

/// Chooses between serving from the cache and going upstream, and keeps the cache populated.
pub struct ProxyHandler {
    cache: Arc<ResponseCache>,
    upstream: Arc<dyn Upstream>,
}

impl ProxyHandler {
    pub fn new(cache: Arc<ResponseCache>, upstream: Arc<dyn Upstream>) -> Self {
        Self { cache, upstream }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub async fn handle(&self, request: ProxyRequest) -> HandlerOutcome {
        let Some(uri) = absolute_uri(&request.target) else {
            debug!(target = %request.target, "rejecting non-absolute request target");
            return HandlerOutcome {
                response: OutboundResponse::plain_text(StatusCode::BAD_REQUEST, USAGE_ERROR_BODY),
                cache_lookup: CacheLookup::Bypass,
                upstream_error: None,
            };
        };

        if request.method != Method::GET {
            let outcome = fetch_entry(
                self.upstream.as_ref(),
                UpstreamRequest {
                    method: request.method,
                    uri,
                    headers: request.headers,
                    body: request.body,
                },
            )
            .await;
            return HandlerOutcome {
                response: OutboundResponse::from_entry(&outcome.entry),
                cache_lookup: CacheLookup::Bypass,
                upstream_error: outcome.error.map(|err| err.to_string()),
            };
        }

        let key = CacheKey::from_request(&request.target, &request.headers);
        if let Some(entry) = self.cache.get(&key) {
            debug!(key = %key, status = %entry.status, "cache hit");
            crate::metrics::record_cache_lookup(CacheLookup::Hit.as_str());
            return HandlerOutcome {
                response: OutboundResponse::from_entry(&entry),
                cache_lookup: CacheLookup::Hit,
                upstream_error: None,
            };
        }
        debug!(key = %key, "cache miss");
        crate::metrics::record_cache_lookup(CacheLookup::Miss.as_str());

        let outcome = fetch_entry(
            self.upstream.as_ref(),
            UpstreamRequest {
                method: request.method,
                uri,
                headers: request.headers,
                body: request.body,
            },
        )
        .await;
        let response = OutboundResponse::from_entry(&outcome.entry);
        self.cache.set(key, outcome.entry);
        crate::metrics::record_cache_store();

        HandlerOutcome {
            response,
            cache_lookup: CacheLookup::Miss,
            upstream_error: outcome.error.map(|err| err.to_string()),
        }
    }
}
