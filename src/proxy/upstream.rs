use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::proxy::cache::CacheEntry;

/// A request as re-issued to the origin. `uri` is always absolute.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A complete origin response with its body fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Nothing usable came back: resolution, connect, TLS, request write or response head.
    #[error("upstream transport failure: {0:#}")]
    Transport(anyhow::Error),
    /// The head arrived but the body could not be read in full.
    #[error("upstream body failure: {0:#}")]
    Body(anyhow::Error),
}

impl UpstreamError {
    /// Status of the entry synthesized for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Transport(_) => StatusCode::BAD_REQUEST,
            UpstreamError::Body(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Transport(_) => "transport",
            UpstreamError::Body(_) => "body",
        }
    }
}

/// Performs one HTTP round-trip to an origin. Implementations do not retry.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn dispatch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Outcome of [`fetch_entry`]: always an entry, plus the failure that produced it if any.
pub struct FetchOutcome {
    pub entry: CacheEntry,
    pub error: Option<UpstreamError>,
}

/// Dispatches `request` and turns the result into a cacheable entry. Failures become bodiless
/// entries carrying the status from [`UpstreamError::status`].
pub async fn fetch_entry(upstream: &dyn Upstream, request: UpstreamRequest) -> FetchOutcome {
    let uri = request.uri.clone();
    match upstream.dispatch(request).await {
        Ok(response) => FetchOutcome {
            entry: CacheEntry::new(response.status, response.headers, response.body),
            error: None,
        },
        Err(err) => {
            debug!(uri = %uri, kind = err.kind(), error = %err, "upstream request failed");
            crate::metrics::record_upstream_error(err.kind());
            FetchOutcome {
                entry: CacheEntry::failure(err.status()),
                error: Some(err),
            }
        }
    }
}

/// Resolves `host:port`, bounded by `resolve_timeout`.
pub async fn resolve_host(
    host: &str,
    port: u16,
    resolve_timeout: Duration,
) -> anyhow::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = timeout(resolve_timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| anyhow!("timed out resolving {host}:{port}"))?
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .collect();
    if addrs.is_empty() {
        return Err(anyhow!("no addresses found for {host}:{port}"));
    }
    Ok(addrs)
}

/// Attempt each address in turn, returning the first stream that connects.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> anyhow::Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}
