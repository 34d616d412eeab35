use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use crate::io_util::{shutdown_with_timeout, write_all_with_timeout};
use crate::proxy::request::{ParsedRequest, Scheme};
use crate::proxy::upstream::{
    Upstream, UpstreamError, UpstreamRequest, UpstreamResponse, connect_to_addrs, resolve_host,
};

use super::body::{determine_response_body_plan, read_response_body};
use super::codec::{Http1ResponseHead, read_http1_response_head};

/// Limits on a single upstream exchange.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    /// Resolution, TCP connect and TLS handshake, each bounded separately.
    pub connect: Duration,
    /// Each read or write once connected.
    pub io: Duration,
}

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// HTTP/1.1 client that opens a fresh connection per request and asks the origin to close it.
pub struct Http1Upstream {
    tls: Arc<ClientConfig>,
    timeouts: UpstreamTimeouts,
    max_response_header_bytes: usize,
}

impl Http1Upstream {
    pub fn new(
        tls: Arc<ClientConfig>,
        timeouts: UpstreamTimeouts,
        max_response_header_bytes: usize,
    ) -> Self {
        Self {
            tls,
            timeouts,
            max_response_header_bytes,
        }
    }

    async fn connect(&self, request: &ParsedRequest) -> Result<(UpstreamIo, SocketAddr)> {
        let port = request.port_or_default();
        let addresses = resolve_host(&request.host, port, self.timeouts.connect).await?;
        let (tcp, peer) = connect_to_addrs(&addresses, self.timeouts.connect).await?;
        let stream = match request.scheme {
            Scheme::Http => UpstreamIo::Plain(tcp),
            Scheme::Https => {
                let server_name = ServerName::try_from(request.host.as_str())
                    .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", request.host))?
                    .to_owned();
                let connector = TlsConnector::from(self.tls.clone());
                let tls = timeout(self.timeouts.connect, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with upstream timed out"))?
                    .with_context(|| {
                        format!(
                            "failed to establish TLS with upstream {}:{}",
                            request.host, port
                        )
                    })?;
                UpstreamIo::Tls(Box::new(tls))
            }
        };
        Ok((stream, peer))
    }

    /// Sends the request and reads the final response head, skipping interim 1xx responses.
    async fn send_and_read_head(
        &self,
        stream: &mut BufReader<UpstreamIo>,
        peer: SocketAddr,
        head: &[u8],
        body: &[u8],
    ) -> Result<Http1ResponseHead> {
        write_all_with_timeout(
            stream.get_mut(),
            head,
            self.timeouts.io,
            "sending request headers to upstream",
        )
        .await?;
        if !body.is_empty() {
            write_all_with_timeout(
                stream.get_mut(),
                body,
                self.timeouts.io,
                "sending request body to upstream",
            )
            .await?;
        }

        loop {
            let response =
                read_http1_response_head(stream, self.timeouts.io, peer, self.max_response_header_bytes)
                    .await?;
            if response.status == StatusCode::SWITCHING_PROTOCOLS {
                bail!("upstream attempted a protocol switch");
            }
            if response.status.is_informational() {
                trace!(peer = %peer, status = %response.status, "skipping interim upstream response");
                continue;
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl Upstream for Http1Upstream {
    async fn dispatch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let parsed = ParsedRequest::from_absolute(request.method.clone(), &request.uri)
            .map_err(UpstreamError::Transport)?;
        let (io, peer) = self
            .connect(&parsed)
            .await
            .map_err(UpstreamError::Transport)?;
        let mut stream = BufReader::new(io);

        let head_bytes = build_upstream_request(&parsed, &request.headers, request.body.len());
        let head = self
            .send_and_read_head(&mut stream, peer, &head_bytes, &request.body)
            .await
            .map_err(UpstreamError::Transport)?;

        let plan = determine_response_body_plan(&parsed.method, &head);
        let body = read_response_body(&mut stream, plan, self.timeouts.io, peer)
            .await
            .map_err(UpstreamError::Body)?;
        debug!(
            peer = %peer,
            status = %head.status,
            version = ?head.version,
            body_bytes = body.len(),
            "upstream response received"
        );

        if let Err(err) = shutdown_with_timeout(stream.get_mut(), self.timeouts.io).await {
            trace!(peer = %peer, error = %err, "failed to shut down upstream connection");
        }

        Ok(UpstreamResponse {
            status: head.status,
            headers: head.headers,
            body,
        })
    }
}

fn is_managed_request_header(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "host"
            | "content-length"
            | "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "upgrade"
            | "expect"
    )
}

/// Origin-form request head. `Host`, framing and connection headers are always set here;
/// any caller-supplied copies are ignored.
pub(crate) fn build_upstream_request(
    request: &ParsedRequest,
    headers: &HeaderMap,
    body_len: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(request.path.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buffer.extend_from_slice(request.authority_host().as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if is_managed_request_header(name.as_str()) {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if body_len > 0 || matches!(request.method, Method::POST | Method::PUT | Method::PATCH) {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(body_len.to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}
