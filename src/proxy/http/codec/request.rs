use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::Http1HeaderAccumulator;
use super::line::{read_line_with_deadline, read_raw_line_with_deadline};

/// Everything read off the wire before the request body.
pub(crate) struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Http1HeaderAccumulator,
    pub head_bytes: usize,
}

impl Http1RequestHead {
    /// Whether the client asked for the connection to stay open after this exchange.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_connection_token("close") {
            return false;
        }
        match self.version {
            Version::HTTP_10 => self.headers.has_connection_token("keep-alive"),
            _ => true,
        }
    }
}

/// Waits up to `idle_timeout` for the next request to start, then reads its request line and
/// header section within `header_timeout`. `Ok(None)` means the client went away (or stayed
/// idle) between requests.
pub(crate) async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max header size must be greater than zero"
    );
    match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok([])) => return Ok(None),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => {
            debug!(peer = %peer, "client connection idle; closing");
            return Ok(None);
        }
    }

    let deadline = Instant::now() + header_timeout;
    let mut line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut line, deadline, peer, max_header_bytes)
            .await
            .with_context(|| format!("reading request line from {peer}"))?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    let (method, target, version) = parse_request_line(line.trim_end_matches(['\r', '\n']))?;

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let mut headers = Http1HeaderAccumulator::new(remaining);
    let mut raw = Vec::new();
    loop {
        let read = read_raw_line_with_deadline(reader, &mut raw, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed while reading headers from {peer}");
        }
        if !headers
            .push_line(&raw)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    let head_bytes = request_line_bytes + headers.total_bytes();
    Ok(Some(Http1RequestHead {
        method,
        target,
        version,
        headers,
        head_bytes,
    }))
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    ensure!(!line.is_empty(), "empty request line");
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    Ok((method, target.to_string(), version))
}
