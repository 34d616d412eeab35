use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::util::reason_phrase;

use super::headers::{
    connection_tokens, is_hop_by_hop_response_header, split_header_line, trim_line_ending,
};
use super::line::{read_line_with_deadline, read_raw_line_with_deadline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionOverride {
    Close,
    KeepAlive,
}

impl ConnectionOverride {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionOverride::Close => "close",
            ConnectionOverride::KeepAlive => "keep-alive",
        }
    }
}

#[derive(Debug)]
pub(crate) struct Http1ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Reads an upstream status line and header section. The whole head must arrive within
/// `timeout_dur` and fit in `max_header_bytes`.
pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let deadline = Instant::now() + timeout_dur;
    let mut consumed = 0usize;
    let mut line = String::new();

    let read = read_line_with_deadline(reader, &mut line, deadline, peer, max_header_bytes).await?;
    if read == 0 {
        bail!("upstream closed connection before sending status line");
    }
    consumed += read;
    let (version, status, _) = parse_http1_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut raw = Vec::new();

    loop {
        let remaining = max_header_bytes
            .checked_sub(consumed)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
        let read = read_raw_line_with_deadline(reader, &mut raw, deadline, peer, remaining)
            .await
            .with_context(|| format!("reading upstream response headers from {peer}"))?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        consumed += read;

        let trimmed = trim_line_ending(&raw);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = split_header_line(trimmed)
            .with_context(|| format!("invalid header from upstream {peer}"))?;

        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let text = String::from_utf8_lossy(value);
            let parsed: u64 = text
                .parse()
                .with_context(|| format!("invalid Content-Length value '{text}'"))?;
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            // Only a single `chunked` coding is decoded.
            if chunked {
                bail!("duplicate Transfer-Encoding header from upstream");
            }
            if !value.eq_ignore_ascii_case(b"chunked") {
                bail!(
                    "unsupported upstream Transfer-Encoding '{}'",
                    String::from_utf8_lossy(value)
                );
            }
            chunked = true;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(peer = %peer, header = name, "dropping malformed upstream header"),
        }
    }

    if chunked && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(Http1ResponseHead {
        status,
        version,
        headers,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };
    let code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| anyhow!("unsupported upstream status code '{code}'"))?;

    Ok((version, status, reason))
}

/// Serializes a client-facing HTTP/1.1 response head.
///
/// Hop-by-hop headers, anything named in the stored `Connection` header, and the stored framing
/// headers are dropped. `content_length` becomes the only framing header; `None` omits it.
pub(crate) fn encode_http1_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    content_length: Option<u64>,
    connection: Option<ConnectionOverride>,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(reason_phrase(status).as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let tokens = connection_tokens(headers);
    for (name, value) in headers {
        let lower = name.as_str();
        if is_hop_by_hop_response_header(lower)
            || matches!(lower, "content-length" | "transfer-encoding" | "trailer")
            || tokens.contains(lower)
        {
            continue;
        }
        buffer.extend_from_slice(canonical_header_name(lower).as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if let Some(length) = content_length {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(length.to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    if let Some(connection) = connection {
        buffer.extend_from_slice(b"Connection: ");
        buffer.extend_from_slice(connection.as_str().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// `content-type` -> `Content-Type`. `HeaderMap` stores names lowercased.
fn canonical_header_name(lower: &str) -> String {
    let mut out = String::with_capacity(lower.len());
    let mut upper_next = true;
    for ch in lower.chars() {
        if upper_next {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
        upper_next = ch == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle)
    }

    async fn read_head(response: &'static [u8]) -> Result<Http1ResponseHead> {
        let mut reader = BufReader::new(response);
        read_http1_response_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:80".parse().unwrap(),
            1024,
        )
        .await
    }

    #[test]
    fn encode_strips_hop_by_hop_and_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Foo, Upgrade"));
        headers.insert("foo", HeaderValue::from_static("bar"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("trailer", HeaderValue::from_static("X-Trailer"));
        headers.insert("content-length", HeaderValue::from_static("123"));
        headers.insert("x-test", HeaderValue::from_static("1"));
        headers.insert(
            "x-binary",
            HeaderValue::from_bytes(b"foo\xffbar").unwrap(),
        );

        let encoded = encode_http1_response_head(
            StatusCode::OK,
            &headers,
            Some(5),
            Some(ConnectionOverride::Close),
        );

        assert!(encoded.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(!contains_bytes(&encoded, b"Foo: bar"));
        assert!(!contains_bytes(&encoded, b"Upgrade:"));
        assert!(!contains_bytes(&encoded, b"Keep-Alive:"));
        assert!(!contains_bytes(&encoded, b"Transfer-Encoding:"));
        assert!(!contains_bytes(&encoded, b"Trailer:"));
        assert!(!contains_bytes(&encoded, b"Content-Length: 123"));
        assert!(contains_bytes(&encoded, b"Content-Length: 5\r\n"));
        assert!(contains_bytes(&encoded, b"X-Test: 1\r\n"));
        assert!(contains_bytes(&encoded, b"X-Binary: foo\xffbar\r\n"));
        assert!(contains_bytes(&encoded, b"Connection: close\r\n"));
        assert!(encoded.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn encode_keeps_repeated_headers_in_order() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let encoded =
            encode_http1_response_head(StatusCode::NOT_MODIFIED, &headers, None, None);
        let text = String::from_utf8(encoded).unwrap();
        let first = text.find("Set-Cookie: a=1").expect("first cookie");
        let second = text.find("Set-Cookie: b=2").expect("second cookie");
        assert!(first < second);
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(!text.contains("Connection"));
    }

    #[test]
    fn encode_uses_unknown_for_unregistered_status() {
        let status = StatusCode::from_u16(599).unwrap();
        let encoded = encode_http1_response_head(status, &HeaderMap::new(), Some(0), None);
        assert!(encoded.starts_with(b"HTTP/1.1 599 Unknown\r\n"));
    }

    #[test]
    fn parse_status_line_accepts_http10_and_http11() -> Result<()> {
        let (version, status, reason) = parse_http1_status_line("HTTP/1.1 404 Not Found")?;
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reason, "Not Found");

        let (version, status, reason) = parse_http1_status_line("HTTP/1.0 200")?;
        assert_eq!(version, Version::HTTP_10);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reason, "");
        Ok(())
    }

    #[test]
    fn parse_status_line_rejects_malformed_lines() {
        let err = parse_http1_status_line("BAD 200 OK").unwrap_err();
        assert!(
            err.to_string().contains("unsupported upstream HTTP version"),
            "unexpected error: {err:?}"
        );

        let err = parse_http1_status_line("HTTP/1.1").unwrap_err();
        assert!(
            err.to_string().contains("missing status code"),
            "unexpected error: {err:?}"
        );

        let err = parse_http1_status_line("HTTP/1.1 twohundred OK").unwrap_err();
        assert!(
            err.to_string().contains("invalid upstream status code"),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn read_head_collects_headers_and_framing() -> Result<()> {
        let head = read_head(
            b"HTTP/1.1 206 Partial Content\r\nContent-Length: 10\r\nContent-Range: bytes 0-9/100\r\nX-Multi: a\r\nX-Multi: b\r\n\r\n",
        )
        .await?;
        assert_eq!(head.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(head.content_length, Some(10));
        assert!(!head.chunked);
        assert_eq!(head.headers.get("content-range").unwrap(), "bytes 0-9/100");
        let multi: Vec<_> = head.headers.get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn read_head_accepts_plain_chunked() -> Result<()> {
        let head = read_head(b"HTTP/1.0 200 OK\r\nTransfer-Encoding: Chunked\r\n\r\n").await?;
        assert_eq!(head.version, Version::HTTP_10);
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
        Ok(())
    }

    #[tokio::test]
    async fn read_head_rejects_layered_transfer_coding() {
        let err = read_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
            .await
            .expect_err("gzip transfer coding cannot be passed through");
        assert!(
            err.to_string().contains("unsupported upstream Transfer-Encoding 'gzip, chunked'"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn read_head_keeps_obs_text_values() -> Result<()> {
        let head = read_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Disposition: attachment; filename=\"caf\xe9.txt\"\r\n\r\n",
        )
        .await?;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.content_length, Some(5));
        assert_eq!(
            head.headers.get("content-disposition").unwrap().as_bytes(),
            b"attachment; filename=\"caf\xe9.txt\""
        );
        Ok(())
    }

    #[tokio::test]
    async fn read_head_rejects_duplicate_content_length() {
        let err = read_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Length: 10\r\n\r\n")
            .await
            .expect_err("duplicate Content-Length should be rejected");
        assert!(
            err.to_string().contains("multiple Content-Length"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn read_head_rejects_transfer_encoding_with_content_length() {
        let err = read_head(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
        )
        .await
        .expect_err("Transfer-Encoding with Content-Length should be rejected");
        assert!(
            err.to_string()
                .contains("must not include both Transfer-Encoding and Content-Length"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn read_head_rejects_premature_close() {
        let err = read_head(b"HTTP/1.1 200 OK\r\nX-Partial: 1\r\n")
            .await
            .expect_err("truncated head should be rejected");
        assert!(
            err.to_string().contains("closed connection during headers"),
            "unexpected error: {err}"
        );
    }
}
