use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderDisposition {
    Connection,
    Host,
    ContentLength,
    TransferEncoding,
    Expect,
    Skip,
    Forward,
}

fn classify_request_header(lower_name: &str) -> HeaderDisposition {
    match lower_name {
        "connection" => HeaderDisposition::Connection,
        "host" => HeaderDisposition::Host,
        "content-length" => HeaderDisposition::ContentLength,
        "transfer-encoding" => HeaderDisposition::TransferEncoding,
        "expect" => HeaderDisposition::Expect,
        "keep-alive" | "upgrade" | "te" | "trailer" => HeaderDisposition::Skip,
        name if name.starts_with("proxy-") => HeaderDisposition::Skip,
        _ => HeaderDisposition::Forward,
    }
}

/// True for hop-by-hop headers that never travel from an upstream response to the client.
pub(crate) fn is_hop_by_hop_response_header(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "connection" | "keep-alive" | "proxy-connection" | "proxy-authenticate" | "upgrade" | "te"
    )
}

pub(crate) fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for value in headers.get_all(http::header::CONNECTION) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                tokens.insert(token.to_ascii_lowercase());
            }
        }
    }
    tokens
}

#[derive(Debug, Clone)]
pub(crate) struct Http1HeaderLine {
    pub name: String,
    pub value: Vec<u8>,
    lower_name: String,
}

impl Http1HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Collects an inbound request's header section, enforcing the size budget and recording the
/// framing and connection-management headers separately from the end-to-end ones.
#[derive(Debug)]
pub(crate) struct Http1HeaderAccumulator {
    max_bytes: usize,
    consumed: usize,
    headers: Vec<Http1HeaderLine>,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
    expect_continue: bool,
    connection_tokens: HashSet<String>,
}

impl Http1HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            headers: Vec::new(),
            host: None,
            content_length: None,
            chunked: false,
            expect_continue: false,
            connection_tokens: HashSet::new(),
        }
    }

    /// Records one raw header line. Returns `false` once the blank line ending the section has
    /// been seen. Values are kept byte for byte; only the framing and connection-management
    /// headers must be text.
    pub fn push_line(&mut self, line: &[u8]) -> Result<bool> {
        self.reserve(line.len())?;
        let trimmed = trim_line_ending(line);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, raw_value) = split_header_line(trimmed)?;
        let line = Http1HeaderLine::new(name, raw_value);
        let disposition = classify_request_header(line.lower_name());
        match disposition {
            HeaderDisposition::Forward => {
                HeaderValue::from_bytes(raw_value)
                    .map_err(|_| anyhow!("invalid value for header '{name}'"))?;
                self.headers.push(line);
                return Ok(true);
            }
            HeaderDisposition::Skip => return Ok(true),
            _ => {}
        }

        let value = std::str::from_utf8(raw_value)
            .map_err(|_| anyhow!("header '{name}' contains non-text bytes"))?;
        match disposition {
            HeaderDisposition::Connection => {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        self.connection_tokens.insert(token.to_ascii_lowercase());
                    }
                }
            }
            HeaderDisposition::Host => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                self.host = Some(value.to_ascii_lowercase());
            }
            HeaderDisposition::ContentLength => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                if self.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length = value
                    .parse::<u64>()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
            }
            HeaderDisposition::TransferEncoding => {
                if self.chunked {
                    bail!("duplicate Transfer-Encoding header");
                }
                if !value.eq_ignore_ascii_case("chunked") {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                self.chunked = true;
            }
            HeaderDisposition::Expect => {
                if !value.eq_ignore_ascii_case("100-continue") {
                    bail!("unsupported Expect header value '{value}'");
                }
                self.expect_continue = true;
            }
            HeaderDisposition::Skip | HeaderDisposition::Forward => {}
        }
        Ok(true)
    }

    fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );
        Ok(())
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn has_connection_token(&self, token: &str) -> bool {
        self.connection_tokens.contains(token)
    }

    /// End-to-end headers in arrival order, minus anything the client named in `Connection`.
    pub fn forward_headers(&self) -> impl Iterator<Item = &Http1HeaderLine> {
        self.headers
            .iter()
            .filter(move |header| !self.has_connection_token(header.lower_name()))
    }

    pub fn forward_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for header in self.forward_headers() {
            if let Ok(name) = HeaderName::from_bytes(header.name.as_bytes())
                && let Ok(value) = HeaderValue::from_bytes(&header.value)
            {
                map.append(name, value);
            }
        }
        map
    }
}

pub(crate) fn trim_line_ending(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|byte| !matches!(byte, b'\r' | b'\n'))
        .map_or(0, |idx| idx + 1);
    &line[..end]
}

/// Splits `name: value` on the first colon. The name must be a valid token; the value is
/// returned with surrounding whitespace removed but otherwise untouched.
pub(crate) fn split_header_line(line: &[u8]) -> Result<(&str, &[u8])> {
    let colon = line
        .iter()
        .position(|byte| *byte == b':')
        .ok_or_else(|| anyhow!("header missing ':' separator"))?;
    let name = std::str::from_utf8(&line[..colon])
        .map_err(|_| anyhow!("invalid header name"))?;
    if name.is_empty() || name.trim() != name {
        bail!("invalid header name '{name}'");
    }
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| anyhow!("invalid header name '{name}'"))?;
    Ok((name, line[colon + 1..].trim_ascii()))
}
