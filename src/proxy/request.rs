use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `target` as an absolute-form request target. Anything without a scheme (origin-form,
/// authority-form, asterisk-form) yields `None`.
pub fn absolute_uri(target: &str) -> Option<Uri> {
    let uri: Uri = target.parse().ok()?;
    uri.scheme()?;
    Some(uri)
}

/// Lowercases the scheme, defaulting to plain HTTP when none was given.
pub fn normalize_scheme(value: Option<&str>) -> String {
    match value {
        Some(scheme) if !scheme.is_empty() => scheme.to_ascii_lowercase(),
        _ => Scheme::Http.as_str().to_string(),
    }
}

/// Parse a normalized scheme into the schemes this proxy can dispatch to.
pub fn parse_scheme(value: &str) -> Result<Scheme> {
    match value {
        "http" => Ok(Scheme::Http),
        "https" => Ok(Scheme::Https),
        other => bail!("unsupported scheme '{other}'"),
    }
}

/// An absolute request target broken into the parts needed to re-issue it upstream.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl ParsedRequest {
    pub fn from_absolute(method: Method, uri: &Uri) -> Result<Self> {
        let scheme = parse_scheme(&normalize_scheme(uri.scheme_str()))?;
        let authority = uri
            .authority()
            .map(|auth| auth.as_str())
            .ok_or_else(|| anyhow!("request target missing authority"))?;
        let (host, port) = parse_authority(authority)?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_string();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };

        Ok(Self {
            method,
            scheme,
            host,
            port,
            path,
        })
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Value for the upstream `Host` header: brackets around IPv6 literals, port only when it
    /// differs from the scheme default.
    pub fn authority_host(&self) -> String {
        let mut host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if let Some(port) = self.port.filter(|port| *port != self.scheme.default_port()) {
            host.push(':');
            host.push_str(&port.to_string());
        }
        host
    }
}

/// Parse a URI authority into a lowercase host (brackets stripped) and optional port.
pub fn parse_authority(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty authority");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid authority '{trimmed}'"))?;
    let host = uri
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| anyhow!("authority missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}
