use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

/// Parses a duration such as `90`, `500ms` or `2m 30s`. A bare integer is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).with_context(|| format!("invalid duration '{value}'"))
}

/// Canonical reason phrase for a status code, falling back to a generic label for codes that
/// have none registered.
pub fn reason_phrase(status: http::StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}
