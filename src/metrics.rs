use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::proxy::http::read_line_with_deadline;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C>(collector: C, name: &str) -> C
where
    C: Collector + Clone + 'static,
{
    if let Err(err) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!(metric = name, error = %err, "failed to register metric");
    }
    collector
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
    register(vec, name)
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter opts");
    register(counter, name)
}

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "requests_total",
        "Completed requests by cache lookup result",
        &["cache"],
    )
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "requests_status_total",
        "Requests by status class",
        &["status_class"],
    )
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("requests_method_total", "Requests by method", &["method"])
});

static REQUEST_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "End-to-end request latency")
        .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("valid histogram opts");
    register(histogram, "request_duration_seconds")
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "cache_lookup_total",
        "Response cache lookups by result",
        &["result"],
    )
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("cache_store_total", "Response cache insertions"));

static CACHE_SWEEP_RUNS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("cache_sweep_runs_total", "Response cache sweep runs"));

static CACHE_SWEEP_EXPIRED_ENTRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "cache_sweep_expired_entries_total",
        "Expired cache entries removed by sweeper",
    )
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_errors_total",
        "Upstream failures by kind",
        &["kind"],
    )
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(cache_lookup: &str, method: &str, status: StatusCode, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[cache_lookup]).inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    REQUEST_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_sweep_run() {
    CACHE_SWEEP_RUNS_TOTAL.inc();
}

pub fn record_cache_sweep_removed(entries: u64) {
    if entries > 0 {
        CACHE_SWEEP_EXPIRED_ENTRIES_TOTAL.inc_by(entries);
    }
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the text exposition format at `path` until the listener fails.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    loop {
        let (stream, peer) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream_with_limits(
                stream,
                peer,
                &path,
                METRICS_READ_TIMEOUT,
                METRICS_MAX_REQUEST_BYTES,
            )
            .await
            {
                tracing::debug!(peer = %peer, error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream_with_limits<S>(
    stream: S,
    peer: SocketAddr,
    path: &str,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + read_timeout;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let mut total = read_line_with_deadline(&mut reader, &mut line, deadline, peer, max_bytes)
        .await
        .map_err(|err| oversized(err, "metrics request exceeded allowed size"))?;
    if total == 0 {
        return Ok(());
    }

    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let uri = parts.next().unwrap_or_default().to_string();

    loop {
        let remaining = max_bytes
            .checked_sub(total)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("metrics request exceeded allowed size"))?;
        let read = read_line_with_deadline(&mut reader, &mut line, deadline, peer, remaining)
            .await
            .map_err(|err| oversized(err, "metrics request exceeded allowed size"))?;
        total += read;
        if read == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
    }

    let response = if method == "GET" && uri == path {
        build_response(StatusCode::OK, TextEncoder::new().format_type(), gather())
    } else {
        build_response(StatusCode::NOT_FOUND, "text/plain", b"not found\n".to_vec())
    };

    let stream = reader.get_mut();
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Line-limit failures are reported uniformly; timeouts and I/O errors keep their own message.
fn oversized(err: anyhow::Error, message: &'static str) -> anyhow::Error {
    if err.to_string().contains("exceeds configured limit") {
        anyhow!(message)
    } else {
        err
    }
}

fn build_response(status: StatusCode, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        crate::util::reason_phrase(status),
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
