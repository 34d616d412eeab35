use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "debug";

/// Installs the global subscriber. `RUST_LOG` takes precedence over the `debug` toggle.
pub fn init_logger(format: LogFormat, debug: bool) -> Result<()> {
    let default_filter = if debug { DEBUG_FILTER } else { DEFAULT_FILTER };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub method: String,
    pub uri: String,
    pub range: Option<String>,
    pub cache_lookup: Option<String>,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub error_reason: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                uri: String::new(),
                range: None,
                cache_lookup: None,
                status: 0,
                bytes_in: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                error_reason: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.event.uri = uri.into();
        self
    }

    pub fn range(mut self, range: impl Into<String>) -> Self {
        let range = range.into();
        self.event.range = (!range.is_empty()).then_some(range);
        self
    }

    pub fn cache_lookup(mut self, value: impl Into<String>) -> Self {
        self.event.cache_lookup = Some(value.into());
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn bytes(mut self, in_bytes: u64, out_bytes: u64) -> Self {
        self.event.bytes_in = in_bytes;
        self.event.bytes_out = out_bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

fn access_timestamp(now: OffsetDateTime) -> String {
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let month: u8 = month.into();
    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z",
        millis = now.millisecond()
    )
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        uri,
        range,
        cache_lookup,
        status,
        bytes_in,
        bytes_out,
        elapsed_ms,
        error_reason,
    } = event;

    let ts = access_timestamp(OffsetDateTime::now_utc());
    tracing::info!(
        target: "access_log",
        ts,
        client_ip = %client_ip,
        client_port,
        method,
        uri,
        range = range.as_deref(),
        cache_lookup = cache_lookup.as_deref(),
        status,
        bytes_in,
        bytes_out,
        elapsed_ms,
        error_reason = error_reason.as_deref()
    );

    crate::metrics::record_request(
        cache_lookup.as_deref().unwrap_or("none"),
        &method,
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Duration::from_millis(elapsed_ms as u64),
    );
}
