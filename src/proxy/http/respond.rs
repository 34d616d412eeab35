use std::time::Duration;

use anyhow::Result;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::AsyncWrite;

use crate::io_util::{shutdown_with_timeout, write_all_with_timeout};
use crate::proxy::handler::OutboundResponse;

use super::codec::{ConnectionOverride, encode_http1_response_head};

/// Writes `response` to the client and returns the number of bytes sent.
///
/// HEAD, 204 and 304 responses carry no body; for those the origin's own `Content-Length` (if
/// any) is passed through instead of the length of the buffered body.
pub(crate) async fn write_outbound_response<S>(
    stream: &mut S,
    method: &Method,
    response: &OutboundResponse,
    connection: Option<ConnectionOverride>,
    timeout_dur: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let bodiless = *method == Method::HEAD
        || response.status == StatusCode::NO_CONTENT
        || response.status == StatusCode::NOT_MODIFIED
        || response.status.is_informational();
    let content_length = if bodiless {
        origin_content_length(&response.headers)
    } else {
        Some(response.body.len() as u64)
    };

    let head = encode_http1_response_head(
        response.status,
        &response.headers,
        content_length,
        connection,
    );
    write_all_with_timeout(stream, &head, timeout_dur, "writing response header").await?;
    let mut written = head.len() as u64;
    if !bodiless && !response.body.is_empty() {
        write_all_with_timeout(stream, &response.body, timeout_dur, "writing response body")
            .await?;
        written += response.body.len() as u64;
    }
    Ok(written)
}

/// Standardized error response for requests that never reached the handler. Always asks the
/// client to close.
pub(crate) async fn send_error_response<S>(
    stream: &mut S,
    status: StatusCode,
    timeout_dur: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    write_outbound_response(
        stream,
        &Method::GET,
        &OutboundResponse::error(status),
        Some(ConnectionOverride::Close),
        timeout_dur,
    )
    .await
}

pub(crate) async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    shutdown_with_timeout(stream, timeout_dur).await
}

fn origin_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
