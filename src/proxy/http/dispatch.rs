use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::handler::ProxyRequest;

use super::body::{BodyPlan, BodyTooLarge, read_request_body};
use super::codec::{ConnectionOverride, Http1RequestHead, read_http1_request_head};
use super::respond::{send_error_response, write_outbound_response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ClientDisposition {
    Continue,
    Close,
}

/// Serves requests from one client connection until it closes, goes idle, asks to close, or
/// sends something unparseable.
pub(super) async fn serve_http_loop<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_header_size;

    loop {
        let start = Instant::now();
        let head = match read_http1_request_head(
            reader,
            peer,
            client_timeout,
            client_timeout,
            max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %peer, error = %format!("{err:#}"), "rejecting malformed request");
                let bytes_out =
                    send_error_response(reader.get_mut(), StatusCode::BAD_REQUEST, client_timeout)
                        .await?;
                AccessLogBuilder::new(peer)
                    .status(StatusCode::BAD_REQUEST)
                    .bytes(0, bytes_out)
                    .elapsed(start.elapsed())
                    .error_reason("malformed_request")
                    .log();
                break;
            }
        };

        if handle_request(reader, peer, head, app, start).await? == ClientDisposition::Close {
            break;
        }
    }
    Ok(())
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    head: Http1RequestHead,
    app: &AppContext,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let headers = head.headers.forward_header_map();
    let log = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .uri(head.target.as_str())
        .range(
            headers
                .get(http::header::RANGE)
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .unwrap_or_default(),
        );

    let plan = BodyPlan::from_framing(head.headers.content_length(), head.headers.is_chunked());
    if head.headers.expect_continue() && plan != BodyPlan::Empty {
        write_all_with_timeout(
            reader.get_mut(),
            b"HTTP/1.1 100 Continue\r\n\r\n",
            client_timeout,
            "sending 100 Continue to client",
        )
        .await?;
    }

    let body = match read_request_body(
        reader,
        plan,
        client_timeout,
        peer,
        app.settings.max_request_body_size,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => {
            let (status, reason) = if err.downcast_ref::<BodyTooLarge>().is_some() {
                (StatusCode::PAYLOAD_TOO_LARGE, "request_body_too_large")
            } else {
                (StatusCode::BAD_REQUEST, "request_body_invalid")
            };
            debug!(peer = %peer, error = %format!("{err:#}"), "failed to read request body");
            let bytes_out = send_error_response(reader.get_mut(), status, client_timeout).await?;
            log.status(status)
                .bytes(head.head_bytes as u64, bytes_out)
                .elapsed(start.elapsed())
                .error_reason(reason)
                .log();
            return Ok(ClientDisposition::Close);
        }
    };
    let bytes_in = (head.head_bytes + body.len()) as u64;

    let keep_alive = head.keep_alive();
    let connection = if !keep_alive {
        Some(ConnectionOverride::Close)
    } else if head.version == Version::HTTP_10 {
        Some(ConnectionOverride::KeepAlive)
    } else {
        None
    };

    let method = head.method.clone();
    let outcome = app
        .handler
        .handle(ProxyRequest {
            method: head.method,
            target: head.target,
            headers,
            body,
        })
        .await;

    let bytes_out = write_outbound_response(
        reader.get_mut(),
        &method,
        &outcome.response,
        connection,
        client_timeout,
    )
    .await?;

    let mut log = log
        .cache_lookup(outcome.cache_lookup.as_str())
        .status(outcome.response.status)
        .bytes(bytes_in, bytes_out)
        .elapsed(start.elapsed());
    if let Some(reason) = outcome.upstream_error {
        log = log.error_reason(reason);
    }
    log.log();

    Ok(if keep_alive {
        ClientDisposition::Continue
    } else {
        ClientDisposition::Close
    })
}
