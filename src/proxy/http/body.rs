use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::{
    proxy::http::codec::{read_line_with_timeout, read_raw_line_with_deadline, trim_line_ending},
    util::timeout_with_context,
};

use super::codec::Http1ResponseHead;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const READ_BUFFER_SIZE: usize = 8192;
/// Cap on the up-front allocation for a declared length; larger bodies grow as they arrive.
const MAX_INITIAL_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
}

/// How the client framed its request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

impl BodyPlan {
    pub fn from_framing(content_length: Option<u64>, chunked: bool) -> Self {
        if chunked {
            return BodyPlan::Chunked;
        }
        match content_length {
            None | Some(0) => BodyPlan::Empty,
            Some(length) => BodyPlan::Fixed(length),
        }
    }
}

/// How the upstream frames its response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseBodyPlan {
    Chunked,
    Fixed(u64),
    Empty,
    UntilClose,
}

pub(crate) fn determine_response_body_plan(
    method: &Method,
    head: &Http1ResponseHead,
) -> ResponseBodyPlan {
    let status = head.status;
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return ResponseBodyPlan::Empty;
    }
    if head.chunked {
        return ResponseBodyPlan::Chunked;
    }
    match head.content_length {
        Some(0) => ResponseBodyPlan::Empty,
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::UntilClose,
    }
}

/// Reads a client request body into memory. Fails with [`BodyTooLarge`] once the body would
/// exceed `limit` bytes, before reading past it.
pub async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    timeout: Duration,
    peer: SocketAddr,
    limit: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(Bytes::new()),
        BodyPlan::Fixed(length) => {
            if length > limit as u64 {
                return Err(BodyTooLarge { limit }.into());
            }
            read_fixed(reader, length, timeout, "reading request body from client").await
        }
        BodyPlan::Chunked => read_chunked(reader, timeout, peer, Some(limit)).await,
    }
}

/// Reads an upstream response body into memory according to `plan`.
pub(crate) async fn read_response_body<S>(
    reader: &mut BufReader<S>,
    plan: ResponseBodyPlan,
    timeout: Duration,
    peer: SocketAddr,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    match plan {
        ResponseBodyPlan::Empty => Ok(Bytes::new()),
        ResponseBodyPlan::Fixed(length) => {
            read_fixed(
                reader,
                length,
                timeout,
                "reading upstream response body",
            )
            .await
        }
        ResponseBodyPlan::Chunked => read_chunked(reader, timeout, peer, None).await,
        ResponseBodyPlan::UntilClose => read_until_close(reader, timeout, peer).await,
    }
}

async fn read_fixed<S>(
    reader: &mut BufReader<S>,
    length: u64,
    timeout: Duration,
    context: &'static str,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let length = usize::try_from(length).context("body length does not fit in memory")?;
    let mut body = BytesMut::with_capacity(length.min(MAX_INITIAL_CAPACITY));
    let mut remaining = length;
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len());
        let read =
            timeout_with_context(timeout, reader.read(&mut buffer[..to_read]), context).await?;
        if read == 0 {
            bail!("unexpected EOF while {context}");
        }
        body.extend_from_slice(&buffer[..read]);
        remaining -= read;
    }
    Ok(body.freeze())
}

async fn read_chunked<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    limit: Option<usize>,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut line = String::new();

    loop {
        let read =
            read_line_with_timeout(reader, &mut line, timeout, peer, MAX_CHUNK_LINE_LENGTH).await?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailers are read and discarded; they are never replayed to clients.
            let mut trailer = Vec::new();
            loop {
                let deadline = Instant::now() + timeout;
                let read = read_raw_line_with_deadline(
                    reader,
                    &mut trailer,
                    deadline,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                if trim_line_ending(&trailer).is_empty() {
                    break;
                }
            }
            break;
        }

        if let Some(limit) = limit
            && body.len().saturating_add(chunk_size) > limit
        {
            return Err(BodyTooLarge { limit }.into());
        }

        let mut remaining = chunk_size;
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        while remaining > 0 {
            let to_read = remaining.min(buffer.len());
            let read = timeout_with_context(
                timeout,
                reader.read(&mut buffer[..to_read]),
                format!("reading chunk data from {peer}"),
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk data from {peer}");
            }
            body.extend_from_slice(&buffer[..read]);
            remaining -= read;
        }

        let mut crlf = [0u8; 2];
        timeout_with_context(
            timeout,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {peer}"),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {peer}");
        }
    }

    Ok(body.freeze())
}

async fn read_until_close<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            timeout,
            reader.read(&mut buffer),
            format!("reading upstream response body from {peer}"),
        )
        .await?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body.freeze())
}
