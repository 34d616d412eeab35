use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// Reads one `\n`-terminated line into `buf`, failing once `deadline` passes or the line grows
/// beyond `max_len` bytes. Returns 0 on a clean EOF before any byte was read.
pub(crate) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let mut raw = Vec::new();
    let len = read_raw_line_with_deadline(reader, &mut raw, deadline, peer, max_len).await?;
    *buf = String::from_utf8(raw).map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    Ok(len)
}

/// Byte-level variant of [`read_line_with_deadline`] for header fields, whose values may carry
/// obs-text (0x80-0xFF).
pub(crate) async fn read_raw_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut Vec<u8>,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let context = format!("reading line from {peer}");

    loop {
        let remaining = remaining_deadline(deadline, &context)?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if buf.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if buf
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        buf.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            return Ok(buf.len());
        }
    }
}

pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_line_with_deadline(reader, buf, Instant::now() + timeout_dur, peer, max_len).await
}

pub(super) fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
        .ok_or_else(|| anyhow!("timed out {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn reads_lines_and_reports_eof() -> Result<()> {
        let data = b"first\r\nsecond\n";
        let mut reader = BufReader::new(&data[..]);
        let mut line = String::new();

        let read = read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), peer(), 64)
            .await?;
        assert_eq!(read, 7);
        assert_eq!(line, "first\r\n");

        read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), peer(), 64).await?;
        assert_eq!(line, "second\n");

        let read = read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), peer(), 64)
            .await?;
        assert_eq!(read, 0);
        Ok(())
    }

    #[tokio::test]
    async fn raw_lines_keep_obs_text() -> Result<()> {
        let data = b"X-Name: caf\xe9\r\n";
        let mut reader = BufReader::new(&data[..]);
        let mut raw = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);

        let read = read_raw_line_with_deadline(&mut reader, &mut raw, deadline, peer(), 64).await?;
        assert_eq!(read, data.len());
        assert_eq!(raw, data);

        let mut reader = BufReader::new(&data[..]);
        let mut line = String::new();
        let err = read_line_with_deadline(&mut reader, &mut line, deadline, peer(), 64)
            .await
            .expect_err("text lines must be UTF-8");
        assert!(
            err.to_string().contains("contained invalid bytes"),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejects_line_over_limit() {
        let data = b"0123456789abcdef\r\n";
        let mut reader = BufReader::new(&data[..]);
        let mut line = String::new();
        let err = read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), peer(), 8)
            .await
            .expect_err("long line should be rejected");
        assert!(
            err.to_string().contains("exceeds configured limit"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn rejects_truncated_line() {
        let data = b"partial";
        let mut reader = BufReader::new(&data[..]);
        let mut line = String::new();
        let err = read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), peer(), 64)
            .await
            .expect_err("truncated line should be rejected");
        assert!(
            err.to_string().contains("connection closed"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_peer_stalls() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"no newline yet").await.unwrap();
        let mut reader = BufReader::new(server);
        let mut line = String::new();
        let err = read_line_with_timeout(
            &mut reader,
            &mut line,
            Duration::from_millis(50),
            peer(),
            64,
        )
        .await
        .expect_err("stalled line should time out");
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
        drop(client);
    }
}
