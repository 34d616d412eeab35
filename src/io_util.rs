use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    bytes: &[u8],
    timeout_dur: Duration,
    context: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.write_all(bytes), context).await
}

pub async fn shutdown_with_timeout<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.shutdown(), "shutting down stream").await
}
