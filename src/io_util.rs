use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}

pub async fn shutdown_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    timeout: Duration,
) -> Result<()> {
    timeout_with_context(timeout, writer.shutdown(), "shutting down stream").await
}
