use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use super::line::read_line_with_timeout;
use crate::util::timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const READ_BUFFER: usize = 8192;

/// Typed marker so handlers can map an overflowing body to 413 by downcast.
#[derive(Debug, Error)]
#[error("request body exceeds configured limit")]
pub struct BodyTooLarge {
    pub limit: u64,
}

fn check_limit(collected: usize, incoming: usize, limit: Option<u64>) -> Result<()> {
    if let Some(limit) = limit
        && (collected as u64).saturating_add(incoming as u64) > limit
    {
        return Err(BodyTooLarge { limit }.into());
    }
    Ok(())
}

/// Read exactly `length` body bytes into memory.
pub async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: u64,
    timeout_dur: Duration,
    limit: Option<u64>,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    if let Some(limit) = limit
        && length > limit
    {
        return Err(BodyTooLarge { limit }.into());
    }

    let mut body = Vec::with_capacity(length.min(READ_BUFFER as u64) as usize);
    let mut remaining = length;
    let mut buffer = [0u8; READ_BUFFER];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            timeout_dur,
            reader.read(&mut buffer[..to_read]),
            "reading body",
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading body");
        }
        remaining -= read as u64;
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body)
}

/// Decode a chunked body into memory, consuming any trailers.
pub async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    limit: Option<u64>,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        let read = read_line_with_timeout(
            reader,
            &mut line,
            timeout_dur,
            "reading chunk size",
            MAX_CHUNK_LINE_LENGTH,
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk size");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed);
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailers end with a blank line.
            loop {
                let read = read_line_with_timeout(
                    reader,
                    &mut line,
                    timeout_dur,
                    "reading chunk trailer",
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 {
                    bail!("unexpected EOF while reading chunk trailer");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        check_limit(body.len(), chunk_size, limit)?;

        let mut remaining = chunk_size;
        let mut buffer = [0u8; READ_BUFFER];
        while remaining > 0 {
            let to_read = remaining.min(buffer.len());
            let read = timeout_with_context(
                timeout_dur,
                reader.read(&mut buffer[..to_read]),
                "reading chunk data",
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk data");
            }
            remaining -= read;
            body.extend_from_slice(&buffer[..read]);
        }

        let mut crlf = [0u8; 2];
        timeout_with_context(
            timeout_dur,
            reader.read_exact(&mut crlf),
            "reading chunk terminator",
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator");
        }
    }

    Ok(body)
}

/// Read until the peer closes the stream (responses with neither a
/// Content-Length nor chunked framing).
pub async fn read_until_close<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    limit: Option<u64>,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut buffer = [0u8; READ_BUFFER];
    loop {
        let read =
            timeout_with_context(timeout_dur, reader.read(&mut buffer), "reading body").await?;
        if read == 0 {
            break;
        }
        check_limit(body.len(), read, limit)?;
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body)
}
