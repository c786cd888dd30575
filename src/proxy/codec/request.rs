use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::Method;
use tokio::io::{AsyncRead, BufReader};

use super::headers::HeaderAccumulator;
use super::line::read_line_with_timeout;

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderAccumulator,
}

/// Read one HTTP/1.1 request head. Returns `None` on clean EOF before the
/// request line, which is how a keep-alive client says goodbye.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = read_line_with_timeout(
        reader,
        &mut line,
        timeout_dur,
        "reading request line",
        max_header_bytes,
    )
    .await?;
    if read == 0 {
        return Ok(None);
    }

    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("empty request line");
    }

    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let remaining = max_header_bytes
        .checked_sub(read)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let mut headers = HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut header_line,
            timeout_dur,
            "reading request headers",
            remaining,
        )
        .await?;
        if read == 0 {
            bail!("connection closed during request headers");
        }
        if !headers
            .push_line(&header_line)
            .context("invalid request header")?
        {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}
