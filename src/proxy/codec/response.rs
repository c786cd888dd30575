use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::StatusCode;
use tokio::io::{AsyncRead, BufReader};

use super::line::read_line_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Parsed head of an origin response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = read_line_with_timeout(
        reader,
        &mut line,
        timeout_dur,
        "reading upstream status line",
        max_header_bytes,
    )
    .await?;
    if read == 0 {
        bail!("upstream closed connection before sending a status line");
    }
    let mut budget = max_header_bytes
        .checked_sub(read)
        .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;

    let trimmed = line.trim_end_matches(['\r', '\n']);
    let status = parse_status_line(trimmed)?;

    let mut headers = Vec::new();
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut header_line = String::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut header_line,
            timeout_dur,
            "reading upstream headers",
            budget.max(1),
        )
        .await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget = budget
            .checked_sub(read)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;

        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("upstream header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            if let Some(existing) = content_length
                && existing != parsed
            {
                bail!("conflicting Content-Length headers from upstream");
            }
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        headers.push((name.to_string(), value.to_string()));
    }

    if chunked && content_length.is_some() {
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
    })
}

fn parse_status_line(value: &str) -> Result<StatusCode> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;

    match version {
        "HTTP/1.1" | "HTTP/1.0" => {}
        other => bail!("unsupported upstream HTTP version '{other}'"),
    }

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))
}

/// Serialize a response head for the client. Origin header lines are written
/// in order with duplicates intact; hop-by-hop headers (and anything a
/// Connection header names) are dropped; the body is always framed with an
/// explicit Content-Length because it is fully buffered.
pub fn encode_response(
    status: StatusCode,
    headers: &[(String, String)],
    cache_status: Option<CacheStatus>,
    body_len: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );

    let mut connection_tokens = HashSet::new();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    connection_tokens.insert(token.to_ascii_lowercase());
                }
            }
        }
    }

    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection"
                | "keep-alive"
                | "proxy-connection"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "transfer-encoding"
                | "content-length"
                | "upgrade"
                | "trailer"
        ) || connection_tokens.contains(&lower)
        {
            continue;
        }
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if let Some(cache_status) = cache_status {
        buffer.extend_from_slice(b"X-Cache: ");
        buffer.extend_from_slice(cache_status.as_str().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Content-Length: ");
    buffer.extend_from_slice(body_len.to_string().as_bytes());
    buffer.extend_from_slice(b"\r\n\r\n");
    buffer
}
