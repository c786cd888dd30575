use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http::{Method, StatusCode};
use thiserror::Error;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::io_util::write_all_with_timeout;
use crate::util::timeout_with_context;

use super::codec::{self, HeaderAccumulator};
use super::request::{ParsedRequest, Scheme};

/// Marker layered onto failures that happen after the origin committed a
/// status line, so handlers can tell them apart from transport errors.
#[derive(Debug, Error)]
#[error("failed to read upstream response body")]
pub struct UpstreamBodyRead;

/// A fully buffered origin response.
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ForwardedResponse {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(lower_name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct ForwardOptions {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_response_header_size: usize,
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Forward one request to its origin on a fresh connection and read the
/// whole response into memory. The connection is not reused; the request is
/// sent with `Connection: close` so un-framed bodies terminate cleanly.
pub async fn forward_request(
    parsed: &ParsedRequest,
    headers: &HeaderAccumulator,
    body: Option<&[u8]>,
    tls_client: Arc<ClientConfig>,
    options: &ForwardOptions,
) -> Result<ForwardedResponse> {
    let (host, port) = parsed.upstream_addr();
    let tcp = connect(&host, port, options.connect_timeout).await?;
    let _ = tcp.set_nodelay(true);

    let mut stream: Box<dyn AsyncStream> = match parsed.scheme {
        Scheme::Http => Box::new(tcp),
        Scheme::Https => {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow!("invalid TLS server name '{host}'"))?;
            let connector = TlsConnector::from(tls_client);
            let tls = timeout_with_context(
                options.io_timeout,
                connector.connect(server_name, tcp),
                format!("completing TLS handshake with {host}:{port}"),
            )
            .await?;
            Box::new(tls)
        }
    };

    let request_head = encode_request_head(parsed, headers, body.map(|body| body.len()));
    write_all_with_timeout(
        &mut stream,
        &request_head,
        options.io_timeout,
        "writing request head to upstream",
    )
    .await?;
    if let Some(body) = body.filter(|body| !body.is_empty()) {
        write_all_with_timeout(
            &mut stream,
            body,
            options.io_timeout,
            "writing request body to upstream",
        )
        .await?;
    }

    let mut reader = BufReader::new(stream);
    let head = codec::read_response_head(
        &mut reader,
        options.io_timeout,
        options.max_response_header_size,
    )
    .await?;

    let body = read_response_body(&mut reader, &parsed.method, &head, options.io_timeout)
        .await
        .map_err(|err| err.context(UpstreamBodyRead))?;
    debug!(
        url = %parsed.url(),
        status = head.status.as_u16(),
        body_bytes = body.len(),
        "upstream response buffered"
    );

    Ok(ForwardedResponse {
        status: head.status,
        headers: head.headers,
        body: Bytes::from(body),
    })
}

async fn connect(host: &str, port: u16, timeout_dur: Duration) -> Result<TcpStream> {
    let addrs: Vec<_> = timeout_with_context(
        timeout_dur,
        tokio::net::lookup_host((host, port)),
        format!("resolving {host}:{port}"),
    )
    .await?
    .collect();
    if addrs.is_empty() {
        bail!("no addresses resolved for {host}:{port}");
    }

    let mut last_error = None;
    for addr in addrs {
        match timeout_with_context(
            timeout_dur,
            TcpStream::connect(addr),
            format!("connecting to {addr}"),
        )
        .await
        {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("failed to connect to {host}:{port}")))
        .with_context(|| format!("unable to reach {host}:{port}"))
}

fn encode_request_head(
    parsed: &ParsedRequest,
    headers: &HeaderAccumulator,
    body_len: Option<usize>,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(
        format!("{} {} HTTP/1.1\r\n", parsed.method, parsed.path).as_bytes(),
    );
    buffer.extend_from_slice(format!("Host: {}\r\n", parsed.authority()).as_bytes());
    for line in headers.forward_lines() {
        buffer.extend_from_slice(line.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(line.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    if let Some(len) = body_len {
        buffer.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

async fn read_response_body<S>(
    reader: &mut BufReader<S>,
    method: &Method,
    head: &codec::ResponseHead,
    timeout_dur: Duration,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let bodyless = *method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED;
    if bodyless {
        return Ok(Vec::new());
    }

    if head.chunked {
        codec::read_chunked_body(reader, timeout_dur, None).await
    } else if let Some(length) = head.content_length {
        codec::read_fixed_body(reader, length, timeout_dur, None).await
    } else {
        codec::read_until_close(reader, timeout_dur, None).await
    }
}
