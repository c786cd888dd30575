use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Parsed response as seen by a test client.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(lower_name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Issue one proxy-style GET (absolute-form target) and read to close.
pub async fn proxy_get(proxy: SocketAddr, url: &str) -> Result<Response> {
    let request =
        format!("GET {url} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host_of(url)?);
    send_raw(proxy, request.as_bytes()).await
}

/// Issue one proxy-style POST with a body.
pub async fn proxy_post(proxy: SocketAddr, url: &str, body: &[u8]) -> Result<Response> {
    let mut request = format!(
        "POST {url} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        host_of(url)?,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    send_raw(proxy, &request).await
}

pub async fn send_raw(proxy: SocketAddr, request: &[u8]) -> Result<Response> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(request).await?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

/// POST that keeps reading while the body is still being written, for
/// requests the proxy may reject mid-upload (e.g. 413).
pub async fn proxy_post_streaming(
    proxy: SocketAddr,
    url: &str,
    body: Vec<u8>,
) -> Result<Response> {
    let stream = TcpStream::connect(proxy).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut request = format!(
        "POST {url} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        host_of(url)?,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);

    let writer = tokio::spawn(async move {
        // The proxy may reset the connection once it has answered.
        let _ = write_half.write_all(&request).await;
        let _ = write_half.shutdown().await;
    });

    let mut reader = tokio::io::BufReader::new(read_half);
    let response = read_framed_response(&mut reader).await;
    writer.abort();
    response
}

/// Read one Content-Length-framed response without waiting for EOF.
pub async fn read_framed_response<S>(stream: &mut S) -> Result<Response>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = stream.read(&mut buffer).await?;
        anyhow::ensure!(read > 0, "connection closed before a full response");
        raw.extend_from_slice(&buffer[..read]);
        if let Some(header_end) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
            let content_length: usize = head
                .split("\r\n")
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse().ok())
                .unwrap_or(0);
            if raw.len() >= header_end + 4 + content_length {
                return parse_response(&raw[..header_end + 4 + content_length]);
            }
        }
    }
}

/// Establish a CONNECT tunnel, complete a TLS handshake with the proxy's
/// minted certificate, and issue one origin-form GET inside it.
pub async fn mitm_get(
    proxy: SocketAddr,
    authority: &str,
    path: &str,
    tls: Arc<ClientConfig>,
) -> Result<Response> {
    let mut stream = TcpStream::connect(proxy).await?;
    let connect = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    // Read the tunnel acknowledgment head only; TLS bytes follow.
    let mut ack = Vec::new();
    let mut byte = [0u8; 1];
    while !ack.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            bail!("proxy closed before acknowledging CONNECT");
        }
        ack.push(byte[0]);
        if ack.len() > 4096 {
            bail!("oversized CONNECT acknowledgment");
        }
    }
    let ack_text = String::from_utf8_lossy(&ack);
    if !ack_text.starts_with("HTTP/1.1 200") {
        bail!("unexpected CONNECT acknowledgment: {ack_text}");
    }

    let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid server name '{host}'"))?;
    let connector = TlsConnector::from(tls);
    let mut tls_stream = connector.connect(server_name, stream).await?;

    let request = format!("GET {path} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    tls_stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    let _ = tls_stream.read_to_end(&mut raw).await;
    parse_response(&raw)
}

fn host_of(url: &str) -> Result<String> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .context("absolute URL expected")?;
    Ok(rest
        .split(['/', '?'])
        .next()
        .unwrap_or(rest)
        .to_string())
}

pub fn parse_response(raw: &[u8]) -> Result<Response> {
    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .context("response missing header terminator")?;
    let head = std::str::from_utf8(&raw[..header_end]).context("response head not UTF-8")?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().context("response missing status line")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .context("status line missing code")?
        .parse()
        .context("invalid status code")?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(Response {
        status,
        headers,
        body: raw[header_end + 4..].to_vec(),
    })
}
