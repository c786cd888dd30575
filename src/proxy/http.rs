use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

use crate::cache::{self, CachedResponse};
use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;

use super::AppContext;
use super::codec::{self, BodyTooLarge, CacheStatus, RequestHead, encode_response};
use super::request::{ParsedRequest, Scheme, parse_request_target};
use super::upstream::{self, ForwardedResponse, UpstreamBodyRead};

pub enum ClientDisposition {
    Continue,
    Close,
}

/// Which side of the proxy a request arrived on. The decrypted MITM path
/// serves one request per tunnel and reports upstream failures as 502.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Plain,
    Mitm,
}

pub async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
    mode: ServeMode,
    connect_authority: Option<&str>,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let start = Instant::now();
    let policy = app.policy.snapshot();
    let io_timeout = app.settings.client_timeout();
    let RequestHead {
        method,
        target,
        headers,
    } = head;

    let (fallback_scheme, host_header) = match mode {
        ServeMode::Plain => (Scheme::Http, headers.host()),
        // The tunnel fixes the authority: the inner request is rewritten to
        // https://<CONNECT authority> no matter what its Host header says.
        ServeMode::Mitm => (Scheme::Https, connect_authority),
    };

    let parsed = match parse_request_target(method.clone(), &target, host_header, fallback_scheme)
    {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(peer = %peer, error = %err, "invalid request target");
            if mode == ServeMode::Mitm {
                return Ok(ClientDisposition::Close);
            }
            send_error(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                b"invalid request\r\n",
                app,
                peer,
                &method,
                &target,
                start,
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    info!(method = %parsed.method, url = %parsed.url(), "proxy request");

    // Buffer the request body up front. POST bodies headed for the cache key
    // are capped by the POST policy; everything else by the ambient limit.
    let body_limit = if parsed.method == Method::POST && policy.post_cache.enable {
        policy.post_cache.max_request_body_size
    } else {
        app.settings.max_request_body_size as u64
    };
    let has_body = headers.is_chunked() || headers.content_length().unwrap_or(0) > 0;
    let within_limit = headers
        .content_length()
        .is_none_or(|length| length <= body_limit);
    if has_body && within_limit && headers.expect_continue() {
        write_all_with_timeout(
            reader.get_mut(),
            b"HTTP/1.1 100 Continue\r\n\r\n",
            io_timeout,
            "writing interim continue response",
        )
        .await?;
    }

    let request_body = if headers.is_chunked() {
        match codec::read_chunked_body(reader, io_timeout, Some(body_limit)).await {
            Ok(body) => Some(body),
            Err(err) => return body_read_failure(reader, err, app, peer, &parsed, start).await,
        }
    } else {
        match headers.content_length() {
            Some(length) if length > 0 => {
                match codec::read_fixed_body(reader, length, io_timeout, Some(body_limit)).await {
                    Ok(body) => Some(body),
                    Err(err) => {
                        return body_read_failure(reader, err, app, peer, &parsed, start).await;
                    }
                }
            }
            _ => None,
        }
    };

    let keyable = policy.is_keyable(&parsed.method);
    let fingerprint = keyable.then(|| {
        if parsed.method == Method::POST {
            cache::post_fingerprint(
                &parsed,
                policy.post_cache.include_query_string,
                request_body.as_deref().unwrap_or(&[]),
            )
        } else {
            cache::get_fingerprint(&parsed)
        }
    });

    if let Some(fingerprint) = fingerprint.as_deref()
        && let Some(entry) = app.store.lookup(fingerprint)
    {
        info!(key = fingerprint, "cache hit");
        return serve_cached(reader, app, peer, &parsed, &headers, entry, mode, start).await;
    }
    if let Some(fingerprint) = fingerprint.as_deref() {
        info!(key = fingerprint, "cache miss");
    } else {
        debug!(method = %parsed.method, "request method not keyable");
    }

    let forwarded = match upstream::forward_request(
        &parsed,
        &headers,
        request_body.as_deref(),
        app.tls_client.clone(),
        &app.forward_options(),
    )
    .await
    {
        Ok(forwarded) => forwarded,
        Err(err) => {
            warn!(peer = %peer, url = %parsed.url(), error = %err, "failed to forward request");
            return forward_failure(reader, err, app, peer, &parsed, keyable, mode, start).await;
        }
    };

    if let Some(fingerprint) = fingerprint.clone()
        && policy.is_cacheable(&forwarded.headers)
    {
        let body_len = forwarded.body.len() as u64;
        if parsed.method == Method::POST && body_len > policy.post_cache.max_response_body_size {
            warn!(
                url = %parsed.url(),
                body_bytes = body_len,
                limit = policy.post_cache.max_response_body_size,
                "response body too large for POST cache"
            );
        } else {
            let ttl = policy.ttl_for(forwarded.status.as_u16());
            let entry = CachedResponse::new(
                forwarded.status.as_u16(),
                forwarded.headers.clone(),
                forwarded.body.clone(),
            );
            app.store.insert(fingerprint.clone(), entry, ttl);
            info!(key = fingerprint, ttl_secs = ttl.as_secs(), "response cached");
        }
    } else if fingerprint.is_some() {
        debug!(url = %parsed.url(), status = forwarded.status.as_u16(), "response not cacheable");
    }

    serve_forwarded(reader, app, peer, &parsed, &headers, forwarded, keyable, mode, start).await
}

async fn serve_cached<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    peer: SocketAddr,
    parsed: &ParsedRequest,
    headers: &codec::HeaderAccumulator,
    entry: CachedResponse,
    mode: ServeMode,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let encoded = encode_response(
        status,
        &entry.headers,
        Some(CacheStatus::Hit),
        entry.body.len(),
    );
    let io_timeout = app.settings.client_timeout();

    let content_type = entry.header("content-type").unwrap_or("").to_string();
    let bytes_out = (encoded.len() + entry.body.len()) as u64;
    if let Err(err) = write_payload(reader.get_mut(), &encoded, &entry.body, io_timeout).await {
        warn!(peer = %peer, error = %err, "failed to write cached response");
        return Ok(ClientDisposition::Close);
    }

    AccessLogBuilder::new(peer)
        .method(parsed.method.as_str())
        .url(parsed.url())
        .status(status)
        .cache(CacheStatus::Hit.as_str())
        .content_type(content_type)
        .bytes_out(bytes_out)
        .elapsed(start.elapsed())
        .log();

    Ok(disposition(mode, headers))
}

#[allow(clippy::too_many_arguments)]
async fn serve_forwarded<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    peer: SocketAddr,
    parsed: &ParsedRequest,
    headers: &codec::HeaderAccumulator,
    forwarded: ForwardedResponse,
    keyable: bool,
    mode: ServeMode,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cache_status = keyable.then_some(CacheStatus::Miss);
    let encoded = encode_response(
        forwarded.status,
        &forwarded.headers,
        cache_status,
        forwarded.body.len(),
    );
    let io_timeout = app.settings.client_timeout();

    let content_type = forwarded.header("content-type").unwrap_or("").to_string();
    let bytes_out = (encoded.len() + forwarded.body.len()) as u64;
    if let Err(err) = write_payload(reader.get_mut(), &encoded, &forwarded.body, io_timeout).await {
        warn!(peer = %peer, error = %err, "failed to write response to client");
        return Ok(ClientDisposition::Close);
    }

    AccessLogBuilder::new(peer)
        .method(parsed.method.as_str())
        .url(parsed.url())
        .status(forwarded.status)
        .cache(cache_status.map(CacheStatus::as_str).unwrap_or(""))
        .content_type(content_type)
        .bytes_out(bytes_out)
        .elapsed(start.elapsed())
        .log();

    Ok(disposition(mode, headers))
}

fn disposition(mode: ServeMode, headers: &codec::HeaderAccumulator) -> ClientDisposition {
    match mode {
        // One decrypted request per tunnel.
        ServeMode::Mitm => ClientDisposition::Close,
        ServeMode::Plain if headers.wants_close() => ClientDisposition::Close,
        ServeMode::Plain => ClientDisposition::Continue,
    }
}

async fn body_read_failure<S>(
    reader: &mut BufReader<S>,
    err: anyhow::Error,
    app: &AppContext,
    peer: SocketAddr,
    parsed: &ParsedRequest,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(too_large) = err.downcast_ref::<BodyTooLarge>() {
        warn!(
            peer = %peer,
            url = %parsed.url(),
            limit = too_large.limit,
            "request body too large"
        );
        send_error(
            reader.get_mut(),
            StatusCode::PAYLOAD_TOO_LARGE,
            b"Request Body Too Large\r\n",
            app,
            peer,
            &parsed.method,
            &parsed.url(),
            start,
        )
        .await?;
        return Ok(ClientDisposition::Close);
    }
    warn!(peer = %peer, error = %err, "failed to read request body");
    Ok(ClientDisposition::Close)
}

#[allow(clippy::too_many_arguments)]
async fn forward_failure<S>(
    reader: &mut BufReader<S>,
    err: anyhow::Error,
    app: &AppContext,
    peer: SocketAddr,
    parsed: &ParsedRequest,
    keyable: bool,
    mode: ServeMode,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match mode {
        ServeMode::Plain => {
            // Transport and body-read failures alike surface as 503; the
            // failure is never cached.
            let body = format!("{err}\r\n");
            send_error(
                reader.get_mut(),
                StatusCode::SERVICE_UNAVAILABLE,
                body.as_bytes(),
                app,
                peer,
                &parsed.method,
                &parsed.url(),
                start,
            )
            .await?;
        }
        ServeMode::Mitm => {
            // A tunnel that already saw a status line just closes; anything
            // earlier gets a synthesized 502.
            if err.downcast_ref::<UpstreamBodyRead>().is_none() {
                let encoded =
                    encode_response(StatusCode::BAD_GATEWAY, &[], None, b"Bad Gateway\n".len());
                let io_timeout = app.settings.client_timeout();
                if let Err(write_err) =
                    write_payload(reader.get_mut(), &encoded, b"Bad Gateway\n", io_timeout).await
                {
                    warn!(peer = %peer, error = %write_err, "failed to write 502 over tunnel");
                }
                AccessLogBuilder::new(peer)
                    .method(parsed.method.as_str())
                    .url(parsed.url())
                    .status(StatusCode::BAD_GATEWAY)
                    .cache(if keyable { CacheStatus::Miss.as_str() } else { "" })
                    .bytes_out(b"Bad Gateway\n".len() as u64)
                    .elapsed(start.elapsed())
                    .log();
            }
        }
    }
    Ok(ClientDisposition::Close)
}

async fn write_payload<S>(
    stream: &mut S,
    head: &[u8],
    body: &[u8],
    timeout: std::time::Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all_with_timeout(stream, head, timeout, "writing response head").await?;
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout, "writing response body").await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send_error<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    app: &AppContext,
    peer: SocketAddr,
    method: &Method,
    url: &str,
    start: Instant,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        reason,
        body.len()
    );
    let io_timeout = app.settings.client_timeout();
    write_all_with_timeout(stream, header.as_bytes(), io_timeout, "writing error response")
        .await?;
    if !body.is_empty() {
        write_all_with_timeout(stream, body, io_timeout, "writing error body").await?;
    }

    AccessLogBuilder::new(peer)
        .method(method.as_str())
        .url(url)
        .status(status)
        .content_type("text/plain")
        .bytes_out((header.len() + body.len()) as u64)
        .elapsed(start.elapsed())
        .log();
    Ok(())
}
