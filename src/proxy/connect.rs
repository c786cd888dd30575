use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::Method;
use rustls::crypto::ring;
use rustls::server::ServerConfig;
use rustls::sign::{CertifiedKey, SingleCertAndKey};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::io_util::{shutdown_with_timeout, write_all_with_timeout};

use super::AppContext;
use super::codec::read_request_head;
use super::http::{ServeMode, handle_request};

const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Intercept a CONNECT tunnel: acknowledge it, terminate TLS with a minted
/// certificate for the requested authority, then run the decrypted request
/// through the regular pipeline.
pub async fn handle_connect<S>(
    mut stream: S,
    peer: SocketAddr,
    app: AppContext,
    authority: String,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    info!(peer = %peer, host = %authority, "intercepting CONNECT tunnel");
    let io_timeout = app.settings.client_timeout();

    write_all_with_timeout(
        &mut stream,
        TUNNEL_ESTABLISHED,
        io_timeout,
        "acknowledging CONNECT tunnel",
    )
    .await?;

    // Certificate failures close the tunnel without a response; the client
    // already saw the 200 acknowledgment.
    let certified = match app.certs.obtain(&authority) {
        Ok(certified) => certified,
        Err(err) => {
            warn!(peer = %peer, host = %authority, error = %err, "failed to obtain leaf certificate");
            return Ok(());
        }
    };

    let acceptor = TlsAcceptor::from(build_server_config(certified)?);
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(err) => {
            debug!(peer = %peer, host = %authority, error = %err, "TLS handshake with client failed");
            return Ok(());
        }
    };

    let mut reader = BufReader::new(tls_stream);
    let head = match read_request_head(
        &mut reader,
        io_timeout,
        app.settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(err) => {
            debug!(peer = %peer, host = %authority, error = %err, "invalid request inside tunnel");
            return Ok(());
        }
    };

    if head.method == Method::CONNECT {
        debug!(peer = %peer, "nested CONNECT inside tunnel rejected");
        return Ok(());
    }

    let _ = handle_request(
        &mut reader,
        peer,
        &app,
        head,
        ServeMode::Mitm,
        Some(&authority),
    )
    .await?;

    let _ = shutdown_with_timeout(reader.get_mut(), io_timeout).await;
    Ok(())
}

fn build_server_config(certified: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
    let provider = ring::default_provider();
    let builder = ServerConfig::builder_with_provider(provider.into());
    let builder = builder
        .with_safe_default_protocol_versions()
        .context("failed to configure TLS protocol versions")?;
    let resolver = SingleCertAndKey::from(certified);
    let mut config = builder
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
