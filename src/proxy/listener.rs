use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use http::Method;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::codec::read_request_head;
use super::connect::handle_connect;
use super::http::{ClientDisposition, ServeMode, handle_request};
use super::AppContext;

/// How long in-flight connections get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(addr);
    info!(address = %local_addr, "proxy listener started");
    Ok(listener)
}

/// Accept loop. Runs until the shutdown channel flips to true, then drains
/// in-flight connections for a bounded grace period.
pub async fn serve(
    listener: TcpListener,
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                }
                let connection_app = app.clone();
                connections.spawn(async move {
                    if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
                // Reap finished tasks so the set does not grow unbounded.
                while connections.try_join_next().is_some() {}
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    info!(
        in_flight = connections.len(),
        grace_secs = SHUTDOWN_GRACE.as_secs(),
        "draining in-flight connections"
    );
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed; abandoning remaining connections");
        connections.abort_all();
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let io_timeout = app.settings.client_timeout();

    loop {
        let head = match read_request_head(
            &mut reader,
            io_timeout,
            app.settings.max_request_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer, error = %err, "invalid request");
                break;
            }
        };

        if head.method == Method::CONNECT {
            // Take the raw stream back from the request loop; nothing is
            // buffered because the client waits for our acknowledgment
            // before speaking TLS.
            let target = head.target.clone();
            let stream = reader.into_inner();
            return handle_connect(stream, peer, app, target).await;
        }

        match handle_request(&mut reader, peer, &app, head, ServeMode::Plain, None).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    Ok(())
}
