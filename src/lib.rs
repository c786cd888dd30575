pub mod cache;
pub mod cli;
pub mod io_util;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod tls;
pub mod util;

use std::sync::Arc;

use anyhow::{Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    cache::{CachePolicy, PolicyStore, ResponseStore},
    proxy::AppContext,
    settings::Settings,
    tls::{CertStore, CertificateAuthority},
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let ca = Arc::new(CertificateAuthority::load_or_generate(&settings.ca_dir)?);
    let certs = Arc::new(CertStore::new(ca.clone(), settings.max_cert_cache_entries));

    let store = ResponseStore::new(settings.max_cache_bytes());
    if settings.persistence.enable {
        let path = &settings.persistence.cache_file;
        if path.exists() {
            match store.load(path) {
                Ok(()) => info!(path = %path.display(), "cache restored from disk"),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to load cache; starting empty");
                }
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    store.spawn_sweeper(shutdown_rx.clone());
    spawn_signal_task(shutdown_tx);

    let (policy_tx, policy_rx) = watch::channel(Arc::new(CachePolicy::from_settings(&settings)));
    spawn_reload_task(settings.clone(), policy_tx);

    if settings.persistence.enable {
        spawn_auto_save_task(settings.clone(), store.clone(), shutdown_rx.clone());
    }

    let tls_client = build_tls_client_config()?;
    let app = AppContext::new(
        settings.clone(),
        PolicyStore::new(policy_rx),
        store.clone(),
        certs,
        tls_client,
    );

    let listener = proxy::listener::bind(settings.listen()?).await?;
    proxy::listener::serve(listener, app, shutdown_rx).await?;

    if settings.persistence.enable {
        let path = &settings.persistence.cache_file;
        match store.save(path) {
            Ok(()) => info!(path = %path.display(), "cache saved on shutdown"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to save cache on shutdown"),
        }
    }
    info!("proxy stopped");
    Ok(())
}

/// Outbound TLS client configuration trusting the system roots.
pub fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }
    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(unix)]
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT; shutting down"),
            _ = terminate.recv() => info!("received SIGTERM; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
}

/// SIGHUP re-reads the configuration and publishes a fresh cache policy;
/// TTLs and cacheability rules change without dropping cache contents.
#[cfg(unix)]
fn spawn_reload_task(settings: Arc<Settings>, policy_tx: watch::Sender<Arc<CachePolicy>>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGHUP handler");
                return;
            }
        };

        while hup.recv().await.is_some() {
            info!("received SIGHUP; reloading configuration");
            match settings.reload() {
                Ok(reloaded) => {
                    let policy = Arc::new(CachePolicy::from_settings(&reloaded));
                    let default_ttl = policy.default_ttl.as_secs();
                    let cacheable_types = policy.cacheable_types.len();
                    if policy_tx.send(policy).is_err() {
                        error!("failed to publish reloaded cache policy");
                        break;
                    }
                    info!(default_ttl, cacheable_types, "cache policy reloaded");
                }
                Err(err) => {
                    error!(error = ?err, "configuration reload failed");
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_task(_settings: Arc<Settings>, _policy_tx: watch::Sender<Arc<CachePolicy>>) {
    info!("SIGHUP reload is not supported on this platform");
}

fn spawn_auto_save_task(
    settings: Arc<Settings>,
    store: ResponseStore,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.auto_save_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let path = &settings.persistence.cache_file;
                    if let Err(err) = store.save(path) {
                        warn!(path = %path.display(), error = %err, "periodic cache save failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
