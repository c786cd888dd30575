use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rustls::ClientConfig;
use tempfile::TempDir;
use tokio::sync::watch;

use magpie::cache::{CachePolicy, PolicyStore, ResponseStore};
use magpie::cli::LogFormat;
use magpie::proxy::{AppContext, listener};
use magpie::settings::{
    CacheSettings, PersistenceSettings, PostCacheSettings, Settings,
};
use magpie::tls::{CertStore, CertificateAuthority};

pub struct ProxyHandle {
    pub addr: SocketAddr,
    pub store: ResponseStore,
    shutdown: watch::Sender<bool>,
    _workspace: TempDir,
}

impl ProxyHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn test_settings(ca_dir: PathBuf) -> Settings {
    Settings {
        bind_address: "127.0.0.1".to_string(),
        proxy_port: 0,
        ca_dir,
        log: LogFormat::Text,
        max_cert_cache_entries: 64,
        client_timeout: 5,
        upstream_connect_timeout: 5,
        upstream_timeout: 5,
        max_request_header_size: 32 * 1024,
        max_response_header_size: 32 * 1024,
        max_request_body_size: 8 * 1024 * 1024,
        cache: CacheSettings {
            default_ttl: 300,
            negative_ttl: 1,
            max_size_mb: 16,
            ignore_no_cache: false,
            cacheable_types: vec![
                "text/html".to_string(),
                "text/plain".to_string(),
                "application/json".to_string(),
            ],
            post_cache: PostCacheSettings {
                enable: false,
                include_query_string: false,
                max_request_body_size_mb: 1,
                max_response_body_size_mb: 1,
            },
        },
        persistence: PersistenceSettings {
            enable: false,
            cache_file: PathBuf::from("cache.bin"),
            auto_save_interval: 300,
        },
        loaded_path: None,
    }
}

/// Spawn the full proxy stack on an ephemeral port.
pub async fn spawn(mut settings: Settings, tls_client: Arc<ClientConfig>) -> Result<ProxyHandle> {
    let workspace = TempDir::new()?;
    if settings.ca_dir.as_os_str().is_empty() {
        settings.ca_dir = workspace.path().join("ca");
    }

    let ca = Arc::new(CertificateAuthority::load_or_generate(&settings.ca_dir)?);
    let certs = Arc::new(CertStore::new(ca, settings.max_cert_cache_entries));
    let store = ResponseStore::new(settings.max_cache_bytes());
    if settings.persistence.enable && settings.persistence.cache_file.exists() {
        store.load(&settings.persistence.cache_file)?;
    }

    let settings = Arc::new(settings);
    let (_policy_tx, policy_rx) =
        watch::channel(Arc::new(CachePolicy::from_settings(&settings)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = AppContext::new(
        settings.clone(),
        PolicyStore::new(policy_rx),
        store.clone(),
        certs,
        tls_client,
    );

    let listener = listener::bind(settings.listen()?).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(listener::serve(listener, app, shutdown_rx));

    Ok(ProxyHandle {
        addr,
        store,
        shutdown: shutdown_tx,
        _workspace: workspace,
    })
}
