pub mod codec;
pub mod connect;
pub mod http;
pub mod listener;
pub mod request;
pub mod upstream;

use std::sync::Arc;

use rustls::ClientConfig;

use crate::{
    cache::{PolicyStore, ResponseStore},
    settings::Settings,
    tls::CertStore,
};

/// Everything a connection handler needs, cheaply cloneable per task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub policy: PolicyStore,
    pub store: ResponseStore,
    pub certs: Arc<CertStore>,
    pub tls_client: Arc<ClientConfig>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        policy: PolicyStore,
        store: ResponseStore,
        certs: Arc<CertStore>,
        tls_client: Arc<ClientConfig>,
    ) -> Self {
        Self {
            settings,
            policy,
            store,
            certs,
            tls_client,
        }
    }

    pub(crate) fn forward_options(&self) -> upstream::ForwardOptions {
        upstream::ForwardOptions {
            connect_timeout: self.settings.upstream_connect_timeout(),
            io_timeout: self.settings.upstream_timeout(),
            max_response_header_size: self.settings.max_response_header_size,
        }
    }
}
