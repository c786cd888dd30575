use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::warn;

use crate::cli::{Cli, LogFormat};

/// Hard ceiling for the POST cache body gates. Configured values above this
/// are clamped at load time.
pub const MAX_POST_CACHE_BODY_SIZE_MB: u64 = 50;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_max_cert_cache_entries() -> usize {
    1000
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_default_ttl() -> u64 {
    3600
}

fn default_negative_ttl() -> u64 {
    10
}

fn default_max_size_mb() -> u64 {
    500
}

fn default_cacheable_types() -> Vec<String> {
    vec![
        "text/html".to_string(),
        "text/css".to_string(),
        "application/javascript".to_string(),
        "application/json".to_string(),
        "text/plain".to_string(),
    ]
}

fn default_post_body_size_mb() -> u64 {
    10
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("cache.bin")
}

fn default_auto_save_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_max_cert_cache_entries")]
    pub max_cert_cache_entries: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    /// Path the settings were loaded from, kept so SIGHUP can re-read the
    /// same file. Not part of the configuration surface.
    #[serde(skip)]
    pub loaded_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// TTL in seconds for cached 2xx/3xx responses.
    #[serde(default = "default_default_ttl")]
    pub default_ttl: u64,
    /// TTL in seconds for cached 4xx/5xx responses.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u64,
    /// Cache size ceiling in megabytes of body bytes. 0 means unlimited.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default)]
    pub ignore_no_cache: bool,
    #[serde(default = "default_cacheable_types")]
    pub cacheable_types: Vec<String>,
    #[serde(default)]
    pub post_cache: PostCacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostCacheSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub include_query_string: bool,
    #[serde(default = "default_post_body_size_mb")]
    pub max_request_body_size_mb: u64,
    #[serde(default = "default_post_body_size_mb")]
    pub max_response_body_size_mb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
    /// Interval in seconds between automatic cache snapshots.
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: default_default_ttl(),
            negative_ttl: default_negative_ttl(),
            max_size_mb: default_max_size_mb(),
            ignore_no_cache: false,
            cacheable_types: default_cacheable_types(),
            post_cache: PostCacheSettings::default(),
        }
    }
}

impl Default for PostCacheSettings {
    fn default() -> Self {
        Self {
            enable: false,
            include_query_string: false,
            max_request_body_size_mb: default_post_body_size_mb(),
            max_response_body_size_mb: default_post_body_size_mb(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enable: false,
            cache_file: default_cache_file(),
            auto_save_interval: default_auto_save_interval(),
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(resolve_config_path(cli))
    }

    /// Load settings from an optional config file path. Missing file means
    /// pure defaults plus environment overrides.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path.as_ref() {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("MAGPIE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.loaded_path = config_path.clone();
        if let Some(path) = config_path.as_ref() {
            settings.apply_base_dir(path);
        }
        settings.clamp_post_cache_limits();
        settings.validate()?;
        Ok(settings)
    }

    /// Re-read the configuration this process started with. Used by the
    /// SIGHUP handler to refresh runtime-tunable cache policy.
    pub fn reload(&self) -> Result<Self> {
        Self::load_from(self.loaded_path.clone())
    }

    pub fn listen(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.proxy_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid listen address '{}:{}'",
                    self.bind_address, self.proxy_port
                )
            })
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.cache.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.persistence.auto_save_interval)
    }

    fn clamp_post_cache_limits(&mut self) {
        let post = &mut self.cache.post_cache;
        if post.max_request_body_size_mb > MAX_POST_CACHE_BODY_SIZE_MB {
            warn!(
                configured_mb = post.max_request_body_size_mb,
                limit_mb = MAX_POST_CACHE_BODY_SIZE_MB,
                "post_cache.max_request_body_size_mb exceeds hard limit; clamping"
            );
            post.max_request_body_size_mb = MAX_POST_CACHE_BODY_SIZE_MB;
        }
        if post.max_response_body_size_mb > MAX_POST_CACHE_BODY_SIZE_MB {
            warn!(
                configured_mb = post.max_response_body_size_mb,
                limit_mb = MAX_POST_CACHE_BODY_SIZE_MB,
                "post_cache.max_response_body_size_mb exceeds hard limit; clamping"
            );
            post.max_response_body_size_mb = MAX_POST_CACHE_BODY_SIZE_MB;
        }
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.ca_dir = absolutize(&self.ca_dir, base_dir);
        self.persistence.cache_file = absolutize(&self.persistence.cache_file, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.cache.default_ttl > 0,
            "cache.default_ttl must be greater than 0 seconds (got {})",
            self.cache.default_ttl
        );
        ensure!(
            self.cache.negative_ttl > 0,
            "cache.negative_ttl must be greater than 0 seconds (got {})",
            self.cache.negative_ttl
        );
        if self.persistence.enable {
            ensure!(
                self.persistence.auto_save_interval > 0,
                "persistence.auto_save_interval must be greater than 0 seconds (got {})",
                self.persistence.auto_save_interval
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Some(path.to_path_buf());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("magpie.toml"),
        PathBuf::from("/etc/magpie/magpie.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
