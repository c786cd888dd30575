use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::sync::watch;

use crate::settings::Settings;

/// Runtime-tunable caching rules. Handlers read an immutable snapshot per
/// request; SIGHUP publishes a replacement without touching cache contents.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub default_ttl: Duration,
    pub negative_ttl: Duration,
    pub ignore_no_cache: bool,
    pub cacheable_types: Vec<String>,
    pub post_cache: PostCachePolicy,
}

#[derive(Debug, Clone)]
pub struct PostCachePolicy {
    pub enable: bool,
    pub include_query_string: bool,
    pub max_request_body_size: u64,
    pub max_response_body_size: u64,
}

impl CachePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        let cache = &settings.cache;
        Self {
            default_ttl: Duration::from_secs(cache.default_ttl),
            negative_ttl: Duration::from_secs(cache.negative_ttl),
            ignore_no_cache: cache.ignore_no_cache,
            cacheable_types: cache.cacheable_types.clone(),
            post_cache: PostCachePolicy {
                enable: cache.post_cache.enable,
                include_query_string: cache.post_cache.include_query_string,
                max_request_body_size: cache.post_cache.max_request_body_size_mb * 1024 * 1024,
                max_response_body_size: cache.post_cache.max_response_body_size_mb * 1024 * 1024,
            },
        }
    }

    /// A request may consult the cache when it is a GET, or a POST while
    /// POST caching is enabled.
    pub fn is_keyable(&self, method: &Method) -> bool {
        *method == Method::GET || (*method == Method::POST && self.post_cache.enable)
    }

    /// Whether a response may be stored: the content type must match the
    /// allow-list, and unless configured otherwise the origin must not have
    /// asked for no-cache/no-store.
    pub fn is_cacheable(&self, headers: &[(String, String)]) -> bool {
        let content_type = first_header(headers, "content-type").unwrap_or("");
        let bare_type = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim();
        if !self
            .cacheable_types
            .iter()
            .any(|allowed| bare_type.starts_with(allowed.as_str()))
        {
            return false;
        }

        if !self.ignore_no_cache {
            let cache_control = first_header(headers, "cache-control").unwrap_or("");
            if cache_control.contains("no-cache") || cache_control.contains("no-store") {
                return false;
            }
            if first_header(headers, "pragma") == Some("no-cache") {
                return false;
            }
        }

        true
    }

    /// Error responses live for the negative TTL so transient faults clear
    /// quickly; everything else gets the default TTL.
    pub fn ttl_for(&self, status: u16) -> Duration {
        if (400..=599).contains(&status) {
            self.negative_ttl
        } else {
            self.default_ttl
        }
    }
}

fn first_header<'a>(headers: &'a [(String, String)], lower_name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(lower_name))
        .map(|(_, value)| value.as_str())
}

/// Shared handle to the latest policy snapshot.
#[derive(Clone)]
pub struct PolicyStore {
    rx: watch::Receiver<Arc<CachePolicy>>,
}

impl PolicyStore {
    pub fn new(rx: watch::Receiver<Arc<CachePolicy>>) -> Self {
        Self { rx }
    }

    pub fn snapshot(&self) -> Arc<CachePolicy> {
        self.rx.borrow().clone()
    }
}
