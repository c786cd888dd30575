use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single cached HTTP response.
///
/// Header lines keep origin order and duplicates; the body is an immutable
/// shared buffer, so concurrent readers of the same entry never copy it.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub expires_at: SystemTime,
    pub body_size: u64,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        let body_size = body.len() as u64;
        Self {
            status,
            headers,
            body,
            expires_at: SystemTime::UNIX_EPOCH,
            body_size,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(lower_name))
            .map(|(_, value)| value.as_str())
    }
}

/// On-disk form of a cache entry. Only the key -> entry view is persisted;
/// LRU order and counters are not.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PersistedEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub expires_at_unix: u64,
}

impl PersistedEntry {
    pub(super) fn from_entry(entry: &CachedResponse) -> Self {
        let expires_at_unix = entry
            .expires_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.to_vec(),
            expires_at_unix,
        }
    }

    pub(super) fn into_entry(self) -> CachedResponse {
        let expires_at = SystemTime::UNIX_EPOCH + Duration::from_secs(self.expires_at_unix);
        let body = Bytes::from(self.body);
        let body_size = body.len() as u64;
        CachedResponse {
            status: self.status,
            headers: self.headers,
            body,
            expires_at,
            body_size,
        }
    }
}
