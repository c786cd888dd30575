use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use lru::LruCache;
use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use tracing::debug;

use super::ca::CertificateAuthority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertStoreStats {
    pub entries: usize,
    pub evictions: u64,
    pub max_entries: usize,
}

/// LRU-bounded cache of leaf certificates keyed by CONNECT authority.
///
/// Hits take the read lock, then briefly re-acquire the write lock to
/// promote; a promotion lost to a concurrent eviction is tolerated. Misses
/// mint under the write lock with a double-check, so a host is never minted
/// twice concurrently. `max_entries` of zero means unbounded.
pub struct CertStore {
    ca: Arc<CertificateAuthority>,
    inner: RwLock<LruCache<String, Arc<CertifiedKey>>>,
    max_entries: usize,
    evictions: AtomicU64,
}

impl CertStore {
    pub fn new(ca: Arc<CertificateAuthority>, max_entries: usize) -> Self {
        Self {
            ca,
            inner: RwLock::new(LruCache::unbounded()),
            max_entries,
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the cached certificate for `host`, minting one on first use.
    pub fn obtain(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        {
            let guard = self.inner.read();
            if let Some(certified) = guard.peek(host) {
                let certified = certified.clone();
                drop(guard);
                let mut guard = self.inner.write();
                // Promote only if the entry survived the lock gap.
                let _ = guard.get(host);
                debug!(host, "certificate cache hit");
                return Ok(certified);
            }
        }

        let mut guard = self.inner.write();
        if let Some(certified) = guard.get(host) {
            return Ok(certified.clone());
        }

        debug!(host, "certificate cache miss; minting new leaf");
        let certified = self.ca.mint_leaf(host)?;

        if self.max_entries > 0
            && guard.len() >= self.max_entries
            && guard.pop_lru().is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        guard.put(host.to_string(), certified.clone());
        Ok(certified)
    }

    pub fn stats(&self) -> CertStoreStats {
        CertStoreStats {
            entries: self.inner.read().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            max_entries: self.max_entries,
        }
    }
}
