use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::entry::CachedResponse;

/// Fixed cadence of the background expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub current_size: u64,
    pub max_size: u64,
    pub uptime_seconds: f64,
}

/// Size-bounded LRU store of fingerprint -> cached response.
///
/// A single mutex covers the map, the recency order, and the byte
/// accounting; hit/miss/eviction counters are atomics. `max_size` of zero
/// disables eviction entirely.
#[derive(Clone)]
pub struct ResponseStore {
    inner: Arc<StoreShared>,
}

struct StoreShared {
    state: Mutex<StoreState>,
    max_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    start_time: Instant,
}

struct StoreState {
    lru: LruCache<String, CachedResponse>,
    current_size: u64,
}

impl ResponseStore {
    pub fn new(max_size: u64) -> Self {
        Self {
            inner: Arc::new(StoreShared {
                state: Mutex::new(StoreState {
                    lru: LruCache::unbounded(),
                    current_size: 0,
                }),
                max_size,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    /// Fetch an entry and promote it to most-recently-used. Expired entries
    /// are removed on the spot and count as misses.
    pub fn lookup(&self, fingerprint: &str) -> Option<CachedResponse> {
        let mut state = self.inner.state.lock();
        let now = SystemTime::now();

        match state.lru.get(fingerprint) {
            Some(entry) if entry.is_expired(now) => {}
            Some(entry) => {
                let entry = entry.clone();
                drop(state);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry);
            }
            None => {
                drop(state);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        if let Some(removed) = state.lru.pop(fingerprint) {
            state.current_size = state.current_size.saturating_sub(removed.body_size);
            trace!(fingerprint, "removed expired cache entry on lookup");
        }
        drop(state);
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert an entry with the caller-chosen TTL, evicting from the LRU
    /// tail until the new entry fits. An entry bigger than the whole cache
    /// is dropped without evicting anything.
    pub fn insert(&self, fingerprint: String, mut entry: CachedResponse, ttl: Duration) {
        let max_size = self.inner.max_size;
        if max_size > 0 && entry.body_size > max_size {
            debug!(
                fingerprint,
                body_size = entry.body_size,
                max_size,
                "entry exceeds cache capacity; not cached"
            );
            return;
        }
        entry.expires_at = SystemTime::now() + ttl;

        let mut state = self.inner.state.lock();
        if let Some(old) = state.lru.pop(&fingerprint) {
            state.current_size = state.current_size.saturating_sub(old.body_size);
        }

        while max_size > 0 && state.current_size + entry.body_size > max_size {
            match state.lru.pop_lru() {
                Some((_, evicted)) => {
                    state.current_size = state.current_size.saturating_sub(evicted.body_size);
                    self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        state.current_size += entry.body_size;
        state.lru.put(fingerprint, entry);
    }

    /// Remove every entry and reset the counters. Configuration (size
    /// ceiling, start time) is untouched.
    pub fn purge_all(&self) -> usize {
        let mut state = self.inner.state.lock();
        let count = state.lru.len();
        state.lru.clear();
        state.current_size = 0;
        drop(state);
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.evictions.store(0, Ordering::Relaxed);
        count
    }

    pub fn purge_one(&self, fingerprint: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.lru.pop(fingerprint) {
            Some(removed) => {
                state.current_size = state.current_size.saturating_sub(removed.body_size);
                true
            }
            None => false,
        }
    }

    /// Remove entries whose fingerprint URL host starts with `host`.
    /// Prefix match, so purging "example.com" also drops
    /// "example.com.evil.net"; this mirrors the reference behavior.
    pub fn purge_by_host(&self, host: &str) -> usize {
        let mut state = self.inner.state.lock();
        let matching: Vec<String> = state
            .lru
            .iter()
            .filter_map(|(fingerprint, _)| {
                let uri: http::Uri = fingerprint.parse().ok()?;
                let entry_host = uri.host()?;
                entry_host.starts_with(host).then(|| fingerprint.clone())
            })
            .collect();

        let mut count = 0;
        for fingerprint in matching {
            if let Some(removed) = state.lru.pop(&fingerprint) {
                state.current_size = state.current_size.saturating_sub(removed.body_size);
                count += 1;
            }
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, current_size) = {
            let state = self.inner.state.lock();
            (state.lru.len(), state.current_size)
        };
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            entry_count,
            current_size,
            max_size: self.inner.max_size,
            uptime_seconds: self.inner.start_time.elapsed().as_secs_f64(),
        }
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    /// Drop every expired entry. Called by the sweeper; exposed for tests.
    pub fn remove_expired(&self) -> usize {
        let mut state = self.inner.state.lock();
        let now = SystemTime::now();
        let expired: Vec<String> = state
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();

        let mut removed = 0;
        for fingerprint in expired {
            if let Some(entry) = state.lru.pop(&fingerprint) {
                state.current_size = state.current_size.saturating_sub(entry.body_size);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expiry sweep removed stale cache entries");
        }
        removed
    }

    /// Long-lived expiry sweeper tied to the store. Stops when the shutdown
    /// channel flips to true or its sender side is dropped.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.remove_expired();
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

    pub(super) fn snapshot_entries(&self) -> Vec<(String, CachedResponse)> {
        let state = self.inner.state.lock();
        state
            .lru
            .iter()
            .map(|(fingerprint, entry)| (fingerprint.clone(), entry.clone()))
            .collect()
    }

    /// Replace the in-memory state with loaded entries. Entries must already
    /// be filtered; `current_size` is recomputed here. Order of the iterator
    /// is arbitrary, so LRU order after a load is undefined.
    pub(super) fn replace_entries(&self, entries: Vec<(String, CachedResponse)>) {
        let mut state = self.inner.state.lock();
        state.lru.clear();
        state.current_size = 0;
        for (fingerprint, entry) in entries {
            state.current_size += entry.body_size;
            state.lru.put(fingerprint, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(body: &[u8]) -> CachedResponse {
        CachedResponse::new(
            200,
            vec![("Content-Type".to_string(), "text/plain".to_string())],
            Bytes::copy_from_slice(body),
        )
    }

    fn ttl() -> Duration {
        Duration::from_secs(60)
    }

    #[test]
    fn lookup_miss_increments_misses() {
        let store = ResponseStore::new(0);
        assert!(store.lookup("http://a/1").is_none());
        let stats = store.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn insert_then_lookup_hits() {
        let store = ResponseStore::new(0);
        store.insert("http://a/1".to_string(), entry(b"hello"), ttl());
        let hit = store.lookup("http://a/1").expect("entry should be cached");
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body.as_ref(), b"hello");
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn recently_used_entry_survives_eviction() {
        // A, C, D each 4 bytes; ceiling fits three entries of this size.
        let store = ResponseStore::new(12);
        store.insert("http://x/a".to_string(), entry(b"aaaa"), ttl());
        store.insert("http://x/b".to_string(), entry(b"bbbb"), ttl());
        store.insert("http://x/c".to_string(), entry(b"cccc"), ttl());
        // Touch A so B becomes the LRU tail.
        assert!(store.lookup("http://x/a").is_some());
        store.insert("http://x/d".to_string(), entry(b"dddd"), ttl());

        assert!(store.lookup("http://x/b").is_none(), "B should be evicted");
        assert!(store.lookup("http://x/a").is_some());
        assert!(store.lookup("http://x/c").is_some());
        assert!(store.lookup("http://x/d").is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn size_accounting_matches_entries() {
        let store = ResponseStore::new(100);
        store.insert("http://x/a".to_string(), entry(b"12345"), ttl());
        store.insert("http://x/b".to_string(), entry(b"123"), ttl());
        assert_eq!(store.stats().current_size, 8);

        // Replacement accounts the old size out.
        store.insert("http://x/a".to_string(), entry(b"12"), ttl());
        assert_eq!(store.stats().current_size, 5);
        assert_eq!(store.stats().entry_count, 2);

        assert!(store.purge_one("http://x/b"));
        assert_eq!(store.stats().current_size, 2);
    }

    #[test]
    fn oversized_entry_is_rejected_without_eviction() {
        let store = ResponseStore::new(4);
        store.insert("http://x/small".to_string(), entry(b"ab"), ttl());
        store.insert("http://x/huge".to_string(), entry(b"abcdefgh"), ttl());

        assert!(store.lookup("http://x/huge").is_none());
        assert!(store.lookup("http://x/small").is_some());
        assert_eq!(store.stats().evictions, 0);
        assert_eq!(store.stats().current_size, 2);
    }

    #[test]
    fn expired_entry_is_removed_on_lookup() {
        let store = ResponseStore::new(0);
        store.insert(
            "http://x/ttl".to_string(),
            entry(b"old"),
            Duration::from_millis(100),
        );
        std::thread::sleep(Duration::from_millis(150));
        assert!(store.lookup("http://x/ttl").is_none());
        let stats = store.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.current_size, 0);
    }

    #[test]
    fn negative_ttl_is_independent_of_default() {
        let store = ResponseStore::new(0);
        store.insert(
            "http://x/ok".to_string(),
            entry(b"ok"),
            Duration::from_millis(300),
        );
        let mut missing = entry(b"nope");
        missing.status = 404;
        store.insert(
            "http://x/missing".to_string(),
            missing,
            Duration::from_millis(100),
        );

        std::thread::sleep(Duration::from_millis(150));
        assert!(store.lookup("http://x/ok").is_some(), "200 still fresh");
        assert!(
            store.lookup("http://x/missing").is_none(),
            "404 expired first"
        );
    }

    #[test]
    fn purge_all_resets_counters_but_not_config() {
        let store = ResponseStore::new(1024);
        store.insert("http://x/a".to_string(), entry(b"a"), ttl());
        store.lookup("http://x/a");
        store.lookup("http://x/gone");

        assert_eq!(store.purge_all(), 1);
        let stats = store.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.max_size, 1024);
    }

    #[test]
    fn purge_by_host_matches_prefix() {
        let store = ResponseStore::new(0);
        store.insert("http://example.com/a".to_string(), entry(b"a"), ttl());
        store.insert("http://example.com:8080/b".to_string(), entry(b"b"), ttl());
        store.insert("http://other.net/c".to_string(), entry(b"c"), ttl());

        assert_eq!(store.purge_by_host("example.com"), 2);
        assert_eq!(store.stats().entry_count, 1);
        assert!(store.lookup("http://other.net/c").is_some());
    }

    #[test]
    fn remove_expired_sweeps_only_stale_entries() {
        let store = ResponseStore::new(0);
        store.insert(
            "http://x/stale".to_string(),
            entry(b"stale"),
            Duration::from_millis(10),
        );
        store.insert("http://x/fresh".to_string(), entry(b"fresh"), ttl());
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.remove_expired(), 1);
        let stats = store.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.current_size, 5);
    }

    #[test]
    fn concurrent_mixed_operations_keep_invariants() {
        use std::thread;

        let store = ResponseStore::new(64 * 1024);
        let mut handles = Vec::new();
        for worker in 0..10 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("http://load.test/{}", (worker * 31 + i) % 100);
                    if i % 3 == 0 {
                        store.insert(key, entry(&[b'x'; 512]), Duration::from_secs(30));
                    } else {
                        store.lookup(&key);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker should not panic");
        }

        let stats = store.stats();
        let state = store.snapshot_entries();
        let computed: u64 = state.iter().map(|(_, e)| e.body_size).sum();
        assert_eq!(stats.current_size, computed);
        assert!(stats.current_size <= 64 * 1024);
        assert!(stats.entry_count <= (64 * 1024) / 512);
    }
}
