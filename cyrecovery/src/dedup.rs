//! Duplicate-reception detection by content fingerprint.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use cyevent::{
    metrics::{names, NoopMetrics},
    MetricsSink,
};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// Entries the cache holds before evicting its least-recently-used.
const DEFAULT_MAX_SIZE: usize = 1000;
/// How long an entry stays valid.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// The Full Fingerprint: deterministic for the same logical packet across
/// reception events, regardless of which retransmission delivered it.
///
/// `msg_id` alone would collide across reconnects; the packet type and the
/// truncated payload digest disambiguate.
pub fn dedup_key(packet_type: u8, endpoint: &[u8], msg_id: &[u8], payload: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(payload));
    format!(
        "{:02x}|{}|{}|{}",
        packet_type,
        hex::encode(endpoint),
        hex::encode(msg_id),
        &digest[..16],
    )
}

/// One remembered reception.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub dedup_key: String,
    pub correlation_id: Uuid,
    pub inserted_at: Instant,
}

struct Slot {
    correlation_id: Uuid,
    inserted_at: Instant,
    recency: u64,
}

struct Cache {
    max_size: usize,
    ttl: Duration,
    slots: HashMap<String, Slot>,
    // recency order: lowest key is the least recently used
    order: BTreeMap<u64, String>,
    next_recency: u64,
    hits: u64,
    evictions: u64,
}

impl Cache {
    fn touch(&mut self, key: &str) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        self.order.remove(&slot.recency);
        slot.recency = self.next_recency;
        self.order.insert(self.next_recency, key.to_owned());
        self.next_recency += 1;
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.recency);
        Some(slot)
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.slots.remove(&key);
            self.evictions += 1;
        }
    }
}

/// A size-bounded, TTL-expired, strictly-LRU duplicate cache.
///
/// The cache has its own lock; lookups are read-mostly and never nest
/// inside the connection state lock.
#[derive(Clone)]
pub struct ArcDedupCache {
    inner: Arc<Mutex<Cache>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for ArcDedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)
    }
}

impl ArcDedupCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self::with_metrics(max_size, ttl, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(max_size: usize, ttl: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        assert!(max_size > 0, "a zero-sized dedup cache remembers nothing");
        Self {
            inner: Arc::new(Mutex::new(Cache {
                max_size,
                ttl,
                slots: HashMap::with_capacity(max_size),
                order: BTreeMap::new(),
                next_recency: 0,
                hits: 0,
                evictions: 0,
            })),
            metrics,
        }
    }

    /// Whether `key` names a live remembered reception. A hit refreshes
    /// the entry's recency; an expired entry counts as absent.
    pub fn contains(&self, key: &str) -> bool {
        let mut cache = self.inner.lock().unwrap();
        let live = cache
            .slots
            .get(key)
            .map(|slot| slot.inserted_at.elapsed() <= cache.ttl);
        match live {
            Some(true) => {
                cache.touch(key);
                cache.hits += 1;
                let hits = cache.hits;
                drop(cache);
                self.metrics
                    .incr_counter(names::DEDUP_CACHE_HITS_TOTAL, &[], 1);
                tracing::trace!(%key, hits, "dedup cache hit");
                true
            }
            Some(false) => {
                cache.remove(key);
                self.record_size(&mut cache);
                false
            }
            None => false,
        }
    }

    /// Remember a reception, evicting the least recently used entry when
    /// full.
    pub fn add(&self, key: impl Into<String>, correlation_id: Uuid) {
        let key = key.into();
        let mut cache = self.inner.lock().unwrap();
        if let Some(previous) = cache.remove(&key) {
            tracing::trace!(%key, previous = %previous.correlation_id, "dedup key re-added");
        }
        let mut evicted = 0;
        while cache.slots.len() >= cache.max_size {
            cache.evict_lru();
            evicted += 1;
        }
        if evicted > 0 {
            self.metrics
                .incr_counter(names::DEDUP_CACHE_EVICTIONS_TOTAL, &[], evicted);
        }
        let recency = cache.next_recency;
        cache.next_recency += 1;
        cache.slots.insert(
            key.clone(),
            Slot {
                correlation_id,
                inserted_at: Instant::now(),
                recency,
            },
        );
        cache.order.insert(recency, key);
        self.record_size(&mut cache);
    }

    /// Drop every entry whose TTL has lapsed.
    pub fn cleanup_expired(&self) -> usize {
        let mut cache = self.inner.lock().unwrap();
        let ttl = cache.ttl;
        let expired: Vec<String> = cache
            .slots
            .iter()
            .filter(|(_, slot)| slot.inserted_at.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.remove(key);
        }
        if !expired.is_empty() {
            self.record_size(&mut cache);
        }
        expired.len()
    }

    /// The entry for `key`, if live.
    pub fn entry(&self, key: &str) -> Option<DedupEntry> {
        let cache = self.inner.lock().unwrap();
        let slot = cache.slots.get(key)?;
        (slot.inserted_at.elapsed() <= cache.ttl).then(|| DedupEntry {
            dedup_key: key.to_owned(),
            correlation_id: slot.correlation_id,
            inserted_at: slot.inserted_at,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.inner.lock().unwrap().hits
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().unwrap().evictions
    }

    fn record_size(&self, cache: &mut Cache) {
        self.metrics
            .set_gauge(names::DEDUP_CACHE_SIZE, &[], cache.slots.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_structured() {
        let key = dedup_key(0x73, &[1, 2, 3, 4, 5], &[0, 1], b"payload");
        let again = dedup_key(0x73, &[1, 2, 3, 4, 5], &[0, 1], b"payload");
        assert_eq!(key, again);
        assert!(key.starts_with("73|0102030405|0001|"));
        // 16 hex chars of payload digest
        assert_eq!(key.rsplit('|').next().unwrap().len(), 16);
    }

    #[test]
    fn same_msg_id_different_payload_gets_a_different_key() {
        let a = dedup_key(0x73, &[1, 2, 3, 4, 5], &[0, 1], b"on");
        let b = dedup_key(0x73, &[1, 2, 3, 4, 5], &[0, 1], b"off");
        assert_ne!(a, b);
        let c = dedup_key(0x83, &[1, 2, 3, 4, 5], &[0, 1], b"on");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn contains_after_add_and_never_beyond_capacity() {
        let cache = ArcDedupCache::new(3, Duration::from_secs(300));
        for n in 0..10 {
            cache.add(format!("key-{n}"), Uuid::now_v7());
            assert!(cache.len() <= 3);
        }
        assert!(cache.contains("key-9"));
        assert!(!cache.contains("key-0"));
        assert_eq!(cache.evictions(), 7);
    }

    #[tokio::test]
    async fn eviction_is_strictly_least_recently_used() {
        let cache = ArcDedupCache::new(3, Duration::from_secs(300));
        cache.add("a", Uuid::now_v7());
        cache.add("b", Uuid::now_v7());
        cache.add("c", Uuid::now_v7());
        // touching "a" makes "b" the eviction candidate
        assert!(cache.contains("a"));
        cache.add("d", Uuid::now_v7());
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let cache = ArcDedupCache::new(10, Duration::from_secs(300));
        let correlation_id = Uuid::now_v7();
        cache.add("stale", correlation_id);
        assert_eq!(cache.entry("stale").unwrap().correlation_id, correlation_id);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!cache.contains("stale"));
        assert!(cache.entry("stale").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_expired_reaps_in_bulk() {
        let cache = ArcDedupCache::new(10, Duration::from_secs(300));
        cache.add("old-1", Uuid::now_v7());
        cache.add("old-2", Uuid::now_v7());
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.add("young", Uuid::now_v7());
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("young"));
    }
}
