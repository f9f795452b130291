//! # Avatar Cache
//!
//! In-memory map of `(owner, version)` to avatar payload, filled from the
//! storage collaborator on miss.
//!
//! * Concurrent misses for one key share a single storage fetch.
//! * Resident bytes are bounded by a budget; least recently used entries are
//!   evicted first, except entries pinned by an outstanding [`AvatarLease`].
//! * Invalidated keys are tombstoned so a fetch that was already in flight
//!   cannot bring the avatar back.
//! * Storage outages are never cached.

mod lease;

pub use lease::AvatarLease;

use crate::config::CacheConfig;
use crate::error::AvatarError;
use crate::plugins::storage::{AvatarStore, StoreError};
use crate::types::{AvatarKey, AvatarVersion, ContentHash, PlayerIdentity};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// One immutable avatar payload. A new version is always a new record.
#[derive(Debug)]
pub struct AvatarRecord {
    pub key: AvatarKey,
    pub payload: Bytes,
    pub hash: ContentHash,
}

impl AvatarRecord {
    pub fn new(key: AvatarKey, payload: Bytes) -> Self {
        let hash = ContentHash::of(&payload);
        Self { key, payload, hash }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

struct CacheEntry {
    record: Arc<AvatarRecord>,
    last_access: AtomicU64,
    leases: Arc<AtomicUsize>,
}

type FetchResult = Result<Arc<AvatarRecord>, AvatarError>;
type PendingFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub evictions: u64,
    pub entries: usize,
    pub resident_bytes: usize,
}

/// Shared avatar cache. Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct AvatarCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: Arc<dyn AvatarStore>,
    byte_budget: usize,
    entries: DashMap<AvatarKey, CacheEntry>,
    pending: DashMap<AvatarKey, PendingFetch>,
    tombstones: DashSet<AvatarKey>,
    resident_bytes: AtomicUsize,
    /// Logical access clock; monotonic, so ties between accesses cannot occur.
    clock: AtomicU64,
    eviction: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

impl AvatarCache {
    pub fn new(store: Arc<dyn AvatarStore>, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                byte_budget: config.byte_budget,
                entries: DashMap::new(),
                pending: DashMap::new(),
                tombstones: DashSet::new(),
                resident_bytes: AtomicUsize::new(0),
                clock: AtomicU64::new(0),
                eviction: Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the avatar, fetching it from storage on a miss.
    ///
    /// # Arguments
    ///
    /// * `owner` - Identity whose avatar is requested
    /// * `version` - Exact version to resolve
    ///
    /// # Returns
    ///
    /// A lease that keeps the entry resident until dropped, `NotFound` if
    /// the store has no such avatar or it was invalidated, or
    /// `StorageUnavailable` on a transient store failure.
    pub async fn get(
        &self,
        owner: &PlayerIdentity,
        version: AvatarVersion,
    ) -> Result<AvatarLease, AvatarError> {
        let key = AvatarKey::new(owner.clone(), version);

        if let Some(lease) = self.inner.lease_resident(&key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            trace!("Cache hit for {}", key);
            return Ok(lease);
        }

        if self.inner.tombstones.contains(&key) {
            return Err(AvatarError::NotFound(key));
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        let record = self.inner.pending_fetch(&key).await?;

        // The fetch inserted the record, but it may have been evicted or
        // invalidated since; a detached lease still carries the bytes.
        Ok(self
            .inner
            .lease_resident(&key)
            .unwrap_or_else(|| AvatarLease::detached(record)))
    }

    /// Drops a key and tombstones it. Later gets return `NotFound`.
    ///
    /// Returns true if the entry was resident.
    pub fn invalidate(&self, owner: &PlayerIdentity, version: AvatarVersion) -> bool {
        let key = AvatarKey::new(owner.clone(), version);
        self.inner.tombstones.insert(key.clone());
        let removed = self.inner.remove_entry(&key);
        debug!("🗑️ Invalidated avatar {} (resident: {})", key, removed);
        removed
    }

    pub fn is_invalidated(&self, owner: &PlayerIdentity, version: AvatarVersion) -> bool {
        self.inner
            .tombstones
            .contains(&AvatarKey::new(owner.clone(), version))
    }

    /// Drops unpinned entries of `owner` older than `current`; they will not
    /// be requested again once the owner has moved on. Tombstones of those
    /// versions go with them.
    pub fn retire_older(&self, owner: &PlayerIdentity, current: AvatarVersion) -> usize {
        self.inner
            .tombstones
            .retain(|key| key.owner != *owner || key.version >= current);

        let stale: Vec<AvatarKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().owner == *owner && entry.key().version < current)
            .map(|entry| entry.key().clone())
            .collect();

        let mut retired = 0;
        for key in &stale {
            let removed = self
                .inner
                .entries
                .remove_if(key, |_, entry| entry.leases.load(Ordering::Acquire) == 0);
            if let Some((_, entry)) = removed {
                self.inner
                    .resident_bytes
                    .fetch_sub(entry.record.size(), Ordering::AcqRel);
                retired += 1;
            }
        }
        retired
    }

    pub fn tombstone_count(&self) -> usize {
        self.inner.tombstones.len()
    }

    pub fn contains(&self, owner: &PlayerIdentity, version: AvatarVersion) -> bool {
        self.inner
            .entries
            .contains_key(&AvatarKey::new(owner.clone(), version))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            entries: self.inner.entries.len(),
            resident_bytes: self.inner.resident_bytes.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for AvatarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarCache")
            .field("byte_budget", &self.inner.byte_budget)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CacheInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Pins a resident entry. The shard read lock is held while the pin is
    /// taken, so eviction (which needs the write lock) observes it.
    fn lease_resident(&self, key: &AvatarKey) -> Option<AvatarLease> {
        let entry = self.entries.get(key)?;
        entry.last_access.store(self.tick(), Ordering::Relaxed);
        Some(AvatarLease::pinned(
            Arc::clone(&entry.record),
            Arc::clone(&entry.leases),
        ))
    }

    /// Returns the in-flight fetch for `key`, starting one if there is none.
    fn pending_fetch(self: &Arc<Self>, key: &AvatarKey) -> PendingFetch {
        match self.pending.entry(key.clone()) {
            Entry::Occupied(pending) => pending.get().clone(),
            Entry::Vacant(slot) => {
                let inner = Arc::clone(self);
                let key = key.clone();
                let fetch = async move {
                    let result = inner.fetch(&key).await;
                    inner.pending.remove(&key);
                    result
                }
                .boxed()
                .shared();
                slot.insert(fetch.clone());
                fetch
            }
        }
    }

    async fn fetch(&self, key: &AvatarKey) -> FetchResult {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!("📦 Fetching avatar {} from storage", key);

        let payload = match self.store.fetch_avatar(&key.owner, key.version).await {
            Ok(payload) => payload,
            Err(StoreError::NotFound) => return Err(AvatarError::NotFound(key.clone())),
            Err(StoreError::Unavailable(reason)) => {
                warn!("⚠️ Storage unavailable while fetching {}: {}", key, reason);
                return Err(AvatarError::StorageUnavailable(reason));
            }
        };

        if self.tombstones.contains(key) {
            return Err(AvatarError::NotFound(key.clone()));
        }

        let record = Arc::new(AvatarRecord::new(key.clone(), payload));
        self.insert(Arc::clone(&record));

        // An invalidation may have landed between the check and the insert.
        if self.tombstones.contains(key) {
            self.remove_entry(key);
            return Err(AvatarError::NotFound(key.clone()));
        }

        Ok(record)
    }

    fn insert(&self, record: Arc<AvatarRecord>) {
        let size = record.size();
        let entry = CacheEntry {
            record: Arc::clone(&record),
            last_access: AtomicU64::new(self.tick()),
            leases: Arc::new(AtomicUsize::new(0)),
        };

        self.resident_bytes.fetch_add(size, Ordering::AcqRel);
        if let Some(previous) = self.entries.insert(record.key.clone(), entry) {
            self.resident_bytes
                .fetch_sub(previous.record.size(), Ordering::AcqRel);
        }

        self.evict_to_budget();
    }

    fn remove_entry(&self, key: &AvatarKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.resident_bytes
                    .fetch_sub(entry.record.size(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Evicts least recently used, unpinned entries until the budget holds.
    /// Only one caller evicts at a time; others skip.
    fn evict_to_budget(&self) {
        if self.resident_bytes.load(Ordering::Acquire) <= self.byte_budget {
            return;
        }
        let Ok(_guard) = self.eviction.try_lock() else {
            return;
        };

        while self.resident_bytes.load(Ordering::Acquire) > self.byte_budget {
            let victim = self
                .entries
                .iter()
                .filter(|entry| entry.leases.load(Ordering::Acquire) == 0)
                .min_by_key(|entry| entry.last_access.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else {
                debug!("Cache over budget but every entry is pinned");
                break;
            };

            if let Some((key, entry)) = self
                .entries
                .remove_if(&victim, |_, entry| entry.leases.load(Ordering::Acquire) == 0)
            {
                self.resident_bytes
                    .fetch_sub(entry.record.size(), Ordering::AcqRel);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("Evicted avatar {} ({} bytes)", key, entry.record.size());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::storage::MemoryStore;
    use std::time::Duration;

    fn cache_with(store: Arc<MemoryStore>, byte_budget: usize) -> AvatarCache {
        AvatarCache::new(store, &CacheConfig { byte_budget })
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(50)));
        store.put("bob", AvatarVersion(1), &b"bob-model"[..]);
        let cache = cache_with(Arc::clone(&store), 1024);
        let bob = PlayerIdentity::from("bob");

        let gets = (0..32).map(|_| {
            let cache = cache.clone();
            let bob = bob.clone();
            tokio::spawn(async move { cache.get(&bob, AvatarVersion(1)).await })
        });
        let results = futures::future::join_all(gets).await;

        for result in results {
            let lease = result.unwrap().unwrap();
            assert_eq!(lease.payload, Bytes::from_static(b"bob-model"));
        }
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn hits_do_not_touch_storage() {
        let store = Arc::new(MemoryStore::new());
        store.put("bob", AvatarVersion(1), &b"bob"[..]);
        let cache = cache_with(Arc::clone(&store), 1024);
        let bob = PlayerIdentity::from("bob");

        drop(cache.get(&bob, AvatarVersion(1)).await.unwrap());
        let lease = cache.get(&bob, AvatarVersion(1)).await.unwrap();

        assert_eq!(lease.hash, ContentHash::of(b"bob"));
        assert_eq!(store.fetch_count(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.resident_bytes, 3);
    }

    #[tokio::test]
    async fn storage_outage_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        store.put("bob", AvatarVersion(1), &b"bob"[..]);
        store.set_unavailable(true);
        let cache = cache_with(Arc::clone(&store), 1024);
        let bob = PlayerIdentity::from("bob");

        assert!(matches!(
            cache.get(&bob, AvatarVersion(1)).await,
            Err(AvatarError::StorageUnavailable(_))
        ));

        store.set_unavailable(false);
        assert!(cache.get(&bob, AvatarVersion(1)).await.is_ok());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn missing_avatar_is_not_found() {
        let cache = cache_with(Arc::new(MemoryStore::new()), 1024);
        let ghost = PlayerIdentity::from("ghost");
        assert_eq!(
            cache.get(&ghost, AvatarVersion(1)).await.unwrap_err(),
            AvatarError::NotFound(AvatarKey::new(ghost.clone(), AvatarVersion(1)))
        );
    }

    #[tokio::test]
    async fn evicts_least_recently_used_unpinned_entries() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b", "c"] {
            store.put(name, AvatarVersion(1), vec![0u8; 10]);
        }
        let cache = cache_with(Arc::clone(&store), 20);
        let (a, b, c) = (
            PlayerIdentity::from("a"),
            PlayerIdentity::from("b"),
            PlayerIdentity::from("c"),
        );

        let pinned_a = cache.get(&a, AvatarVersion(1)).await.unwrap();
        drop(cache.get(&b, AvatarVersion(1)).await.unwrap());
        drop(cache.get(&c, AvatarVersion(1)).await.unwrap());

        // `a` is the oldest but pinned, so `b` goes.
        assert!(cache.contains(&a, AvatarVersion(1)));
        assert!(!cache.contains(&b, AvatarVersion(1)));
        assert!(cache.contains(&c, AvatarVersion(1)));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().resident_bytes, 20);
        drop(pinned_a);
    }

    #[tokio::test]
    async fn invalidate_blocks_in_flight_fetch() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(50)));
        store.put("bob", AvatarVersion(1), &b"bob"[..]);
        let cache = cache_with(Arc::clone(&store), 1024);
        let bob = PlayerIdentity::from("bob");

        let in_flight = {
            let cache = cache.clone();
            let bob = bob.clone();
            tokio::spawn(async move { cache.get(&bob, AvatarVersion(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate(&bob, AvatarVersion(1));

        assert!(matches!(
            in_flight.await.unwrap(),
            Err(AvatarError::NotFound(_))
        ));
        assert!(!cache.contains(&bob, AvatarVersion(1)));
        assert!(matches!(
            cache.get(&bob, AvatarVersion(1)).await,
            Err(AvatarError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retire_older_keeps_current_version() {
        let store = Arc::new(MemoryStore::new());
        store.put("bob", AvatarVersion(1), &b"one"[..]);
        store.put("bob", AvatarVersion(2), &b"two"[..]);
        let cache = cache_with(Arc::clone(&store), 1024);
        let bob = PlayerIdentity::from("bob");

        drop(cache.get(&bob, AvatarVersion(1)).await.unwrap());
        drop(cache.get(&bob, AvatarVersion(2)).await.unwrap());

        assert_eq!(cache.retire_older(&bob, AvatarVersion(2)), 1);
        assert!(!cache.contains(&bob, AvatarVersion(1)));
        assert!(cache.contains(&bob, AvatarVersion(2)));
    }

    #[tokio::test]
    async fn retire_older_clears_superseded_tombstones() {
        let cache = cache_with(Arc::new(MemoryStore::new()), 1024);
        let bob = PlayerIdentity::from("bob");
        let carol = PlayerIdentity::from("carol");
        cache.invalidate(&bob, AvatarVersion(1));
        cache.invalidate(&bob, AvatarVersion(3));
        cache.invalidate(&carol, AvatarVersion(1));

        cache.retire_older(&bob, AvatarVersion(3));
        assert!(!cache.is_invalidated(&bob, AvatarVersion(1)));
        assert!(cache.is_invalidated(&bob, AvatarVersion(3)));
        assert!(cache.is_invalidated(&carol, AvatarVersion(1)));
        assert_eq!(cache.tombstone_count(), 2);
    }
}
