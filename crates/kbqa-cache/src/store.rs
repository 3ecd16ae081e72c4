//! In-memory cache store with TTL, LRU and per-document invalidation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use kbqa_core::{
    CacheEntry, CacheKey, CacheStats, Clock, DocumentId, DocumentVersions, EngineError, Result,
};

/// Why a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
    /// A dependent document changed since the entry was built.
    Stale,
}

/// Result of [`CacheStore::get`].
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Arc<CacheEntry>),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Result of [`CacheStore::put`].
#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    /// The stored entry with its timestamps; `None` when the entry was
    /// already stale and was not stored.
    pub stored: Option<Arc<CacheEntry>>,

    /// Keys removed to make room, TTL-expired ones first.
    pub evicted: Vec<CacheKey>,
}

impl PutOutcome {
    pub fn inserted(&self) -> bool {
        self.stored.is_some()
    }
}

#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    tick: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
    invalidated: u64,
    repairs: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, Slot>,

    /// Access order: lowest tick is least recently used.
    lru: BTreeMap<u64, CacheKey>,

    /// Reverse index from dependent document to keys.
    by_document: HashMap<DocumentId, HashSet<CacheKey>>,

    next_tick: u64,
    counters: Counters,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, key: &CacheKey) {
        let tick = self.tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.lru.remove(&slot.tick);
            slot.tick = tick;
            self.lru.insert(tick, key.clone());
        }
    }

    fn insert(&mut self, key: CacheKey, entry: Arc<CacheEntry>) {
        self.unlink(&key);
        for document_id in entry.dependencies.keys() {
            self.by_document
                .entry(document_id.clone())
                .or_default()
                .insert(key.clone());
        }
        let tick = self.tick();
        self.lru.insert(tick, key.clone());
        self.entries.insert(key, Slot { entry, tick });
    }

    /// Remove an entry and every index reference to it.
    fn unlink(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let slot = self.entries.remove(key)?;
        self.lru.remove(&slot.tick);
        for document_id in slot.entry.dependencies.keys() {
            if let Some(keys) = self.by_document.get_mut(document_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_document.remove(document_id);
                }
            }
        }
        Some(slot.entry)
    }

    fn remove_expired(&mut self, now: u64) -> Vec<CacheKey> {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.unlink(key);
        }
        self.counters.expired += expired.len() as u64;
        expired
    }

    fn evict(&mut self, now: u64, capacity: usize) -> Vec<CacheKey> {
        let mut removed = self.remove_expired(now);
        while self.entries.len() > capacity {
            let Some((_, key)) = self.lru.pop_first() else {
                break;
            };
            if self.unlink(&key).is_some() {
                self.counters.evictions += 1;
                removed.push(key);
            }
        }
        removed
    }
}

/// Bounded, version-validated cache of retrieval results.
pub struct CacheStore {
    capacity: usize,
    versions: Arc<dyn DocumentVersions>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CacheStore {
    /// Create an empty store holding at most `capacity` entries.
    pub fn new(
        capacity: usize,
        versions: Arc<dyn DocumentVersions>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(EngineError::invalid_argument("cache capacity must be > 0"));
        }
        Ok(Self {
            capacity,
            versions,
            clock,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a key.
    ///
    /// Expired entries and entries whose dependent documents changed are
    /// removed on the spot and reported as misses.
    pub fn get(&self, key: &CacheKey) -> Result<CacheLookup> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock()?;

        let Some(slot) = inner.entries.get(key) else {
            inner.counters.misses += 1;
            return Ok(CacheLookup::Miss(MissReason::Absent));
        };
        let entry = slot.entry.clone();

        if entry.is_expired(now) {
            inner.unlink(key);
            inner.counters.expired += 1;
            inner.counters.misses += 1;
            debug!("Cache entry {} expired", key.short());
            return Ok(CacheLookup::Miss(MissReason::Expired));
        }

        if let Some(document_id) = self.first_stale(&entry) {
            inner.unlink(key);
            inner.counters.invalidated += 1;
            inner.counters.misses += 1;
            debug!("Cache entry {} stale: {} changed", key.short(), document_id);
            return Ok(CacheLookup::Miss(MissReason::Stale));
        }

        inner.touch(key);
        inner.counters.hits += 1;
        Ok(CacheLookup::Hit(entry))
    }

    /// Insert or overwrite an entry, stamping its timestamps.
    ///
    /// An entry already stale against the current document versions is not
    /// stored.
    pub fn put(&self, key: CacheKey, mut entry: CacheEntry, ttl: Duration) -> Result<PutOutcome> {
        if ttl.is_zero() {
            return Err(EngineError::invalid_argument("cache ttl must be > 0"));
        }
        let ttl_ms = ttl_millis(ttl);

        if let Some(document_id) = self.first_stale(&entry) {
            debug!(
                "Not caching {}: {} changed while the result was built",
                key.short(),
                document_id
            );
            return Ok(PutOutcome::default());
        }

        let now = self.clock.now_millis();
        entry.created_at = now;
        entry.expires_at = now.saturating_add(ttl_ms);

        let entry = Arc::new(entry);
        let mut inner = self.inner.lock()?;
        inner.insert(key, entry.clone());
        let evicted = inner.evict(now, self.capacity);
        Ok(PutOutcome {
            stored: Some(entry),
            evicted,
        })
    }

    /// Re-insert a persisted entry with its original timestamps.
    ///
    /// Returns false if it has expired or gone stale in the meantime.
    pub fn restore(&self, key: CacheKey, entry: CacheEntry) -> Result<bool> {
        let now = self.clock.now_millis();
        if entry.is_expired(now) || self.first_stale(&entry).is_some() {
            return Ok(false);
        }
        let mut inner = self.inner.lock()?;
        inner.insert(key.clone(), Arc::new(entry));
        inner.evict(now, self.capacity);
        Ok(inner.entries.contains_key(&key))
    }

    /// Remove TTL-expired entries, then least recently used ones until the
    /// store is within capacity. Returns the removed keys.
    pub fn evict(&self) -> Result<Vec<CacheKey>> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        let removed = inner.evict(now, self.capacity);
        if !removed.is_empty() {
            debug!("Evicted {} cache entries", removed.len());
        }
        Ok(removed)
    }

    /// Remove every entry depending on `document_id`. Idempotent.
    pub fn invalidate(&self, document_id: &DocumentId) -> Result<Vec<CacheKey>> {
        let mut inner = self.inner.lock()?;
        let Some(keys) = inner.by_document.remove(document_id) else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if inner.unlink(&key).is_some() {
                removed.push(key);
            } else {
                let err = EngineError::corrupted(
                    "cache reverse index",
                    format!("{} points at missing entry {}", document_id, key.short()),
                );
                warn!("{}; dropped dangling reference", err);
                inner.counters.repairs += 1;
            }
        }
        inner.counters.invalidated += removed.len() as u64;

        if !removed.is_empty() {
            info!(
                "Invalidated {} cache entries for document {}",
                removed.len(),
                document_id
            );
        }
        Ok(removed)
    }

    /// Remove one entry.
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.inner.lock()?.unlink(key).is_some())
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock()?;
        let n = inner.entries.len();
        inner.entries.clear();
        inner.lru.clear();
        inner.by_document.clear();
        Ok(n)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys currently depending on a document.
    pub fn keys_for_document(&self, document_id: &DocumentId) -> Result<Vec<CacheKey>> {
        let inner = self.inner.lock()?;
        let mut keys: Vec<CacheKey> = inner
            .by_document
            .get(document_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// Counters and derived hit rate.
    pub fn stats(&self) -> Result<CacheStats> {
        let inner = self.inner.lock()?;
        let c = &inner.counters;
        let lookups = c.hits + c.misses;
        Ok(CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            hit_count: c.hits,
            miss_count: c.misses,
            eviction_count: c.evictions,
            expired_count: c.expired,
            invalidated_count: c.invalidated,
            repair_count: c.repairs,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
        })
    }

    /// Verify the reverse index and LRU order against the entries, rebuilding
    /// both if they disagree. Returns the number of repairs made.
    pub fn check_consistency(&self) -> Result<usize> {
        let mut inner = self.inner.lock()?;

        let mut expected: HashMap<DocumentId, HashSet<CacheKey>> = HashMap::new();
        for (key, slot) in &inner.entries {
            for document_id in slot.entry.dependencies.keys() {
                expected
                    .entry(document_id.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }

        let mut repairs = 0;
        if expected != inner.by_document {
            let err = EngineError::corrupted("cache reverse index", "disagrees with entries");
            warn!("{}; rebuilt", err);
            inner.by_document = expected;
            repairs += 1;
        }

        let lru_ok = inner.lru.len() == inner.entries.len()
            && inner.entries.iter().all(|(key, slot)| {
                inner.lru.get(&slot.tick).map(|k| k == key).unwrap_or(false)
            });
        if !lru_ok {
            let err = EngineError::corrupted("cache lru order", "disagrees with entries");
            warn!("{}; rebuilt", err);
            let lru = inner
                .entries
                .iter()
                .map(|(key, slot)| (slot.tick, key.clone()))
                .collect();
            inner.lru = lru;
            repairs += 1;
        }

        inner.counters.repairs += repairs as u64;
        Ok(repairs)
    }

    fn first_stale(&self, entry: &CacheEntry) -> Option<DocumentId> {
        entry
            .dependencies
            .iter()
            .find(|(document_id, recorded)| self.versions.current_version(document_id) != **recorded)
            .map(|(document_id, _)| document_id.clone())
    }

    #[cfg(test)]
    fn corrupt_reverse_index(&self, document_id: &DocumentId, key: CacheKey) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .by_document
                .entry(document_id.clone())
                .or_default()
                .insert(key);
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Whole milliseconds, rounded up so a positive TTL never becomes zero.
fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() + u128::from(ttl.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbqa_core::{CachePayload, DependencyVersions, ManualClock, RankedAnswerSet};
    use std::sync::RwLock;

    #[derive(Default)]
    struct Versions {
        docs: RwLock<HashMap<DocumentId, u64>>,
    }

    impl Versions {
        fn set(&self, doc: &str, version: u64) {
            self.docs.write().unwrap().insert(DocumentId::from(doc), version);
        }

        fn delete(&self, doc: &str) {
            self.docs.write().unwrap().remove(&DocumentId::from(doc));
        }
    }

    impl DocumentVersions for Versions {
        fn corpus_version(&self) -> u64 {
            self.docs.read().unwrap().values().copied().max().unwrap_or(0)
        }

        fn current_version(&self, document_id: &DocumentId) -> Option<u64> {
            self.docs.read().unwrap().get(document_id).copied()
        }
    }

    struct Fixture {
        versions: Arc<Versions>,
        clock: Arc<ManualClock>,
        store: CacheStore,
    }

    fn fixture(capacity: usize) -> Fixture {
        let versions = Arc::new(Versions::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = CacheStore::new(capacity, versions.clone(), clock.clone()).unwrap();
        Fixture {
            versions,
            clock,
            store,
        }
    }

    fn entry(versions: &Versions, docs: &[&str]) -> CacheEntry {
        let deps: DependencyVersions = docs
            .iter()
            .map(|d| {
                let id = DocumentId::from(*d);
                let v = versions.current_version(&id);
                (id, v)
            })
            .collect();
        CacheEntry::new(
            CachePayload::Retrieval(RankedAnswerSet::default()),
            versions.corpus_version(),
            deps,
        )
    }

    fn key(n: usize) -> CacheKey {
        CacheKey::new(format!("key-{}", n))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_zero_capacity_rejected() {
        let versions = Arc::new(Versions::default());
        let clock = Arc::new(ManualClock::new(0));
        assert!(CacheStore::new(0, versions, clock).is_err());
    }

    #[test]
    fn test_put_then_get() {
        let f = fixture(10);
        f.versions.set("d1", 1);
        f.store.put(key(1), entry(&f.versions, &["d1"]), HOUR).unwrap();

        let CacheLookup::Hit(hit) = f.store.get(&key(1)).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(hit.created_at, 1_000);
        assert_eq!(hit.expires_at, 1_000 + 3_600_000);

        let stats = f.store.stats().unwrap();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate, 1.0);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let f = fixture(10);
        let err = f
            .store
            .put(key(1), entry(&f.versions, &[]), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
        assert_eq!(f.store.len().unwrap(), 0);
    }

    #[test]
    fn test_sub_millisecond_ttl_rounds_up() {
        let f = fixture(10);
        f.store
            .put(key(1), entry(&f.versions, &[]), Duration::from_micros(500))
            .unwrap();

        let CacheLookup::Hit(hit) = f.store.get(&key(1)).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(hit.expires_at, 1_001);

        f.clock.advance(1);
        assert!(!f.store.get(&key(1)).unwrap().is_hit());

        assert_eq!(ttl_millis(Duration::from_micros(1_500)), 2);
        assert_eq!(ttl_millis(Duration::from_millis(7)), 7);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_absent_miss() {
        let f = fixture(10);
        assert!(matches!(
            f.store.get(&key(1)).unwrap(),
            CacheLookup::Miss(MissReason::Absent)
        ));
        assert_eq!(f.store.stats().unwrap().miss_count, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let f = fixture(10);
        f.store
            .put(key(1), entry(&f.versions, &[]), Duration::from_secs(10))
            .unwrap();

        f.clock.advance(9_999);
        assert!(f.store.get(&key(1)).unwrap().is_hit());

        f.clock.advance(1);
        assert!(matches!(
            f.store.get(&key(1)).unwrap(),
            CacheLookup::Miss(MissReason::Expired)
        ));
        assert_eq!(f.store.len().unwrap(), 0);
        assert_eq!(f.store.stats().unwrap().expired_count, 1);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let n = 3;
        let f = fixture(n);
        for i in 0..n {
            f.store.put(key(i), entry(&f.versions, &[]), HOUR).unwrap();
        }
        // touch key 0 so key 1 becomes least recently used
        assert!(f.store.get(&key(0)).unwrap().is_hit());

        let outcome = f.store.put(key(n), entry(&f.versions, &[]), HOUR).unwrap();
        assert!(outcome.inserted());
        assert_eq!(outcome.evicted, vec![key(1)]);
        assert_eq!(f.store.len().unwrap(), n);
        assert!(!f.store.get(&key(1)).unwrap().is_hit());
        assert_eq!(f.store.stats().unwrap().eviction_count, 1);
    }

    #[test]
    fn test_expired_evicted_before_lru() {
        let f = fixture(2);
        f.store
            .put(key(0), entry(&f.versions, &[]), Duration::from_secs(1))
            .unwrap();
        f.store.put(key(1), entry(&f.versions, &[]), HOUR).unwrap();
        // key 1 is now older in LRU order than a fresh touch of key 0
        f.clock.advance(500);
        assert!(f.store.get(&key(0)).unwrap().is_hit());

        f.clock.advance(600);
        let outcome = f.store.put(key(2), entry(&f.versions, &[]), HOUR).unwrap();
        assert_eq!(outcome.evicted, vec![key(0)]);
        assert!(f.store.get(&key(1)).unwrap().is_hit());
        assert!(f.store.get(&key(2)).unwrap().is_hit());
    }

    #[test]
    fn test_invalidate_removes_all_dependents() {
        let f = fixture(10);
        f.versions.set("d1", 1);
        f.versions.set("d2", 2);
        f.store.put(key(1), entry(&f.versions, &["d1"]), HOUR).unwrap();
        f.store.put(key(2), entry(&f.versions, &["d1", "d2"]), HOUR).unwrap();
        f.store.put(key(3), entry(&f.versions, &["d2"]), HOUR).unwrap();

        let mut removed = f.store.invalidate(&DocumentId::from("d1")).unwrap();
        removed.sort();
        assert_eq!(removed, vec![key(1), key(2)]);
        assert!(f.store.keys_for_document(&DocumentId::from("d1")).unwrap().is_empty());
        assert_eq!(
            f.store.keys_for_document(&DocumentId::from("d2")).unwrap(),
            vec![key(3)]
        );
        assert!(f.store.get(&key(3)).unwrap().is_hit());

        // idempotent
        assert!(f.store.invalidate(&DocumentId::from("d1")).unwrap().is_empty());
        assert_eq!(f.store.stats().unwrap().invalidated_count, 2);
    }

    #[test]
    fn test_version_change_makes_entry_stale() {
        let f = fixture(10);
        f.versions.set("d1", 3);
        f.store.put(key(1), entry(&f.versions, &["d1"]), HOUR).unwrap();

        f.versions.set("d1", 4);
        assert!(matches!(
            f.store.get(&key(1)).unwrap(),
            CacheLookup::Miss(MissReason::Stale)
        ));
        assert_eq!(f.store.len().unwrap(), 0);
        assert!(f.store.keys_for_document(&DocumentId::from("d1")).unwrap().is_empty());
    }

    #[test]
    fn test_deleted_document_makes_entry_stale() {
        let f = fixture(10);
        f.versions.set("d1", 1);
        f.store.put(key(1), entry(&f.versions, &["d1"]), HOUR).unwrap();
        f.versions.delete("d1");
        assert!(!f.store.get(&key(1)).unwrap().is_hit());
    }

    #[test]
    fn test_put_skips_already_stale_entry() {
        let f = fixture(10);
        f.versions.set("d1", 1);
        let built = entry(&f.versions, &["d1"]);
        f.versions.set("d1", 2);

        let outcome = f.store.put(key(1), built, HOUR).unwrap();
        assert!(!outcome.inserted());
        assert_eq!(f.store.len().unwrap(), 0);
    }

    #[test]
    fn test_overwrite_relinks_reverse_index() {
        let f = fixture(10);
        f.versions.set("d1", 1);
        f.versions.set("d2", 1);
        f.store.put(key(1), entry(&f.versions, &["d1"]), HOUR).unwrap();
        f.store.put(key(1), entry(&f.versions, &["d2"]), HOUR).unwrap();

        assert!(f.store.keys_for_document(&DocumentId::from("d1")).unwrap().is_empty());
        assert!(f.store.invalidate(&DocumentId::from("d1")).unwrap().is_empty());
        assert!(f.store.get(&key(1)).unwrap().is_hit());
    }

    #[test]
    fn test_dangling_reverse_reference_is_repaired() {
        let f = fixture(10);
        f.store.corrupt_reverse_index(&DocumentId::from("d9"), key(42));

        let removed = f.store.invalidate(&DocumentId::from("d9")).unwrap();
        assert!(removed.is_empty());
        assert_eq!(f.store.stats().unwrap().repair_count, 1);
    }

    #[test]
    fn test_check_consistency_rebuilds() {
        let f = fixture(10);
        f.versions.set("d1", 1);
        f.store.put(key(1), entry(&f.versions, &["d1"]), HOUR).unwrap();
        assert_eq!(f.store.check_consistency().unwrap(), 0);

        f.store.corrupt_reverse_index(&DocumentId::from("d7"), key(1));
        assert_eq!(f.store.check_consistency().unwrap(), 1);
        assert!(f.store.keys_for_document(&DocumentId::from("d7")).unwrap().is_empty());
    }

    #[test]
    fn test_restore_keeps_timestamps() {
        let f = fixture(10);
        let mut restored = entry(&f.versions, &[]);
        restored.created_at = 100;
        restored.expires_at = 5_000;
        assert!(f.store.restore(key(1), restored.clone()).unwrap());

        let CacheLookup::Hit(hit) = f.store.get(&key(1)).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(hit.created_at, 100);

        restored.expires_at = 900;
        assert!(!f.store.restore(key(2), restored).unwrap());
    }

    #[test]
    fn test_remove_and_clear() {
        let f = fixture(10);
        f.store.put(key(1), entry(&f.versions, &[]), HOUR).unwrap();
        f.store.put(key(2), entry(&f.versions, &[]), HOUR).unwrap();
        assert!(f.store.remove(&key(1)).unwrap());
        assert!(!f.store.remove(&key(1)).unwrap());
        assert_eq!(f.store.clear().unwrap(), 1);
        assert!(f.store.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_put_and_invalidate() {
        let f = fixture(64);
        f.versions.set("d1", 1);
        let store = Arc::new(f.store);
        let versions = f.versions.clone();

        std::thread::scope(|scope| {
            for t in 0..4 {
                let store = store.clone();
                let versions = versions.clone();
                scope.spawn(move || {
                    for i in 0..100 {
                        store
                            .put(key(t * 1000 + i), entry(&versions, &["d1"]), HOUR)
                            .unwrap();
                        if i % 10 == 0 {
                            store.invalidate(&DocumentId::from("d1")).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(store.check_consistency().unwrap(), 0);
        store.invalidate(&DocumentId::from("d1")).unwrap();
        assert!(store.is_empty().unwrap());
    }
}
