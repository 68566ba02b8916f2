//! Cache Store Module
//!
//! Main cache engine: lock-striped HashMap storage, pluggable eviction,
//! expiry and statistics.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::loader::InFlight;
use crate::cache::{
    CacheBuilder, CacheEntry, CacheStats, Candidate, Clock, EvictionPolicy, RemovalCause,
    StatsCounter,
};
use crate::config::CacheConfig;

/// Computes the weight of an entry.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u64 + Send + Sync>;

/// Notified after an entry has been removed, with the reason.
pub type EvictionListener<K, V> = Arc<dyn Fn(&K, &V, RemovalCause) + Send + Sync>;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

type Shard<K, V> = RwLock<HashMap<K, CacheEntry<V>>>;
pub(crate) type LoadingShard<K, V> = Mutex<HashMap<K, Arc<InFlight<V>>>>;

// == Cache ==
/// Bounded, concurrent, statistics-instrumented cache.
///
/// `Cache` is a cheap handle; clones share the same storage. Entries live in
/// `shard_count` independently locked stripes so operations on distinct keys
/// only meet on atomic counters.
pub struct Cache<K, V> {
    pub(crate) inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<K, V> {
    id: u64,
    config: CacheConfig,
    shards: Box<[Shard<K, V>]>,
    pub(crate) loading: Box<[LoadingShard<K, V>]>,
    hasher: RandomState,
    entry_count: AtomicU64,
    weighted_size: AtomicU64,
    tick: AtomicU64,
    clock: Clock,
    pub(crate) stats: Box<dyn StatsCounter>,
    policy: Box<dyn EvictionPolicy<K>>,
    weigher: Option<Weigher<K, V>>,
    listener: Option<EvictionListener<K, V>>,
    /// Serializes eviction passes; never held while touching entries of
    /// other operations.
    eviction_lock: Mutex<()>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructors ==
    /// Starts building a cache.
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }

    /// Builds a cache from a configuration without a weigher or listener.
    pub fn from_config(config: &CacheConfig) -> crate::error::Result<Self> {
        CacheBuilder::from_config(config.clone()).build()
    }

    pub(crate) fn from_parts(
        config: CacheConfig,
        stats: Box<dyn StatsCounter>,
        policy: Box<dyn EvictionPolicy<K>>,
        weigher: Option<Weigher<K, V>>,
        listener: Option<EvictionListener<K, V>>,
    ) -> Self {
        let shard_count = config.shard_count;
        let inner = Inner {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            loading: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            entry_count: AtomicU64::new(0),
            weighted_size: AtomicU64::new(0),
            tick: AtomicU64::new(0),
            clock: Clock::new(),
            config,
            stats,
            policy,
            weigher,
            listener,
            eviction_lock: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    // == Get ==
    /// Returns the value for `key`, if present and not expired.
    ///
    /// A hit refreshes the entry's recency. A miss has no effect beyond the
    /// miss counter, except that an expired entry found on the way is removed.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    // == Put ==
    /// Inserts or replaces the value for `key`.
    ///
    /// When the cache then exceeds its bound, entries chosen by the eviction
    /// policy are removed until it fits again.
    pub fn put(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    // == Invalidate ==
    /// Removes `key`, returning its value. Not counted as an eviction.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.inner
            .remove_entry_if(key, RemovalCause::Explicit, |_| true)
    }

    /// Removes every entry.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Returns true if `key` is present and not expired. Does not touch
    /// statistics or recency.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Keys currently stored, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .shards
            .iter()
            .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count.load(Ordering::Relaxed)
    }

    /// Sum of entry weights (equal to the entry count without a weigher).
    pub fn weighted_size(&self) -> u64 {
        self.inner.weighted_size.load(Ordering::Relaxed)
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Snapshot of the statistics. All zeros unless `record_stats` is set.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Process-unique identifier of this cache.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Creates a handle that does not keep the cache alive.
    pub fn downgrade(&self) -> WeakCache<K, V> {
        WeakCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Non-owning, type-erased view for metrics suppliers.
    pub fn stats_source(&self) -> Weak<dyn StatsSource> {
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.inner.id)
            .field("entry_count", &self.inner.entry_count.load(Ordering::Relaxed))
            .field("config", &self.inner.config)
            .finish()
    }
}

// == Weak Cache ==
/// Non-owning cache handle.
pub struct WeakCache<K, V> {
    inner: Weak<Inner<K, V>>,
}

impl<K, V> WeakCache<K, V> {
    /// Returns the cache if it is still alive.
    pub fn upgrade(&self) -> Option<Cache<K, V>> {
        self.inner.upgrade().map(|inner| Cache { inner })
    }

    /// Returns true while some `Cache` handle still exists.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<K, V> Clone for WeakCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// == Stats Source ==
/// What a metrics supplier needs to read from a cache.
pub trait StatsSource: Send + Sync {
    /// Identifier of the sampled cache.
    fn cache_id(&self) -> u64;

    /// Current statistics.
    fn stats(&self) -> CacheStats;

    /// Current number of entries.
    fn estimated_size(&self) -> u64;
}

impl<K, V> StatsSource for Inner<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn cache_id(&self) -> u64 {
        self.id
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn estimated_size(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }
}

// == Inner Operations ==
impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn shard_index(&self, key: &K) -> usize {
        // shard_count is a power of two
        (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: u64) -> bool {
        entry.is_expired(
            now,
            self.config.expire_after_write,
            self.config.expire_after_access,
        )
    }

    fn weigh(&self, key: &K, value: &V) -> u64 {
        self.weigher.as_ref().map_or(1, |weigher| weigher(key, value))
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let value = self.lookup(key);
        match value {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        value
    }

    /// Reads a live value and refreshes its recency without recording a hit
    /// or miss. An expired entry found on the way is removed.
    pub(crate) fn lookup(&self, key: &K) -> Option<V> {
        let now = self.clock.now_nanos();
        let expired = {
            let shard = self.shards[self.shard_index(key)].read();
            match shard.get(key) {
                Some(entry) if !self.is_expired(entry, now) => {
                    entry.touch(self.next_tick(), now);
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.remove_entry_if(key, RemovalCause::Expired, |entry| {
                self.is_expired(entry, now)
            });
        }
        None
    }

    /// Reads a live value without recording statistics or recency.
    pub(crate) fn peek(&self, key: &K) -> Option<V> {
        let now = self.clock.now_nanos();
        let shard = self.shards[self.shard_index(key)].read();
        shard
            .get(key)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.value.clone())
    }

    fn contains_key(&self, key: &K) -> bool {
        let now = self.clock.now_nanos();
        let shard = self.shards[self.shard_index(key)].read();
        shard
            .get(key)
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        let weight = self.weigh(&key, &value);
        let tick = self.next_tick();
        let now = self.clock.now_nanos();

        let previous = {
            let mut shard = self.shards[self.shard_index(&key)].write();
            let entry = match shard.get(&key) {
                Some(old) if !self.is_expired(old, now) => old.replaced_by(value, weight, tick, now),
                _ => CacheEntry::new(value, weight, tick, now),
            };
            let previous = shard.insert(key.clone(), entry);
            // Counters move under the shard lock so they never go negative.
            self.weighted_size.fetch_add(weight, Ordering::Relaxed);
            match &previous {
                Some(old) => self.weighted_size.fetch_sub(old.weight, Ordering::Relaxed),
                None => self.entry_count.fetch_add(1, Ordering::Relaxed),
            };
            previous
        };

        if let Some(old) = previous {
            let cause = if self.is_expired(&old, now) {
                RemovalCause::Expired
            } else {
                RemovalCause::Replaced
            };
            self.stats.record_eviction(old.weight, cause);
            self.notify(&key, &old.value, cause);
        }

        // An entry heavier than the whole cache can never fit.
        if let Some(max) = self.config.maximum_weight.filter(|max| weight > *max) {
            debug!(
                "Cache {}: {:?} weighs {} which exceeds maximum_weight {}",
                self.id, key, weight, max
            );
            self.remove_entry_if(&key, RemovalCause::Size, |entry| entry.weight > max);
        }

        // The entry just written is its own put's victim only as a last resort.
        self.evict_if_needed(Some(&key));
    }

    /// Removes `key` if `predicate` holds for its entry, recording the
    /// removal under `cause`.
    pub(crate) fn remove_entry_if(
        &self,
        key: &K,
        cause: RemovalCause,
        predicate: impl FnOnce(&CacheEntry<V>) -> bool,
    ) -> Option<V> {
        let removed = self.take_entry_if(key, predicate)?;
        self.account_removal(key, &removed, cause);
        Some(removed.value)
    }

    /// Unlinks the entry for `key` if `predicate` holds, without recording
    /// or notifying anything.
    fn take_entry_if(
        &self,
        key: &K,
        predicate: impl FnOnce(&CacheEntry<V>) -> bool,
    ) -> Option<CacheEntry<V>> {
        let mut shard = self.shards[self.shard_index(key)].write();
        let removed = match shard.get(key) {
            Some(entry) if predicate(entry) => shard.remove(key),
            _ => None,
        }?;
        self.uncount(&removed);
        Some(removed)
    }

    /// Must be called while holding the write lock of the entry's shard.
    fn uncount(&self, entry: &CacheEntry<V>) {
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
        self.weighted_size.fetch_sub(entry.weight, Ordering::Relaxed);
    }

    fn account_removal(&self, key: &K, entry: &CacheEntry<V>, cause: RemovalCause) {
        self.stats.record_eviction(entry.weight, cause);
        if cause.was_evicted() {
            debug!("Cache {}: evicted {:?} ({:?})", self.id, key, cause);
        }
        self.notify(key, &entry.value, cause);
    }

    fn notify(&self, key: &K, value: &V, cause: RemovalCause) {
        if let Some(listener) = &self.listener {
            listener(key, value, cause);
        }
    }

    fn invalidate_all(&self) {
        for shard in self.shards.iter() {
            let drained: Vec<(K, CacheEntry<V>)> = {
                let mut guard = shard.write();
                let drained: Vec<_> = guard.drain().collect();
                for (_, entry) in &drained {
                    self.uncount(entry);
                }
                drained
            };
            for (key, entry) in drained {
                self.account_removal(&key, &entry, RemovalCause::Explicit);
            }
        }
    }

    pub(crate) fn cleanup_expired(&self) -> usize {
        let expired = self.take_expired();
        let removed = expired.len();
        for (key, entry) in expired {
            self.account_removal(&key, &entry, RemovalCause::Expired);
        }
        removed
    }

    /// Unlinks every expired entry without recording or notifying anything.
    fn take_expired(&self) -> Vec<(K, CacheEntry<V>)> {
        if !self.config.expires() {
            return Vec::new();
        }

        let now = self.clock.now_nanos();
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let keys: Vec<K> = guard
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(entry) = guard.remove(&key) {
                    self.uncount(&entry);
                    expired.push((key, entry));
                }
            }
        }
        expired
    }

    // == Eviction ==
    fn over_bound(&self) -> bool {
        if let Some(max) = self.config.maximum_size {
            return self.entry_count.load(Ordering::Relaxed) > max;
        }
        if let Some(max) = self.config.maximum_weight {
            return self.weighted_size.load(Ordering::Relaxed) > max;
        }
        false
    }

    /// Evicts until the cache fits its bound again. `protected` is only
    /// offered as a victim when nothing else can be evicted.
    ///
    /// Removals are recorded and listeners notified only after the eviction
    /// lock is released, so a listener may write back into the cache.
    fn evict_if_needed(&self, protected: Option<&K>) {
        if !self.over_bound() {
            return;
        }

        let mut removals: Vec<(K, CacheEntry<V>, RemovalCause)> = Vec::new();
        {
            let _guard = self.eviction_lock.lock();
            if self.over_bound() {
                removals.extend(
                    self.take_expired()
                        .into_iter()
                        .map(|(key, entry)| (key, entry, RemovalCause::Expired)),
                );
            }

            while self.over_bound() {
                let mut candidates = self.eviction_candidates(protected);
                if candidates.is_empty() && protected.is_some() {
                    candidates = self.eviction_candidates(None);
                }
                let Some(victim) = self.policy.select_victim(&candidates) else {
                    debug!(
                        "Cache {}: over bound but no entry can be evicted, deferring eviction",
                        self.id
                    );
                    break;
                };
                if !candidates.iter().any(|c| c.key == victim) {
                    warn!(
                        "Cache {}: eviction policy chose {:?}, which is not a candidate",
                        self.id, victim
                    );
                    break;
                }
                if let Some(entry) = self.take_entry_if(&victim, |_| true) {
                    removals.push((victim, entry, RemovalCause::Size));
                }
            }
        }

        for (key, entry, cause) in removals {
            self.account_removal(&key, &entry, cause);
        }
    }

    /// Collects every entry that may be evicted. Keys with a load in flight
    /// and `protected` are skipped.
    fn eviction_candidates(&self, protected: Option<&K>) -> Vec<Candidate<K>> {
        let mut candidates = Vec::new();
        for (shard, loading) in self.shards.iter().zip(self.loading.iter()) {
            let loading = loading.lock();
            let shard = shard.read();
            candidates.extend(
                shard
                    .iter()
                    .filter(|(key, _)| !loading.contains_key(*key) && protected != Some(*key))
                    .map(|(key, entry)| Candidate {
                        key: key.clone(),
                        last_access: entry.last_access_tick(),
                        inserted: entry.inserted_tick,
                        frequency: entry.frequency(),
                        weight: entry.weight,
                    }),
            );
        }
        candidates
    }
}
