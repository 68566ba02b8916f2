//! Cache Statistics Module
//!
//! Records hits, misses, evictions and loads, and produces immutable snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// == Removal Cause ==
/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalCause {
    /// Removed by `invalidate`
    Explicit,
    /// Value overwritten by `put`
    Replaced,
    /// Evicted to keep the cache within its size or weight bound
    Size,
    /// Evicted because an expiry deadline passed
    Expired,
}

impl RemovalCause {
    /// True for involuntary removals, which count as evictions.
    pub fn was_evicted(self) -> bool {
        matches!(self, RemovalCause::Size | RemovalCause::Expired)
    }
}

// == Cache Stats ==
/// Immutable point-in-time copy of the cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of lookups that found a live entry
    pub hit_count: u64,
    /// Number of lookups that found nothing or an expired entry
    pub miss_count: u64,
    /// Number of loads that produced a value
    pub load_success_count: u64,
    /// Number of loads that failed
    pub load_failure_count: u64,
    /// Time spent loading, successful or not
    pub total_load_time: Duration,
    /// Evictions caused by the size or weight bound
    pub size_evictions: u64,
    /// Evictions caused by expiry
    pub expired_evictions: u64,
    /// Sum of the weights of all evicted entries
    pub eviction_weight: u64,
}

impl CacheStats {
    /// Total lookups, always `hit_count + miss_count`.
    pub fn request_count(&self) -> u64 {
        self.hit_count.saturating_add(self.miss_count)
    }

    /// Evictions of any cause.
    pub fn eviction_count(&self) -> u64 {
        self.size_evictions.saturating_add(self.expired_evictions)
    }

    /// Total number of loads.
    pub fn load_count(&self) -> u64 {
        self.load_success_count
            .saturating_add(self.load_failure_count)
    }

    // == Hit Rate ==
    /// Returns hits / requests, or 1.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hit_count, self.request_count(), 1.0)
    }

    /// Returns misses / requests, or 0.0 if no requests have been made.
    pub fn miss_rate(&self) -> f64 {
        ratio(self.miss_count, self.request_count(), 0.0)
    }

    /// Returns failed loads / loads, or 0.0 without loads.
    pub fn load_failure_rate(&self) -> f64 {
        ratio(self.load_failure_count, self.load_count(), 0.0)
    }

    /// Mean time spent per load.
    pub fn average_load_penalty(&self) -> Duration {
        match u32::try_from(self.load_count()) {
            Ok(0) => Duration::ZERO,
            Ok(loads) => self.total_load_time / loads,
            Err(_) => Duration::from_secs_f64(
                self.total_load_time.as_secs_f64() / self.load_count() as f64,
            ),
        }
    }

    /// Difference between two snapshots, saturating at zero.
    pub fn minus(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.saturating_sub(other.hit_count),
            miss_count: self.miss_count.saturating_sub(other.miss_count),
            load_success_count: self
                .load_success_count
                .saturating_sub(other.load_success_count),
            load_failure_count: self
                .load_failure_count
                .saturating_sub(other.load_failure_count),
            total_load_time: self.total_load_time.saturating_sub(other.total_load_time),
            size_evictions: self.size_evictions.saturating_sub(other.size_evictions),
            expired_evictions: self
                .expired_evictions
                .saturating_sub(other.expired_evictions),
            eviction_weight: self.eviction_weight.saturating_sub(other.eviction_weight),
        }
    }

    /// Sum of two snapshots, saturating at the maximum.
    pub fn plus(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.saturating_add(other.hit_count),
            miss_count: self.miss_count.saturating_add(other.miss_count),
            load_success_count: self
                .load_success_count
                .saturating_add(other.load_success_count),
            load_failure_count: self
                .load_failure_count
                .saturating_add(other.load_failure_count),
            total_load_time: self.total_load_time.saturating_add(other.total_load_time),
            size_evictions: self.size_evictions.saturating_add(other.size_evictions),
            expired_evictions: self
                .expired_evictions
                .saturating_add(other.expired_evictions),
            eviction_weight: self.eviction_weight.saturating_add(other.eviction_weight),
        }
    }
}

fn ratio(part: u64, total: u64, empty: f64) -> f64 {
    if total == 0 {
        empty
    } else {
        part as f64 / total as f64
    }
}

// == Stats Counter ==
/// Accumulates cache statistics.
///
/// Recording never fails and may be called from any thread. A snapshot is
/// accurate per counter but counters are read one by one, so under concurrent
/// traffic two fields of the same snapshot may describe slightly different
/// instants.
pub trait StatsCounter: Send + Sync {
    /// Records `count` lookups that found a live entry.
    fn record_hits(&self, count: u64);

    /// Records `count` lookups that found nothing.
    fn record_misses(&self, count: u64);

    /// Records the removal of an entry of the given weight. Only size and
    /// expiry removals count as evictions.
    fn record_eviction(&self, weight: u64, cause: RemovalCause);

    /// Records a successful load and its duration.
    fn record_load_success(&self, load_time: Duration);

    /// Records a failed load and its duration.
    fn record_load_failure(&self, load_time: Duration);

    /// Returns the current statistics.
    fn snapshot(&self) -> CacheStats;

    /// Records a single hit.
    fn record_hit(&self) {
        self.record_hits(1);
    }

    /// Records a single miss.
    fn record_miss(&self) {
        self.record_misses(1);
    }
}

// == Concurrent Counter ==
/// Lock-free counter backed by one atomic per statistic.
#[derive(Debug, Default)]
pub struct ConcurrentStatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_nanos: AtomicU64,
    size_evictions: AtomicU64,
    expired_evictions: AtomicU64,
    eviction_weight: AtomicU64,
}

impl ConcurrentStatsCounter {
    /// Creates a counter with everything at zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_load_time(&self, load_time: Duration) {
        let nanos = u64::try_from(load_time.as_nanos()).unwrap_or(u64::MAX);
        self.total_load_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

impl StatsCounter for ConcurrentStatsCounter {
    fn record_hits(&self, count: u64) {
        self.hits.fetch_add(count, Ordering::Relaxed);
    }

    fn record_misses(&self, count: u64) {
        self.misses.fetch_add(count, Ordering::Relaxed);
    }

    fn record_eviction(&self, weight: u64, cause: RemovalCause) {
        let counter = match cause {
            RemovalCause::Size => &self.size_evictions,
            RemovalCause::Expired => &self.expired_evictions,
            RemovalCause::Explicit | RemovalCause::Replaced => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.eviction_weight.fetch_add(weight, Ordering::Relaxed);
    }

    fn record_load_success(&self, load_time: Duration) {
        self.load_successes.fetch_add(1, Ordering::Relaxed);
        self.add_load_time(load_time);
    }

    fn record_load_failure(&self, load_time: Duration) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.add_load_time(load_time);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            load_success_count: self.load_successes.load(Ordering::Relaxed),
            load_failure_count: self.load_failures.load(Ordering::Relaxed),
            total_load_time: Duration::from_nanos(self.total_load_nanos.load(Ordering::Relaxed)),
            size_evictions: self.size_evictions.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
            eviction_weight: self.eviction_weight.load(Ordering::Relaxed),
        }
    }
}

// == Disabled Counter ==
/// Counter used when statistics recording is turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStatsCounter;

impl StatsCounter for DisabledStatsCounter {
    fn record_hits(&self, _count: u64) {}
    fn record_misses(&self, _count: u64) {}
    fn record_eviction(&self, _weight: u64, _cause: RemovalCause) {}
    fn record_load_success(&self, _load_time: Duration) {}
    fn record_load_failure(&self, _load_time: Duration) {}

    fn snapshot(&self) -> CacheStats {
        CacheStats::default()
    }
}
