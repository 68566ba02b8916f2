//! Cache Entry Module
//!
//! Defines individual cache entries and the clock their timestamps are read from.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// == Clock ==
/// Monotonic nanosecond clock relative to the cache's creation.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Starts a clock at the current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the clock started.
    pub fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// == Cache Entry ==
/// A single cache entry with its value and eviction metadata.
///
/// Access metadata is atomic so that a hit can update recency while only
/// holding the shard's read lock.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: V,
    /// Weight as reported by the weigher, 1 when none is configured
    pub weight: u64,
    /// Logical tick of the first insertion of this key
    pub inserted_tick: u64,
    /// Clock time of the last write (nanoseconds)
    pub written_at: u64,
    /// Logical tick of the last read or write
    last_access_tick: AtomicU64,
    /// Clock time of the last read or write (nanoseconds)
    accessed_at: AtomicU64,
    /// Number of reads and writes
    frequency: AtomicU64,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new entry written at `now` with logical tick `tick`.
    pub fn new(value: V, weight: u64, tick: u64, now: u64) -> Self {
        Self {
            value,
            weight,
            inserted_tick: tick,
            written_at: now,
            last_access_tick: AtomicU64::new(tick),
            accessed_at: AtomicU64::new(now),
            frequency: AtomicU64::new(1),
        }
    }

    /// Creates the entry replacing `self`, keeping its insertion order and
    /// access frequency.
    pub fn replaced_by(&self, value: V, weight: u64, tick: u64, now: u64) -> Self {
        let mut entry = Self::new(value, weight, tick, now);
        entry.inserted_tick = self.inserted_tick;
        entry.frequency = AtomicU64::new(self.frequency() + 1);
        entry
    }

    // == Touch ==
    /// Records a read: bumps frequency and moves the access tick forward.
    pub fn touch(&self, tick: u64, now: u64) {
        self.last_access_tick.fetch_max(tick, Ordering::Relaxed);
        self.accessed_at.fetch_max(now, Ordering::Relaxed);
        self.frequency.fetch_add(1, Ordering::Relaxed);
    }

    /// Logical tick of the last access.
    pub fn last_access_tick(&self) -> u64 {
        self.last_access_tick.load(Ordering::Relaxed)
    }

    /// Number of recorded reads and writes.
    pub fn frequency(&self) -> u64 {
        self.frequency.load(Ordering::Relaxed)
    }

    // == Is Expired ==
    /// Checks the entry against the configured expiry durations.
    ///
    /// Boundary condition: an entry is expired once the current time is
    /// greater than or equal to its deadline, so a fully elapsed duration
    /// expires immediately.
    pub fn is_expired(
        &self,
        now: u64,
        after_write: Option<Duration>,
        after_access: Option<Duration>,
    ) -> bool {
        let past = |since: u64, ttl: Duration| {
            let ttl = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
            now >= since.saturating_add(ttl)
        };

        after_write.is_some_and(|ttl| past(self.written_at, ttl))
            || after_access.is_some_and(|ttl| past(self.accessed_at.load(Ordering::Relaxed), ttl))
    }
}
