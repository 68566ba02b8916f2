//! Cache Module
//!
//! Bounded in-memory caching with pluggable eviction, expiry, single-flight
//! loading and statistics.

mod builder;
mod entry;
mod loader;
mod policy;
mod stats;
mod store;


// Re-export public types
pub use builder::CacheBuilder;
pub use entry::{CacheEntry, Clock};
pub use policy::{Candidate, EvictionPolicy, FrequencyRecency, Lfu, Lru, Policy, WeightedRandom};
pub use stats::{CacheStats, ConcurrentStatsCounter, DisabledStatsCounter, RemovalCause, StatsCounter};
pub use store::{Cache, EvictionListener, StatsSource, WeakCache, Weigher};
