//! Eviction Policy Module
//!
//! Decides which entry leaves the cache when it grows past its bound.
//! New policies implement [`EvictionPolicy`]; the store does not change.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

// == Candidate ==
/// Eviction metadata of one live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<K> {
    /// Key of the entry
    pub key: K,
    /// Logical tick of the last read or write
    pub last_access: u64,
    /// Logical tick of the first insertion
    pub inserted: u64,
    /// Number of reads and writes
    pub frequency: u64,
    /// Weight of the entry
    pub weight: u64,
}

impl<K> Candidate<K> {
    fn recency_order(&self, other: &Self) -> Ordering {
        self.last_access
            .cmp(&other.last_access)
            .then(self.inserted.cmp(&other.inserted))
    }
}

// == Eviction Policy ==
/// Chooses the entry to evict.
///
/// `candidates` holds every entry that may currently be evicted; keys with a
/// load in flight are never offered. Implementations must return one of the
/// offered keys, or `None` only when `candidates` is empty.
pub trait EvictionPolicy<K>: Send + Sync {
    /// Picks the victim among `candidates`.
    fn select_victim(&self, candidates: &[Candidate<K>]) -> Option<K>;
}

// == LRU ==
/// Least recently used. Evicts the entry with the oldest access tick, ties
/// broken by insertion order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lru;

impl<K: Clone> EvictionPolicy<K> for Lru {
    fn select_victim(&self, candidates: &[Candidate<K>]) -> Option<K> {
        candidates
            .iter()
            .min_by(|a, b| a.recency_order(b))
            .map(|c| c.key.clone())
    }
}

// == LFU ==
/// Least frequently used, falling back to LRU among equally used entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lfu;

impl<K: Clone> EvictionPolicy<K> for Lfu {
    fn select_victim(&self, candidates: &[Candidate<K>]) -> Option<K> {
        candidates
            .iter()
            .min_by(|a, b| a.frequency.cmp(&b.frequency).then(a.recency_order(b)))
            .map(|c| c.key.clone())
    }
}

// == Weighted Random ==
/// Random victim, heavier entries proportionally more likely.
///
/// Reproducible when built with [`WeightedRandom::seeded`].
#[derive(Debug)]
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl WeightedRandom {
    /// Creates a policy seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a policy with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone> EvictionPolicy<K> for WeightedRandom {
    fn select_victim(&self, candidates: &[Candidate<K>]) -> Option<K> {
        // Shard iteration order is arbitrary; sort so a seed replays exactly.
        let mut ordered: Vec<&Candidate<K>> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.inserted);

        let weights = ordered.iter().map(|c| c.weight.max(1));
        let index = WeightedIndex::new(weights).ok()?;
        let chosen = index.sample(&mut *self.rng.lock());
        ordered.get(chosen).map(|c| c.key.clone())
    }
}

// == Frequency / Recency ==
/// Composite estimator scoring `frequency / (1 + age)`, where age is the
/// number of ticks since the entry was last touched relative to the newest
/// candidate. Lowest score is evicted; ties fall back to LRU.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrequencyRecency;

impl<K: Clone> EvictionPolicy<K> for FrequencyRecency {
    fn select_victim(&self, candidates: &[Candidate<K>]) -> Option<K> {
        let newest = candidates.iter().map(|c| c.last_access).max()?;
        let score = |c: &Candidate<K>| {
            let age = newest.saturating_sub(c.last_access) as f64;
            c.frequency as f64 / (1.0 + age)
        };

        candidates
            .iter()
            .min_by(|a, b| {
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(Ordering::Equal)
                    .then(a.recency_order(b))
            })
            .map(|c| c.key.clone())
    }
}

// == Built-in Policies ==
/// Names the built-in policies for configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// [`Lru`]
    #[default]
    Lru,
    /// [`Lfu`]
    Lfu,
    /// [`WeightedRandom`]
    WeightedRandom,
    /// [`FrequencyRecency`]
    FrequencyRecency,
}

impl Policy {
    /// Instantiates the policy.
    pub fn build<K: Clone + 'static>(self) -> Box<dyn EvictionPolicy<K>> {
        match self {
            Policy::Lru => Box::new(Lru),
            Policy::Lfu => Box::new(Lfu),
            Policy::WeightedRandom => Box::new(WeightedRandom::new()),
            Policy::FrequencyRecency => Box::new(FrequencyRecency),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Policy::Lru => "lru",
            Policy::Lfu => "lfu",
            Policy::WeightedRandom => "weighted-random",
            Policy::FrequencyRecency => "frequency-recency",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Policy::Lru),
            "lfu" => Ok(Policy::Lfu),
            "weighted-random" | "random" => Ok(Policy::WeightedRandom),
            "frequency-recency" => Ok(Policy::FrequencyRecency),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown eviction policy '{other}'"
            ))),
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, last_access: u64, inserted: u64, frequency: u64) -> Candidate<String> {
        Candidate {
            key: key.to_string(),
            last_access,
            inserted,
            frequency,
            weight: 1,
        }
    }

    #[test]
    fn test_empty_candidates() {
        let none: Vec<Candidate<String>> = Vec::new();
        assert_eq!(Lru.select_victim(&none), None);
        assert_eq!(Lfu.select_victim(&none), None);
        assert_eq!(FrequencyRecency.select_victim(&none), None);
        assert_eq!(WeightedRandom::seeded(1).select_victim(&none), None);
    }

    #[test]
    fn test_lru_picks_oldest_access() {
        let candidates = vec![
            candidate("a", 4, 1, 2),
            candidate("b", 2, 2, 1),
            candidate("c", 3, 3, 1),
        ];
        assert_eq!(Lru.select_victim(&candidates), Some("b".to_string()));
    }

    #[test]
    fn test_lru_ties_broken_by_insertion() {
        let candidates = vec![candidate("late", 5, 9, 1), candidate("early", 5, 2, 1)];
        assert_eq!(Lru.select_victim(&candidates), Some("early".to_string()));
    }

    #[test]
    fn test_lfu_picks_least_frequent() {
        let candidates = vec![
            candidate("hot", 1, 1, 10),
            candidate("cold", 9, 2, 1),
            candidate("warm", 5, 3, 4),
        ];
        assert_eq!(Lfu.select_victim(&candidates), Some("cold".to_string()));
    }

    #[test]
    fn test_lfu_ties_fall_back_to_lru() {
        let candidates = vec![candidate("a", 8, 1, 2), candidate("b", 3, 2, 2)];
        assert_eq!(Lfu.select_victim(&candidates), Some("b".to_string()));
    }

    #[test]
    fn test_frequency_recency_prefers_stale_entries() {
        // "old" was popular long ago, "new" was touched once just now.
        let candidates = vec![candidate("old", 1, 1, 3), candidate("new", 100, 2, 1)];
        assert_eq!(
            FrequencyRecency.select_victim(&candidates),
            Some("old".to_string())
        );
    }

    #[test]
    fn test_weighted_random_is_reproducible() {
        let candidates: Vec<_> = (0..20)
            .map(|i| Candidate {
                key: i,
                last_access: i,
                inserted: i,
                frequency: 1,
                weight: i + 1,
            })
            .collect();

        let first = WeightedRandom::seeded(42);
        let second = WeightedRandom::seeded(42);
        for _ in 0..10 {
            let victim = first.select_victim(&candidates);
            assert_eq!(victim, second.select_victim(&candidates));
            assert!(victim.is_some_and(|k| k < 20));
        }
    }

    #[test]
    fn test_weighted_random_ignores_zero_weight() {
        let candidates = vec![Candidate {
            key: "only",
            last_access: 1,
            inserted: 1,
            frequency: 1,
            weight: 0,
        }];
        assert_eq!(
            WeightedRandom::seeded(7).select_victim(&candidates),
            Some("only")
        );
    }

    #[test]
    fn test_policy_parse_and_display() {
        assert_eq!("LRU".parse::<Policy>().unwrap(), Policy::Lru);
        assert_eq!("lfu".parse::<Policy>().unwrap(), Policy::Lfu);
        assert_eq!(
            "weighted-random".parse::<Policy>().unwrap(),
            Policy::WeightedRandom
        );
        assert_eq!(Policy::FrequencyRecency.to_string(), "frequency-recency");
        assert!("fifo".parse::<Policy>().is_err());
    }

    #[test]
    fn test_policy_build_selects_from_candidates() {
        let candidates = vec![candidate("x", 1, 1, 1), candidate("y", 2, 2, 1)];
        for policy in [
            Policy::Lru,
            Policy::Lfu,
            Policy::WeightedRandom,
            Policy::FrequencyRecency,
        ] {
            let victim = policy.build::<String>().select_victim(&candidates).unwrap();
            assert!(victim == "x" || victim == "y", "{policy} chose {victim}");
        }
    }
}
