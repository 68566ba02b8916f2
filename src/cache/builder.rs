//! Cache Builder Module
//!
//! Assembles a [`Cache`] from a configuration plus the pieces that cannot be
//! expressed as plain data: weigher, eviction listener and custom policies.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{
    Cache, ConcurrentStatsCounter, DisabledStatsCounter, EvictionListener, EvictionPolicy,
    Policy, RemovalCause, StatsCounter, Weigher,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Builder for [`Cache`]. Validation happens in [`CacheBuilder::build`].
pub struct CacheBuilder<K, V> {
    config: CacheConfig,
    policy: Option<Box<dyn EvictionPolicy<K>>>,
    weigher: Option<Weigher<K, V>>,
    listener: Option<EvictionListener<K, V>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Unbounded cache without expiry or statistics.
    pub fn new() -> Self {
        Self::from_config(CacheConfig::default())
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            policy: None,
            weigher: None,
            listener: None,
        }
    }

    /// Caps the number of entries.
    pub fn maximum_size(mut self, size: u64) -> Self {
        self.config.maximum_size = Some(size);
        self
    }

    /// Caps the total weight. Requires [`CacheBuilder::weigher`].
    pub fn maximum_weight(mut self, weight: u64) -> Self {
        self.config.maximum_weight = Some(weight);
        self
    }

    /// Sets the function computing each entry's weight.
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u64 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Expires entries this long after they were written.
    pub fn expire_after_write(mut self, ttl: Duration) -> Self {
        self.config.expire_after_write = Some(ttl);
        self
    }

    /// Expires entries this long after they were last read or written.
    pub fn expire_after_access(mut self, ttl: Duration) -> Self {
        self.config.expire_after_access = Some(ttl);
        self
    }

    /// Enables the statistics recorder.
    pub fn record_stats(mut self) -> Self {
        self.config.record_stats = true;
        self
    }

    /// Sets the number of lock stripes (a power of two).
    pub fn shard_count(mut self, shards: usize) -> Self {
        self.config.shard_count = shards;
        self
    }

    /// Sets the interval of the background expiry sweep started by
    /// [`crate::tasks::spawn_configured_cleanup_task`].
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Selects a built-in eviction policy.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.config.policy = policy;
        self.policy = None;
        self
    }

    /// Uses a custom eviction policy instead of a built-in one.
    pub fn eviction_policy(mut self, policy: impl EvictionPolicy<K> + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Registers a listener called after each removal.
    pub fn eviction_listener(
        mut self,
        listener: impl Fn(&K, &V, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Validates the configuration and builds the cache.
    ///
    /// Returns [`CacheError::InvalidConfig`] rather than a partially usable
    /// cache.
    pub fn build(self) -> Result<Cache<K, V>> {
        self.config.validate()?;
        match (&self.weigher, self.config.maximum_weight) {
            (Some(_), None) => {
                return Err(CacheError::InvalidConfig(
                    "a weigher requires maximum_weight".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(CacheError::InvalidConfig(
                    "maximum_weight requires a weigher".to_string(),
                ))
            }
            _ => {}
        }

        let stats: Box<dyn StatsCounter> = if self.config.record_stats {
            Box::new(ConcurrentStatsCounter::new())
        } else {
            Box::new(DisabledStatsCounter)
        };
        let policy = self
            .policy
            .unwrap_or_else(|| self.config.policy.build::<K>());

        debug!("Building cache: {:?}", self.config);
        Ok(Cache::from_parts(
            self.config,
            stats,
            policy,
            self.weigher,
            self.listener,
        ))
    }
}

impl<K, V> Default for CacheBuilder<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Candidate;

    type TestBuilder = CacheBuilder<String, String>;

    #[test]
    fn test_build_defaults() {
        let cache = TestBuilder::new().build().unwrap();
        assert_eq!(cache.config(), &CacheConfig::default());
    }

    #[test]
    fn test_build_rejects_zero_size() {
        let result = TestBuilder::new().maximum_size(0).build();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_rejects_weigher_without_weight() {
        let result = TestBuilder::new()
            .weigher(|_k: &String, _v: &String| 1)
            .build();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_rejects_weight_without_weigher() {
        let result = TestBuilder::new().maximum_weight(10).build();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_rejects_size_and_weight() {
        let result = TestBuilder::new()
            .maximum_size(10)
            .maximum_weight(10)
            .weigher(|_k: &String, _v: &String| 1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_from_config_string() {
        let config: CacheConfig = "maximumSize=2,recordStats".parse().unwrap();
        let cache: Cache<String, String> = Cache::from_config(&config).unwrap();
        cache.put("a".into(), "1".into());
        cache.put("b".into(), "2".into());
        cache.put("c".into(), "3".into());
        assert_eq!(cache.entry_count(), 2);
        assert_eq!(cache.stats().eviction_count(), 1);
    }

    /// Evicts the lexicographically greatest key.
    struct LargestKey;

    impl EvictionPolicy<String> for LargestKey {
        fn select_victim(&self, candidates: &[Candidate<String>]) -> Option<String> {
            candidates.iter().map(|c| c.key.clone()).max()
        }
    }

    #[test]
    fn test_custom_policy() {
        let cache = TestBuilder::new()
            .maximum_size(2)
            .eviction_policy(LargestKey)
            .build()
            .unwrap();
        cache.put("a".into(), "1".into());
        cache.put("z".into(), "2".into());
        cache.put("m".into(), "3".into());

        assert!(cache.contains_key(&"a".to_string()));
        assert!(cache.contains_key(&"m".to_string()));
        assert!(!cache.contains_key(&"z".to_string()));
    }
}
