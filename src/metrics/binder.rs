//! Cache Metrics Binder
//!
//! Publishes a cache's statistics as named, tagged meters.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::info;

use crate::cache::{Cache, CacheStats, StatsSource};
use crate::error::Result;
use crate::metrics::{MeterDescriptor, MeterId, MeterKind, MeterRegistry, Supplier};

type Reader = fn(&CacheStats, u64) -> f64;

struct MeterDef {
    suffix: &'static str,
    kind: MeterKind,
    base_unit: Option<&'static str>,
    description: &'static str,
    read: Reader,
}

const METERS: &[MeterDef] = &[
    MeterDef {
        suffix: "requests",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Number of lookups",
        read: |stats, _| stats.request_count() as f64,
    },
    MeterDef {
        suffix: "hits",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Number of lookups that found a live entry",
        read: |stats, _| stats.hit_count as f64,
    },
    MeterDef {
        suffix: "misses",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Number of lookups that found nothing",
        read: |stats, _| stats.miss_count as f64,
    },
    MeterDef {
        suffix: "evictions",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Number of entries evicted by size or expiry",
        read: |stats, _| stats.eviction_count() as f64,
    },
    MeterDef {
        suffix: "eviction.weight",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Total weight of evicted entries",
        read: |stats, _| stats.eviction_weight as f64,
    },
    MeterDef {
        suffix: "size",
        kind: MeterKind::Gauge,
        base_unit: Some("entries"),
        description: "Current number of entries",
        read: |_, size| size as f64,
    },
    MeterDef {
        suffix: "load.duration",
        kind: MeterKind::TimeGauge,
        base_unit: Some("seconds"),
        description: "Total time spent loading values",
        read: |stats, _| stats.total_load_time.as_secs_f64(),
    },
    MeterDef {
        suffix: "load.success",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Number of successful loads",
        read: |stats, _| stats.load_success_count as f64,
    },
    MeterDef {
        suffix: "load.failure",
        kind: MeterKind::FunctionCounter,
        base_unit: None,
        description: "Number of failed loads",
        read: |stats, _| stats.load_failure_count as f64,
    },
];

/// Binds caches to a [`MeterRegistry`].
pub struct CacheMetrics;

impl CacheMetrics {
    /// Registers the meters of `cache` under `name_prefix`:
    /// `{prefix}.requests`, `.hits`, `.misses`, `.evictions`,
    /// `.eviction.weight`, `.size`, `.load.duration`, `.load.success` and
    /// `.load.failure`, each carrying `tags`.
    ///
    /// Binding the same cache under the same prefix and tags again replaces
    /// the earlier meters. If another live cache already owns one of the ids
    /// the bind fails and meters it created are removed again. Suppliers hold
    /// a weak reference only; once the cache is dropped they read as stale
    /// and another cache may bind under the same ids.
    pub fn bind<K, V, R>(
        registry: &R,
        cache: &Cache<K, V>,
        name_prefix: &str,
        tags: &[(&str, &str)],
    ) -> Result<()>
    where
        K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        R: MeterRegistry + ?Sized,
    {
        let owner = cache.id();
        let mut created = Vec::new();

        for def in METERS {
            let meter = MeterDescriptor {
                id: meter_id(name_prefix, def.suffix, tags),
                kind: def.kind,
                base_unit: def.base_unit.map(str::to_string),
                description: def.description.to_string(),
            };
            let id = meter.id.clone();

            match registry.register(meter, owner, supplier(cache, def.read)) {
                Ok(true) => {}
                Ok(false) => created.push(id),
                Err(err) => {
                    for id in &created {
                        registry.remove(id);
                    }
                    return Err(err);
                }
            }
        }

        info!(
            "Bound metrics of cache {} under '{}' ({} meters)",
            owner,
            name_prefix,
            METERS.len()
        );
        Ok(())
    }

    /// Same as [`CacheMetrics::bind`].
    pub fn monitor<K, V, R>(
        registry: &R,
        cache: &Cache<K, V>,
        name_prefix: &str,
        tags: &[(&str, &str)],
    ) -> Result<()>
    where
        K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        R: MeterRegistry + ?Sized,
    {
        Self::bind(registry, cache, name_prefix, tags)
    }

    /// Removes the meters registered under `name_prefix` and `tags`,
    /// returning how many were present.
    pub fn unbind<R>(registry: &R, name_prefix: &str, tags: &[(&str, &str)]) -> usize
    where
        R: MeterRegistry + ?Sized,
    {
        METERS
            .iter()
            .filter(|def| registry.remove(&meter_id(name_prefix, def.suffix, tags)))
            .count()
    }
}

fn meter_id(prefix: &str, suffix: &str, tags: &[(&str, &str)]) -> MeterId {
    MeterId::new(format!("{prefix}.{suffix}"), tags.iter().copied())
}

fn supplier<K, V>(cache: &Cache<K, V>, read: Reader) -> Supplier
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let source = cache.stats_source();
    Arc::new(move || {
        source
            .upgrade()
            .map(|live: Arc<dyn StatsSource>| read(&live.stats(), live.estimated_size()))
    })
}
