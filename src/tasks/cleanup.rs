//! Expiry Cleanup Task
//!
//! Background task that periodically removes expired cache entries.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::Cache;

/// Spawns a background task that periodically sweeps expired entries.
///
/// The task holds only a weak handle and stops by itself once the cache is
/// dropped. Entries are also expired lazily on access, so the sweep only
/// bounds how long dead entries occupy memory.
///
/// # Arguments
/// * `cache` - The cache to sweep
/// * `interval` - Time between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let cache: Cache<String, String> = Cache::builder()
///     .expire_after_write(Duration::from_secs(300))
///     .build()?;
/// let cleanup_handle = spawn_cleanup_task(&cache, Duration::from_secs(1));
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task<K, V>(cache: &Cache<K, V>, interval: Duration) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let cache = cache.downgrade();

    tokio::spawn(async move {
        info!("Starting expiry cleanup task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let Some(cache) = cache.upgrade() else {
                info!("Cache dropped, stopping expiry cleanup task");
                break;
            };
            let removed = cache.cleanup_expired();

            if removed > 0 {
                info!("Expiry cleanup: removed {} expired entries", removed);
            } else {
                debug!("Expiry cleanup: no expired entries found");
            }
        }
    })
}

/// Spawns [`spawn_cleanup_task`] at the cache's configured
/// `cleanup_interval`.
pub fn spawn_configured_cleanup_task<K, V>(cache: &Cache<K, V>) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    spawn_cleanup_task(cache, cache.config().cleanup_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expiring(ttl: Duration) -> Cache<String, String> {
        Cache::builder()
            .expire_after_write(ttl)
            .record_stats()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired_entries() {
        let cache = expiring(Duration::from_millis(100));
        cache.put("expire_soon".to_string(), "value".to_string());

        let handle = spawn_cleanup_task(&cache, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Removed by the sweep, not by a lookup
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.stats().expired_evictions, 1);
        assert_eq!(cache.stats().miss_count, 0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_preserves_valid_entries() {
        let cache = expiring(Duration::from_secs(3600));
        cache.put("long_lived".to_string(), "value".to_string());

        let handle = spawn_cleanup_task(&cache, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.get(&"long_lived".to_string()), Some("value".to_string()));

        handle.abort();
    }

    #[tokio::test]
    async fn test_configured_cleanup_task_uses_cleanup_interval() {
        let cache: Cache<String, String> = Cache::builder()
            .expire_after_write(Duration::from_millis(50))
            .cleanup_interval(Duration::from_millis(20))
            .record_stats()
            .build()
            .unwrap();
        cache.put("expire_soon".to_string(), "value".to_string());

        let handle = spawn_configured_cleanup_task(&cache);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired_evictions, 1);
        assert_eq!(cache.stats().miss_count, 0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_can_be_aborted() {
        let cache = expiring(Duration::from_secs(1));
        let handle = spawn_cleanup_task(&cache, Duration::from_secs(1));

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_when_cache_dropped() {
        let cache = expiring(Duration::from_secs(1));
        let handle = spawn_cleanup_task(&cache, Duration::from_millis(20));
        drop(cache);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop on its own")
            .unwrap();
    }
}
