//! Cache Loader Module
//!
//! Single-flight `get_or_load`: concurrent callers for the same missing key
//! share one loader invocation and all observe its outcome.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::store::Inner;
use crate::cache::Cache;
use crate::error::{CacheError, Result};

/// Outcome slot of one in-flight load; `None` until the loader finishes.
pub(crate) struct InFlight<V> {
    outcome: watch::Sender<Option<Result<V>>>,
}

impl<V> InFlight<V> {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self { outcome }
    }
}

enum Lookup<V> {
    Ready(V),
    Wait(watch::Receiver<Option<Result<V>>>),
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Get Or Load ==
    /// Returns the cached value for `key`, loading it on a miss.
    ///
    /// The loader runs on the tokio runtime and is invoked at most once per
    /// key at a time, however many callers are waiting. On success the value
    /// is inserted through the normal `put` path. On failure nothing is
    /// cached, every waiter receives the same [`CacheError::Load`], and a
    /// later call loads again.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.load(key, None, loader).await
    }

    /// Like [`Cache::get_or_load`], but gives up after `timeout`.
    ///
    /// Expiry only affects this caller: the load keeps running and other
    /// waiters still receive its result.
    pub async fn get_or_load_with_timeout<F, Fut>(
        &self,
        key: K,
        timeout: Duration,
        loader: F,
    ) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.load(key, Some(timeout), loader).await
    }

    /// Returns true while a load for `key` is in flight.
    pub fn is_loading(&self, key: &K) -> bool {
        let index = self.inner.shard_index(key);
        self.inner.loading[index].lock().contains_key(key)
    }

    async fn load<F, Fut>(&self, key: K, timeout: Option<Duration>, loader: F) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if let Some(value) = self.inner.lookup(&key) {
            self.inner.stats.record_hit();
            return Ok(value);
        }

        let receiver = match self.join_or_start(key.clone(), loader) {
            Lookup::Ready(value) => return Ok(value),
            Lookup::Wait(receiver) => receiver,
        };

        match timeout {
            None => wait_for_outcome(receiver).await,
            Some(limit) => tokio::time::timeout(limit, wait_for_outcome(receiver))
                .await
                .unwrap_or_else(|_| {
                    debug!("Gave up waiting for {:?} after {:?}", key, limit);
                    Err(CacheError::LoadTimeout {
                        key: format!("{key:?}"),
                        timeout: limit,
                    })
                }),
        }
    }

    /// Subscribes to the flight for `key`, starting one if none exists.
    ///
    /// Records the request as a hit when a completed flight already left a
    /// value behind, and as a miss otherwise.
    fn join_or_start<F, Fut>(&self, key: K, loader: F) -> Lookup<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let index = self.inner.shard_index(&key);
        let mut loading = self.inner.loading[index].lock();

        if let Some(flight) = loading.get(&key) {
            self.inner.stats.record_miss();
            return Lookup::Wait(flight.outcome.subscribe());
        }
        // A flight may have completed between the lookup and taking the lock;
        // its value is inserted before its marker is removed.
        if let Some(value) = self.inner.peek(&key) {
            self.inner.stats.record_hit();
            return Lookup::Ready(value);
        }
        self.inner.stats.record_miss();

        let flight = Arc::new(InFlight::new());
        let receiver = flight.outcome.subscribe();
        loading.insert(key.clone(), flight.clone());
        drop(loading);

        debug!("Starting load for {:?}", key);
        let future = loader(key.clone());
        tokio::spawn(run_load(self.inner.clone(), key, flight, future));
        Lookup::Wait(receiver)
    }
}

async fn run_load<K, V, Fut>(inner: Arc<Inner<K, V>>, key: K, flight: Arc<InFlight<V>>, future: Fut)
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    let started = Instant::now();
    // Run the loader in its own task so a panic surfaces as a JoinError
    // instead of stranding the waiters.
    let joined = tokio::spawn(future).await;
    let elapsed = started.elapsed();

    let outcome = match joined {
        Ok(Ok(value)) => {
            inner.stats.record_load_success(elapsed);
            inner.insert(key.clone(), value.clone());
            debug!("Loaded {:?} in {:?}", key, elapsed);
            Ok(value)
        }
        Ok(Err(cause)) => {
            inner.stats.record_load_failure(elapsed);
            warn!("Load of {:?} failed after {:?}: {:#}", key, elapsed, cause);
            Err(CacheError::Load {
                key: format!("{key:?}"),
                cause: Arc::new(cause),
            })
        }
        Err(join_error) => {
            inner.stats.record_load_failure(elapsed);
            warn!("Load of {:?} aborted: {}", key, join_error);
            Err(CacheError::Internal(format!(
                "loader for {key:?} did not complete: {join_error}"
            )))
        }
    };

    {
        let index = inner.shard_index(&key);
        let mut loading = inner.loading[index].lock();
        if loading
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &flight))
        {
            loading.remove(&key);
        }
    }
    flight.outcome.send_replace(Some(outcome));
}

async fn wait_for_outcome<V: Clone>(mut receiver: watch::Receiver<Option<Result<V>>>) -> Result<V> {
    let outcome = match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone(),
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| {
        Err(CacheError::Internal(
            "load was dropped before completing".to_string(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(max: u64) -> Cache<String, String> {
        Cache::builder()
            .maximum_size(max)
            .record_stats()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_load_on_miss_then_hit() {
        let cache = cache(10);
        let value = cache
            .get_or_load("k".to_string(), |k| async move { Ok::<_, anyhow::Error>(format!("loaded-{k}")) })
            .await
            .unwrap();
        assert_eq!(value, "loaded-k");

        let again = cache
            .get_or_load("k".to_string(), |_| async { Err::<String, _>(anyhow::anyhow!("not called")) })
            .await
            .unwrap();
        assert_eq!(again, "loaded-k");

        let stats = cache.stats();
        assert_eq!(stats.load_success_count, 1);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[tokio::test]
    async fn test_value_found_under_loading_lock_counts_as_hit() {
        let cache = cache(10);
        cache.put("k".to_string(), "ready".to_string());

        let lookup = cache.join_or_start("k".to_string(), |_| async {
            Err::<String, _>(anyhow::anyhow!("not called"))
        });
        assert!(matches!(lookup, Lookup::Ready(ref v) if v == "ready"));
        assert!(!cache.is_loading(&"k".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 0);
    }

    #[tokio::test]
    async fn test_joined_waiters_count_as_misses() {
        let cache = cache(10);
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let first = cache.join_or_start("k".to_string(), |_| async move {
            let _ = gate.await;
            Ok::<_, anyhow::Error>("v".to_string())
        });
        let second = cache.join_or_start("k".to_string(), |_| async {
            Err::<String, _>(anyhow::anyhow!("not called"))
        });
        assert!(matches!(first, Lookup::Wait(_)));
        assert!(matches!(second, Lookup::Wait(_)));
        assert_eq!(cache.stats().miss_count, 2);

        release.send(()).unwrap();
        let Lookup::Wait(receiver) = second else {
            unreachable!()
        };
        assert_eq!(wait_for_outcome(receiver).await.unwrap(), "v");
        assert_eq!(cache.stats().hit_count, 0);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache = cache(10);
        let result = cache
            .get_or_load("k".to_string(), |_| async { Err::<String, _>(anyhow::anyhow!("backend down")) })
            .await;
        assert!(matches!(result, Err(CacheError::Load { .. })));
        assert!(!cache.contains_key(&"k".to_string()));
        assert!(!cache.is_loading(&"k".to_string()));

        let retried = cache
            .get_or_load("k".to_string(), |_| async { Ok::<_, anyhow::Error>("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(retried, "ok");

        let stats = cache.stats();
        assert_eq!(stats.load_failure_count, 1);
        assert_eq!(stats.load_success_count, 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_load("shared".to_string(), move |_| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, anyhow::Error>("value".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().load_success_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_only_affects_caller() {
        let cache = cache(10);
        let slow = |_k: String| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, anyhow::Error>("slow".to_string())
        };

        let patient = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_load("k".to_string(), slow).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let impatient = cache
            .get_or_load_with_timeout("k".to_string(), Duration::from_millis(10), |_| async {
                Err::<String, _>(anyhow::anyhow!("joined the existing flight, never called"))
            })
            .await;
        assert!(matches!(impatient, Err(CacheError::LoadTimeout { .. })));

        assert_eq!(patient.await.unwrap().unwrap(), "slow");
        assert_eq!(cache.get(&"k".to_string()), Some("slow".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_loader_releases_waiters() {
        let cache = cache(10);
        let result = cache
            .get_or_load("k".to_string(), |_| async {
                if true {
                    panic!("loader bug");
                }
                Ok::<_, anyhow::Error>("never".to_string())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Internal(_))));
        assert!(!cache.is_loading(&"k".to_string()));
        assert_eq!(cache.stats().load_failure_count, 1);
    }

    #[tokio::test]
    async fn test_loading_key_is_not_evicted() {
        let cache = cache(1);
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let loading = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load("loading".to_string(), |_| async move {
                        let _ = gate.await;
                        Ok::<_, anyhow::Error>("loaded".to_string())
                    })
                    .await
            })
        };
        while !cache.is_loading(&"loading".to_string()) {
            tokio::task::yield_now().await;
        }

        // Concurrent put for the loading key, then overflow with another key.
        cache.put("loading".to_string(), "put".to_string());
        cache.put("other".to_string(), "v".to_string());
        assert!(cache.contains_key(&"loading".to_string()));
        assert!(!cache.contains_key(&"other".to_string()));

        release.send(()).unwrap();
        assert_eq!(loading.await.unwrap().unwrap(), "loaded");
        assert_eq!(cache.entry_count(), 1);
    }
}
