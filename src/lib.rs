//! Stat Cache - A bounded in-memory cache with statistics and metrics export
//!
//! Provides a concurrent cache with pluggable eviction, expiry, single-flight
//! loading, and a binder that publishes its statistics into a meter registry.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod tasks;

pub use cache::{Cache, CacheBuilder, CacheStats, Policy, RemovalCause};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use metrics::{CacheMetrics, MeterRegistry, SimpleMeterRegistry};
pub use tasks::{spawn_cleanup_task, spawn_configured_cleanup_task, spawn_reporter_task};
