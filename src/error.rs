//! Error types for the cache
//!
//! Provides unified error handling using thiserror. Absence of a key is never
//! an error; lookups return `Option`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache and its metrics binding.
///
/// The type is `Clone` so that a single load failure can be handed to every
/// caller waiting on the same key.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The cache configuration was rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A loader failed for the given key
    #[error("Failed to load key {key}: {cause}")]
    Load {
        /// Debug rendering of the key being loaded
        key: String,
        /// The loader's error, shared between all waiters
        cause: Arc<anyhow::Error>,
    },

    /// The caller gave up waiting for a load
    #[error("Timed out after {timeout:?} waiting for key {key}")]
    LoadTimeout {
        /// Debug rendering of the key being loaded
        key: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// A meter could not be registered
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Internal error (e.g. a loader task panicked)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Returns true if the error came from a loader, a timeout or an aborted
    /// load. Such errors never poison the cache and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Load { .. } | CacheError::LoadTimeout { .. } | CacheError::Internal(_)
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
