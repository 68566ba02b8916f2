//! Configuration Module
//!
//! Cache configuration, loadable from environment variables or from a
//! compact option string such as `maximumSize=100,expireAfterWrite=10m,recordStats`.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::Policy;
use crate::error::{CacheError, Result};

/// Default number of lock stripes
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Default interval between background expiry sweeps
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Cache configuration parameters.
///
/// Immutable once a cache has been built from it. `None` bounds mean the
/// cache is unbounded along that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries the cache can hold
    pub maximum_size: Option<u64>,
    /// Maximum total weight, requires a weigher
    pub maximum_weight: Option<u64>,
    /// Entries expire this long after their last write
    pub expire_after_write: Option<Duration>,
    /// Entries expire this long after their last read or write
    pub expire_after_access: Option<Duration>,
    /// Whether hits, misses, evictions and loads are counted
    pub record_stats: bool,
    /// Number of lock stripes, must be a power of two
    pub shard_count: usize,
    /// Sweep interval of `spawn_configured_cleanup_task`
    pub cleanup_interval: Duration,
    /// Built-in eviction policy
    pub policy: Policy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maximum_size: None,
            maximum_weight: None,
            expire_after_write: None,
            expire_after_access: None,
            record_stats: false,
            shard_count: DEFAULT_SHARD_COUNT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            policy: Policy::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_MAXIMUM_SIZE` - Maximum entry count (default: unbounded)
    /// - `CACHE_MAXIMUM_WEIGHT` - Maximum total weight (default: unbounded)
    /// - `CACHE_EXPIRE_AFTER_WRITE_SECS` - Write expiry in seconds (default: none)
    /// - `CACHE_EXPIRE_AFTER_ACCESS_SECS` - Access expiry in seconds (default: none)
    /// - `CACHE_RECORD_STATS` - `true`/`false` (default: false)
    /// - `CACHE_SHARD_COUNT` - Lock stripes (default: 16)
    /// - `CACHE_CLEANUP_INTERVAL_SECS` - Sweep frequency in seconds (default: 1)
    /// - `CACHE_POLICY` - `lru`, `lfu`, `weighted-random` or `frequency-recency`
    ///
    /// Unlike a missing variable, a malformed one (for example a negative
    /// size) is rejected.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            maximum_size: env_var("CACHE_MAXIMUM_SIZE")?,
            maximum_weight: env_var("CACHE_MAXIMUM_WEIGHT")?,
            expire_after_write: env_var::<u64>("CACHE_EXPIRE_AFTER_WRITE_SECS")?
                .map(Duration::from_secs),
            expire_after_access: env_var::<u64>("CACHE_EXPIRE_AFTER_ACCESS_SECS")?
                .map(Duration::from_secs),
            record_stats: env_var("CACHE_RECORD_STATS")?.unwrap_or(defaults.record_stats),
            shard_count: env_var("CACHE_SHARD_COUNT")?.unwrap_or(defaults.shard_count),
            cleanup_interval: env_var::<u64>("CACHE_CLEANUP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            policy: env_var("CACHE_POLICY")?.unwrap_or(defaults.policy),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values no cache can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.maximum_size == Some(0) {
            return Err(invalid("maximum_size must be positive"));
        }
        if self.maximum_weight == Some(0) {
            return Err(invalid("maximum_weight must be positive"));
        }
        if self.maximum_size.is_some() && self.maximum_weight.is_some() {
            return Err(invalid(
                "maximum_size and maximum_weight cannot be combined",
            ));
        }
        if self.expire_after_write == Some(Duration::ZERO) {
            return Err(invalid("expire_after_write must be non-zero"));
        }
        if self.expire_after_access == Some(Duration::ZERO) {
            return Err(invalid("expire_after_access must be non-zero"));
        }
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(invalid(format!(
                "shard_count must be a power of two, got {}",
                self.shard_count
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(invalid("cleanup_interval must be non-zero"));
        }
        Ok(())
    }

    /// Returns true if any expiry policy is configured.
    pub fn expires(&self) -> bool {
        self.expire_after_write.is_some() || self.expire_after_access.is_some()
    }
}

// == Option String ==
impl FromStr for CacheConfig {
    type Err = CacheError;

    /// Parses a comma separated option string, e.g.
    /// `maximumSize=100,expireAfterAccess=30s,recordStats,policy=lfu`.
    ///
    /// Durations take a `ms`, `s`, `m`, `h` or `d` suffix.
    fn from_str(options: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut seen: Vec<&str> = Vec::new();

        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (option, None),
            };
            if seen.contains(&name) {
                return Err(invalid(format!("{name} was already set")));
            }
            seen.push(name);

            match (name, value) {
                ("maximumSize", Some(v)) => config.maximum_size = Some(parse_number(name, v)?),
                ("maximumWeight", Some(v)) => {
                    config.maximum_weight = Some(parse_number(name, v)?)
                }
                ("expireAfterWrite", Some(v)) => {
                    config.expire_after_write = Some(parse_duration(name, v)?)
                }
                ("expireAfterAccess", Some(v)) => {
                    config.expire_after_access = Some(parse_duration(name, v)?)
                }
                ("shardCount", Some(v)) => config.shard_count = parse_number(name, v)?,
                ("cleanupInterval", Some(v)) => {
                    config.cleanup_interval = parse_duration(name, v)?
                }
                ("policy", Some(v)) => config.policy = v.parse()?,
                ("recordStats", None) => config.record_stats = true,
                ("recordStats", Some(_)) => {
                    return Err(invalid("recordStats does not take a value"))
                }
                (_, None) if is_known(name) => {
                    return Err(invalid(format!("{name} requires a value")))
                }
                _ => return Err(invalid(format!("unknown option '{name}'"))),
            }
        }

        config.validate()?;
        Ok(config)
    }
}

// == Helpers ==
fn invalid(msg: impl Into<String>) -> CacheError {
    CacheError::InvalidConfig(msg.into())
}

fn is_known(name: &str) -> bool {
    matches!(
        name,
        "maximumSize"
            | "maximumWeight"
            | "expireAfterWrite"
            | "expireAfterAccess"
            | "shardCount"
            | "cleanupInterval"
            | "policy"
    )
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid(format!("{name} expects a non-negative integer, got '{value}'")))
}

/// Parses durations such as `250ms`, `30s`, `10m`, `2h` or `1d`.
pub fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid(format!("{name} is missing a time unit: '{value}'")))?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = parse_number(name, amount)?;

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3_600)),
        "d" => Duration::from_secs(amount.saturating_mul(86_400)),
        other => return Err(invalid(format!("{name} has an unknown time unit '{other}'"))),
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.maximum_size, None);
        assert_eq!(config.maximum_weight, None);
        assert!(!config.record_stats);
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.cleanup_interval, Duration::from_secs(1));
        assert_eq!(config.policy, Policy::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env() {
        // Single test touches the environment so parallel tests cannot race.
        for var in [
            "CACHE_MAXIMUM_SIZE",
            "CACHE_MAXIMUM_WEIGHT",
            "CACHE_EXPIRE_AFTER_WRITE_SECS",
            "CACHE_EXPIRE_AFTER_ACCESS_SECS",
            "CACHE_RECORD_STATS",
            "CACHE_SHARD_COUNT",
            "CACHE_CLEANUP_INTERVAL_SECS",
            "CACHE_POLICY",
        ] {
            env::remove_var(var);
        }
        assert_eq!(CacheConfig::from_env().unwrap(), CacheConfig::default());

        env::set_var("CACHE_MAXIMUM_SIZE", "250");
        env::set_var("CACHE_RECORD_STATS", "true");
        env::set_var("CACHE_EXPIRE_AFTER_WRITE_SECS", "60");
        env::set_var("CACHE_POLICY", "lfu");
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.maximum_size, Some(250));
        assert!(config.record_stats);
        assert_eq!(config.expire_after_write, Some(Duration::from_secs(60)));
        assert_eq!(config.policy, Policy::Lfu);

        env::set_var("CACHE_MAXIMUM_SIZE", "-5");
        let result = CacheConfig::from_env();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));

        for var in [
            "CACHE_MAXIMUM_SIZE",
            "CACHE_RECORD_STATS",
            "CACHE_EXPIRE_AFTER_WRITE_SECS",
            "CACHE_POLICY",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let config = CacheConfig {
            maximum_size: Some(0),
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_size_and_weight() {
        let config = CacheConfig {
            maximum_size: Some(10),
            maximum_weight: Some(10),
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_shard_count() {
        let config = CacheConfig {
            shard_count: 12,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_options() {
        let config: CacheConfig = "maximumSize=100, expireAfterWrite=10m,expireAfterAccess=30s,recordStats,policy=lfu"
            .parse()
            .unwrap();
        assert_eq!(config.maximum_size, Some(100));
        assert_eq!(config.expire_after_write, Some(Duration::from_secs(600)));
        assert_eq!(config.expire_after_access, Some(Duration::from_secs(30)));
        assert!(config.record_stats);
        assert_eq!(config.policy, Policy::Lfu);
    }

    #[test]
    fn test_parse_empty_options_is_default() {
        let config: CacheConfig = "".parse().unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_parse_options_errors() {
        assert!("maximumSize=-1".parse::<CacheConfig>().is_err());
        assert!("maximumSize=0".parse::<CacheConfig>().is_err());
        assert!("maximumSize=1,maximumSize=2".parse::<CacheConfig>().is_err());
        assert!("bogus=1".parse::<CacheConfig>().is_err());
        assert!("maximumSize".parse::<CacheConfig>().is_err());
        assert!("recordStats=true".parse::<CacheConfig>().is_err());
        assert!("expireAfterWrite=10".parse::<CacheConfig>().is_err());
        assert!("expireAfterWrite=10y".parse::<CacheConfig>().is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("t", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("t", "2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("t", "1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = CacheConfig {
            maximum_size: Some(3),
            record_stats: true,
            ..CacheConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: CacheConfig = serde_json::from_str(r#"{"maximum_size": 5}"#).unwrap();
        assert_eq!(partial.maximum_size, Some(5));
        assert_eq!(partial.shard_count, DEFAULT_SHARD_COUNT);
    }
}
