//! Meter Registry Module
//!
//! The registry collaborator caches publish into, plus an in-memory
//! implementation that evaluates suppliers on read.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

// == Meter Id ==
/// A key/value dimension of a meter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Tag {
    /// Tag name
    pub key: String,
    /// Tag value
    pub value: String,
}

/// Name plus tags, unique within a registry.
///
/// Tags are kept sorted by key; a repeated key keeps its last value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MeterId {
    /// Dotted meter name, e.g. `cache.hits`
    pub name: String,
    /// Sorted tags
    pub tags: Vec<Tag>,
}

impl MeterId {
    /// Creates an id from a name and key/value pairs.
    pub fn new<I, K, V>(name: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut sorted: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in tags {
            sorted.insert(key.into(), value.into());
        }
        Self {
            name: name.into(),
            tags: sorted
                .into_iter()
                .map(|(key, value)| Tag { key, value })
                .collect(),
        }
    }

    /// Value of the tag named `key`.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            let tags: Vec<String> = self
                .tags
                .iter()
                .map(|tag| format!("{}={}", tag.key, tag.value))
                .collect();
            write!(f, "{{{}}}", tags.join(","))?;
        }
        Ok(())
    }
}

// == Meter Descriptor ==
/// How a sampled value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    /// Instantaneous value that may go up and down
    Gauge,
    /// Monotonic count read from the source
    FunctionCounter,
    /// Accumulated time, in seconds
    TimeGauge,
}

/// Everything about a meter except its supplier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterDescriptor {
    /// Identity
    pub id: MeterId,
    /// Interpretation of the value
    pub kind: MeterKind,
    /// Unit, e.g. `seconds`
    pub base_unit: Option<String>,
    /// Human readable description
    pub description: String,
}

/// Reads the current value; `None` once the source is gone.
pub type Supplier = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

// == Meter Registry ==
/// Destination for cache metrics.
///
/// `owner` identifies the source of the meter. Registering an id again with
/// the same owner replaces the earlier registration; an id held by another
/// live owner is a conflict. A registration whose source is gone may be
/// taken over by any owner.
pub trait MeterRegistry: Send + Sync {
    /// Registers or replaces a meter. Returns true if it replaced one.
    fn register(&self, meter: MeterDescriptor, owner: u64, supplier: Supplier) -> Result<bool>;

    /// Removes a meter, returning whether it existed.
    fn remove(&self, id: &MeterId) -> bool;
}

// == Measurements ==
/// A sampled value. A stale measurement comes from a source that no longer
/// exists and always reads zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    /// Sampled value
    pub value: f64,
    /// True when the source is gone
    pub stale: bool,
}

impl Measurement {
    fn from_supplier(sample: Option<f64>) -> Self {
        match sample {
            Some(value) => Self {
                value,
                stale: false,
            },
            None => Self {
                value: 0.0,
                stale: true,
            },
        }
    }
}

/// One meter in a [`RegistrySnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct MeterSnapshot {
    /// Meter metadata
    #[serde(flatten)]
    pub meter: MeterDescriptor,
    /// Value at snapshot time
    pub measurement: Measurement,
}

/// Every meter of a registry sampled at one time.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// When sampling started
    pub taken_at: DateTime<Utc>,
    /// Meters sorted by id
    pub meters: Vec<MeterSnapshot>,
}

impl RegistrySnapshot {
    /// Measurement of the first meter called `name`.
    pub fn value(&self, name: &str) -> Option<Measurement> {
        self.meters
            .iter()
            .find(|m| m.meter.id.name == name)
            .map(|m| m.measurement)
    }

    /// Pretty JSON rendering.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// == Simple Meter Registry ==
struct Registration {
    meter: MeterDescriptor,
    owner: u64,
    supplier: Supplier,
}

/// In-memory registry. Suppliers are evaluated on every read, outside the
/// registry lock.
#[derive(Default)]
pub struct SimpleMeterRegistry {
    meters: RwLock<BTreeMap<MeterId, Registration>>,
}

impl SimpleMeterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered meters.
    pub fn len(&self) -> usize {
        self.meters.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.meters.read().is_empty()
    }

    /// Ids of all meters, sorted.
    pub fn ids(&self) -> Vec<MeterId> {
        self.meters.read().keys().cloned().collect()
    }

    /// Ids of all meters called `name`.
    pub fn find(&self, name: &str) -> Vec<MeterId> {
        self.meters
            .read()
            .keys()
            .filter(|id| id.name == name)
            .cloned()
            .collect()
    }

    /// Samples one meter.
    pub fn measure(&self, id: &MeterId) -> Option<Measurement> {
        let supplier = self.meters.read().get(id).map(|r| r.supplier.clone())?;
        Some(Measurement::from_supplier(supplier()))
    }

    /// Samples every meter.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let taken_at = Utc::now();
        let registered: Vec<(MeterDescriptor, Supplier)> = self
            .meters
            .read()
            .values()
            .map(|r| (r.meter.clone(), r.supplier.clone()))
            .collect();

        RegistrySnapshot {
            taken_at,
            meters: registered
                .into_iter()
                .map(|(meter, supplier)| MeterSnapshot {
                    meter,
                    measurement: Measurement::from_supplier(supplier()),
                })
                .collect(),
        }
    }
}

impl MeterRegistry for SimpleMeterRegistry {
    fn register(&self, meter: MeterDescriptor, owner: u64, supplier: Supplier) -> Result<bool> {
        let mut meters = self.meters.write();
        if let Some(existing) = meters.get(&meter.id).filter(|r| r.owner != owner) {
            // Suppliers never touch the registry, so sampling here cannot
            // re-enter the lock.
            if (existing.supplier)().is_some() {
                warn!(
                    "Refusing to register {}: already bound to cache {}",
                    meter.id, existing.owner
                );
                return Err(CacheError::Registration(format!(
                    "{} is already registered for cache {}",
                    meter.id, existing.owner
                )));
            }
            debug!(
                "Replacing stale {} of dropped cache {}",
                meter.id, existing.owner
            );
        }

        debug!("Registering {} for cache {}", meter.id, owner);
        let id = meter.id.clone();
        let previous = meters.insert(
            id,
            Registration {
                meter,
                owner,
                supplier,
            },
        );
        Ok(previous.is_some())
    }

    fn remove(&self, id: &MeterId) -> bool {
        self.meters.write().remove(id).is_some()
    }
}

impl fmt::Debug for SimpleMeterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleMeterRegistry")
            .field("meters", &self.ids())
            .finish()
    }
}
