//! Metrics Module
//!
//! Exports cache statistics into an explicit meter registry.

mod binder;
mod registry;

pub use binder::CacheMetrics;
pub use registry::{
    Measurement, MeterDescriptor, MeterId, MeterKind, MeterRegistry, MeterSnapshot,
    RegistrySnapshot, SimpleMeterRegistry, Supplier, Tag,
};
