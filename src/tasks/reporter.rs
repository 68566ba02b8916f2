//! Metrics Reporter Task
//!
//! Periodically samples a registry and logs its meters.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::SimpleMeterRegistry;

/// Logs every meter whose name starts with `prefix`, returning how many were
/// logged. Stale meters are logged at warn level.
pub fn report_once(registry: &SimpleMeterRegistry, prefix: &str) -> usize {
    let snapshot = registry.snapshot();
    let mut reported = 0;

    for meter in snapshot
        .meters
        .iter()
        .filter(|m| m.meter.id.name.starts_with(prefix))
    {
        if meter.measurement.stale {
            warn!("{} = {} (stale)", meter.meter.id, meter.measurement.value);
        } else {
            info!("{} = {}", meter.meter.id, meter.measurement.value);
        }
        reported += 1;
    }
    reported
}

/// Spawns a task that calls [`report_once`] every `interval`.
///
/// # Returns
/// A JoinHandle for the spawned task; abort it to stop reporting.
pub fn spawn_reporter_task(
    registry: Arc<SimpleMeterRegistry>,
    prefix: impl Into<String>,
    interval: Duration,
) -> JoinHandle<()> {
    let prefix = prefix.into();

    tokio::spawn(async move {
        info!(
            "Starting metrics reporter for '{}' with interval of {:?}",
            prefix, interval
        );
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            report_once(&registry, &prefix);
        }
    })
}
