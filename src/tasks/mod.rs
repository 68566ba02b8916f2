//! Background Tasks Module
//!
//! Contains background tasks that run periodically next to a cache.
//!
//! # Tasks
//! - Expiry cleanup: removes expired cache entries at a fixed interval
//! - Reporter: logs registry meters at a fixed interval

mod cleanup;
mod reporter;

pub use cleanup::{spawn_cleanup_task, spawn_configured_cleanup_task};
pub use reporter::{report_once, spawn_reporter_task};
