//! Prometheus metrics for the backup session agent
//!
//! This module exposes metrics for monitoring session reconciliation, backups and restores.

mod prometheus;

pub use self::prometheus::*;
