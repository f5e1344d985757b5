//! Backup session agent
//!
//! Runs next to a workload and drives the backups and restores of that
//! workload through BackupSession and RestoreSession custom resources.

pub mod adapters;
pub mod cluster;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod session;

pub use error::{Error, Result};
