//! Agent configuration
//!
//! Built once at startup from the process environment, with CLI overrides for
//! the one-shot entrypoints, and then passed around explicitly.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default location of the restic binary
pub const DEFAULT_RESTIC_EXEC: &str = "/usr/bin/restic";

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Environment variable names
pub mod env {
    pub const TARGET_NAME: &str = "TARGET_NAME";
    pub const POD_NAMESPACE: &str = "POD_NAMESPACE";
    pub const POD_NAME: &str = "POD_NAME";
    pub const BACKUP_PATHS: &str = "BACKUP_PATHS";
    pub const RESTIC_EXEC: &str = "RESTIC_EXEC";
    pub const PROC_ROOT: &str = "PROC_ROOT";
    pub const METRICS_PORT: &str = "METRICS_PORT";
}

/// Runtime configuration of the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Target this process acts for
    pub target_name: String,
    /// Namespace of the agent pod and the sessions it watches
    pub namespace: String,
    pub pod_name: Option<String>,
    /// Paths backed up for in-place targets
    pub backup_paths: Vec<String>,
    pub restic_exec: PathBuf,
    pub proc_root: PathBuf,
    pub metrics_port: u16,
}

/// Values given on the command line that take precedence over the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target_name: Option<String>,
    pub namespace: Option<String>,
}

impl AgentConfig {
    /// Load from the process environment
    pub fn from_env(overrides: Overrides) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), overrides)
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F, overrides: Overrides) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let target_name = overrides
            .target_name
            .or_else(|| non_empty(env::TARGET_NAME))
            .ok_or_else(|| Error::config(format!("{} is not set", env::TARGET_NAME)))?;

        let namespace = overrides
            .namespace
            .or_else(|| non_empty(env::POD_NAMESPACE))
            .ok_or_else(|| Error::config(format!("{} is not set", env::POD_NAMESPACE)))?;

        let metrics_port = match non_empty(env::METRICS_PORT) {
            Some(port) => port.parse().map_err(|e| {
                Error::config(format!("Invalid {} '{}': {}", env::METRICS_PORT, port, e))
            })?,
            None => DEFAULT_METRICS_PORT,
        };

        Ok(Self {
            target_name,
            namespace,
            pod_name: non_empty(env::POD_NAME),
            backup_paths: non_empty(env::BACKUP_PATHS)
                .map(|p| parse_backup_paths(&p))
                .unwrap_or_default(),
            restic_exec: non_empty(env::RESTIC_EXEC)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESTIC_EXEC)),
            proc_root: non_empty(env::PROC_ROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/proc")),
            metrics_port,
        })
    }
}

/// Split a colon-separated path list, dropping empty entries
pub fn parse_backup_paths(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}
