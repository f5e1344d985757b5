//! Capabilities shared by the session reconcilers
//!
//! A [`Context`] bundles the cluster store, the target runner, the backup
//! engine and the agent configuration. Both reconcilers and the controllers
//! receive it explicitly, so tests can swap any of them.

mod env;
mod function;
mod repository;
mod steps;

pub use env::resolve_function_env;
pub use function::{expand, expand_args};
pub use repository::build_repository_config;
pub use steps::StepPhase;

use std::sync::Arc;

use crate::adapters::{BackupEngine, TargetRunner};
use crate::cluster::ClusterStore;
use crate::config::AgentConfig;

/// Shared context for the reconcilers
pub struct Context {
    pub cluster: Arc<dyn ClusterStore>,
    pub runner: Arc<dyn TargetRunner>,
    pub engine: Arc<dyn BackupEngine>,
    pub config: AgentConfig,
}

impl Context {
    /// Create a new context
    pub fn new(
        cluster: Arc<dyn ClusterStore>,
        runner: Arc<dyn TargetRunner>,
        engine: Arc<dyn BackupEngine>,
        config: AgentConfig,
    ) -> Self {
        Self {
            cluster,
            runner,
            engine,
            config,
        }
    }

    /// Name of the target this agent serves
    pub fn target_name(&self) -> &str {
        &self.config.target_name
    }

    /// Namespace of the agent
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }
}
