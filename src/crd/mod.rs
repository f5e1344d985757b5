//! Custom Resource Definitions for the backup session agent

mod backup_configuration;
mod backup_session;
mod function;
mod repo;
mod restore_session;
mod volume_snapshot;

pub use backup_configuration::*;
pub use backup_session::*;
pub use function::*;
pub use repo::*;
pub use restore_session::*;
pub use volume_snapshot::*;

use kube::CustomResourceExt;

/// Label linking snapshot volumes to the BackupSession that created them
pub const BACKUP_SESSION_LABEL: &str = "agent.backup.io/backup-session";

/// Name of the agent sidecar container in target pods
pub const SIDECAR_CONTAINER_NAME: &str = "backup-agent";

/// Name of the init-container injected for online restores
pub const RESTORE_CONTAINER_NAME: &str = "backup-agent-restore";

/// Name of the container running snapshot backups
pub const SNAPSHOT_JOB_CONTAINER_NAME: &str = "backup-agent-snapshot";

/// Environment variable tagging the target container processes
pub const TARGET_CONTAINER_TAG: &str = "BACKUP_AGENT_TARGET_CONTAINER";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![
        serde_yaml::to_string(&BackupConfiguration::crd()).unwrap(),
        serde_yaml::to_string(&BackupSession::crd()).unwrap(),
        serde_yaml::to_string(&RestoreSession::crd()).unwrap(),
        serde_yaml::to_string(&Function::crd()).unwrap(),
        serde_yaml::to_string(&Repo::crd()).unwrap(),
    ]
}
