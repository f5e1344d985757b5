//! BackupConfiguration Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupConfiguration resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agent.backup.io",
    version = "v1alpha1",
    kind = "BackupConfiguration",
    plural = "backupconfigurations",
    singular = "backupconfiguration",
    shortname = "bc",
    namespaced,
    printcolumn = r#"{"name": "Repository", "type": "string", "jsonPath": ".spec.repository"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfigurationSpec {
    /// Name of the Repo resource holding the backup repository
    pub repository: String,

    /// Retention policy applied by the session cleanup
    #[serde(default)]
    pub keep: RetentionPolicy,

    /// Targets to back up
    pub targets: Vec<Target>,
}

impl BackupConfigurationSpec {
    /// Find a target by name
    pub fn target(&self, target_name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.target_name == target_name)
    }
}

/// Number of snapshots to keep per period
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default)]
    pub last: u32,
    #[serde(default)]
    pub daily: u32,
    #[serde(default)]
    pub weekly: u32,
    #[serde(default)]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
}

/// One backup/restore unit
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Name of the workload
    pub target_name: String,

    /// Kind of the workload owning the pod template
    #[serde(default)]
    pub target_kind: TargetKind,

    /// Backup strategy
    pub backup_type: BackupType,

    /// Containers of the workload taking part in the backup
    pub containers: Vec<TargetContainer>,

    /// Paths to back up when none are supplied by the environment
    #[serde(default)]
    pub paths: Vec<String>,

    /// Back up from storage snapshots of the workload's volumes
    #[serde(default)]
    pub volume_snapshot: bool,
}

impl Target {
    /// Deduplicated share paths of all containers, in declaration order
    pub fn share_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for container in &self.containers {
            if container.share_path.is_empty() {
                continue;
            }
            if !paths.contains(&container.share_path) {
                paths.push(container.share_path.clone());
            }
        }
        paths
    }
}

/// Workload kind holding the target pod template
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetKind {
    #[default]
    Deployment,
    StatefulSet,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Deployment => "Deployment",
            TargetKind::StatefulSet => "StatefulSet",
        }
    }
}

/// Backup strategy of a target
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupType {
    /// Delegated to job functions writing into the share paths
    Job,
    /// In place against the running container's mounted data
    Online,
    /// In place from the sidecar container
    Sidecar,
}

impl BackupType {
    /// Online and Sidecar targets share the in-place strategy
    pub fn is_in_place(self) -> bool {
        matches!(self, BackupType::Online | BackupType::Sidecar)
    }
}

/// A container of the target workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetContainer {
    /// Container name
    pub name: String,

    /// Directory shared between the container and the agent
    #[serde(default)]
    pub share_path: String,

    /// Hooks run at initialize or finalize
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Functions producing the data of Job targets
    #[serde(default)]
    pub job: Vec<JobStep>,
}

/// A hook bound to a phase
///
/// Steps run at initialize unless flagged `finalize`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Function name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<bool>,
}

impl Step {
    pub fn is_finalize(&self) -> bool {
        self.finalize.unwrap_or(false)
    }
}

/// A Function producing backup data
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    /// Function name
    pub name: String,
}
