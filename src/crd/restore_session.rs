//! RestoreSession Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BackupSessionSpec, BackupSessionStatus, TargetStatus};

/// RestoreSession resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agent.backup.io",
    version = "v1alpha1",
    kind = "RestoreSession",
    plural = "restoresessions",
    singular = "restoresession",
    shortname = "rs",
    namespaced,
    status = "RestoreSessionStatus",
    printcolumn = r#"{"name": "BackupSession", "type": "string", "jsonPath": ".spec.backupSessionRef.name"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionSpec {
    /// The BackupSession being restored
    pub backup_session_ref: BackupSessionRef,
}

/// Copy of the originating BackupSession
///
/// Spec and status are denormalised so the restore survives the source
/// BackupSession being pruned.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionRef {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    pub spec: BackupSessionSpec,

    #[serde(default)]
    pub status: BackupSessionStatus,
}

/// RestoreSession status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionStatus {
    #[serde(default)]
    pub targets: Vec<TargetStatus>,
}

impl RestoreSessionStatus {
    pub fn target(&self, target_name: &str) -> Option<&TargetStatus> {
        self.targets.iter().find(|t| t.target_name == target_name)
    }

    pub fn target_mut(&mut self, target_name: &str) -> Option<&mut TargetStatus> {
        self.targets
            .iter_mut()
            .find(|t| t.target_name == target_name)
    }
}
