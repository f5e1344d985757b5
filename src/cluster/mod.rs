//! Cluster object store boundary
//!
//! The reconcilers only talk to the control plane through [`ClusterStore`].
//! [`KubeCluster`] is the production implementation; [`MemoryCluster`] keeps
//! everything in process and enforces the same optimistic concurrency on
//! status writes.

mod client;
mod memory;

pub use client::KubeCluster;
pub use memory::MemoryCluster;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, PodSpec, Secret,
};

use crate::crd::{
    BackupConfiguration, BackupSession, Function, Repo, RestoreSession, TargetKind,
    VolumeSnapshot, VolumeSnapshotClassInfo,
};
use crate::error::Result;

/// Typed access to the resources the agent reads and writes
///
/// Lookups of objects the agent depends on return `Error::NotFound` when the
/// object is missing; lookups of objects the agent may create return `None`.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_backup_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BackupConfiguration>;

    async fn get_backup_session(&self, namespace: &str, name: &str)
        -> Result<Option<BackupSession>>;

    /// Replace the status subresource, rejected if the resource version is stale
    async fn update_backup_session_status(&self, session: &BackupSession) -> Result<BackupSession>;

    async fn get_restore_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RestoreSession>>;

    /// Replace the status subresource, rejected if the resource version is stale
    async fn update_restore_session_status(
        &self,
        session: &RestoreSession,
    ) -> Result<RestoreSession>;

    async fn get_function(&self, namespace: &str, name: &str) -> Result<Function>;

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Repo>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Pod template of the workload owning a target
    async fn get_pod_spec(&self, namespace: &str, kind: TargetKind, name: &str) -> Result<PodSpec>;

    /// Replace the pod template of a workload, which rolls its pods
    async fn update_pod_spec(
        &self,
        namespace: &str,
        kind: TargetKind,
        name: &str,
        pod_spec: PodSpec,
    ) -> Result<()>;

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Delete the claims matching a label selector
    async fn delete_persistent_volume_claims(&self, namespace: &str, selector: &str) -> Result<()>;

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume>;

    async fn list_volume_snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClassInfo>>;

    async fn get_volume_snapshot(&self, namespace: &str, name: &str)
        -> Result<Option<VolumeSnapshot>>;

    async fn create_volume_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot>;

    /// Delete the snapshots matching a label selector
    async fn delete_volume_snapshots(&self, namespace: &str, selector: &str) -> Result<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Delete the Jobs matching a label selector along with their pods
    async fn delete_jobs(&self, namespace: &str, selector: &str) -> Result<()>;
}
