//! ClusterStore backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, PodSpec, Secret,
};
use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
        PatchParams, PostParams,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use super::ClusterStore;
use crate::crd::{
    BackupConfiguration, BackupSession, Function, Repo, RestoreSession, TargetKind,
    VolumeSnapshot, VolumeSnapshotClassInfo, SNAPSHOT_API_GROUP,
};
use crate::error::{Error, Result};

/// Field manager recorded on status patches
const FIELD_MANAGER: &str = "backup-session-agent";

/// ClusterStore talking to the API server through a kube `Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Turn a 404 into a typed lookup failure
fn not_found<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(kube::Error) -> Error + 'a {
    move |e| match e {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(kind, name),
        other => Error::Kube(other),
    }
}

/// Merge patch carrying the observed resource version
///
/// The API server rejects the patch with a 409 when the object changed since
/// it was read, which gives status writes optimistic concurrency.
fn status_patch<S: serde::Serialize>(resource_version: Option<String>, status: &S) -> serde_json::Value {
    json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    })
}

#[async_trait]
impl ClusterStore for KubeCluster {
    async fn get_backup_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BackupConfiguration> {
        let api: Api<BackupConfiguration> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(not_found("BackupConfiguration", name))
    }

    async fn get_backup_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupSession>> {
        let api: Api<BackupSession> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_backup_session_status(&self, session: &BackupSession) -> Result<BackupSession> {
        let name = session.name_any();
        let namespace = session.namespace().unwrap_or_default();
        let api: Api<BackupSession> = Api::namespaced(self.client.clone(), &namespace);
        let patch = status_patch(session.resource_version(), &session.status);
        debug!(name = %name, "Patching BackupSession status");
        Ok(api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?)
    }

    async fn get_restore_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RestoreSession>> {
        let api: Api<RestoreSession> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_restore_session_status(
        &self,
        session: &RestoreSession,
    ) -> Result<RestoreSession> {
        let name = session.name_any();
        let namespace = session.namespace().unwrap_or_default();
        let api: Api<RestoreSession> = Api::namespaced(self.client.clone(), &namespace);
        let patch = status_patch(session.resource_version(), &session.status);
        debug!(name = %name, "Patching RestoreSession status");
        Ok(api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?)
    }

    async fn get_function(&self, namespace: &str, name: &str) -> Result<Function> {
        let api: Api<Function> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(not_found("Function", name))
    }

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Repo> {
        let api: Api<Repo> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(not_found("Repo", name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(not_found("Secret", name))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(not_found("ConfigMap", name))
    }

    async fn get_pod_spec(&self, namespace: &str, kind: TargetKind, name: &str) -> Result<PodSpec> {
        let pod_spec = match kind {
            TargetKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let deployment = api.get(name).await.map_err(not_found("Deployment", name))?;
                deployment.spec.and_then(|s| s.template.spec)
            }
            TargetKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let statefulset = api.get(name).await.map_err(not_found("StatefulSet", name))?;
                statefulset.spec.and_then(|s| s.template.spec)
            }
        };
        pod_spec.ok_or_else(|| {
            Error::validation(format!("{} {} has no pod template", kind.as_str(), name))
        })
    }

    async fn update_pod_spec(
        &self,
        namespace: &str,
        kind: TargetKind,
        name: &str,
        pod_spec: PodSpec,
    ) -> Result<()> {
        let pp = PostParams::default();
        match kind {
            TargetKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let mut deployment = api.get(name).await.map_err(not_found("Deployment", name))?;
                if let Some(spec) = deployment.spec.as_mut() {
                    spec.template.spec = Some(pod_spec);
                }
                api.replace(name, &pp, &deployment).await?;
            }
            TargetKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let mut statefulset = api.get(name).await.map_err(not_found("StatefulSet", name))?;
                if let Some(spec) = statefulset.spec.as_mut() {
                    spec.template.spec = Some(pod_spec);
                }
                api.replace(name, &pp, &statefulset).await?;
            }
        }
        Ok(())
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), claim).await?)
    }

    async fn delete_persistent_volume_claims(&self, namespace: &str, selector: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::default(), &ListParams::default().labels(selector))
            .await?;
        Ok(())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name).await.map_err(not_found("PersistentVolume", name))
    }

    async fn list_volume_snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClassInfo>> {
        let gvk = GroupVersionKind::gvk(SNAPSHOT_API_GROUP, "v1", "VolumeSnapshotClass");
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let classes = api.list(&ListParams::default()).await?;

        Ok(classes
            .items
            .into_iter()
            .filter_map(|class| {
                let driver = class.data.get("driver")?.as_str()?.to_string();
                Some(VolumeSnapshotClassInfo {
                    name: class.name_any(),
                    driver,
                })
            })
            .collect())
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_volume_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), snapshot).await?)
    }

    async fn delete_volume_snapshots(&self, namespace: &str, selector: &str) -> Result<()> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::default(), &ListParams::default().labels(selector))
            .await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn delete_jobs(&self, namespace: &str, selector: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::background(), &ListParams::default().labels(selector))
            .await?;
        Ok(())
    }
}
