//! In-process ClusterStore
//!
//! Used by the one-shot entrypoint tests and the integration suite. Objects
//! carry a resource version that is bumped on every write, and status writes
//! made from a stale copy are rejected with a 409 like the API server does.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, PodSpec, Secret,
};
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};

use super::ClusterStore;
use crate::crd::{
    BackupConfiguration, BackupSession, Function, Repo, RestoreSession, TargetKind,
    VolumeSnapshot, VolumeSnapshotClassInfo, VolumeSnapshotStatus,
};
use crate::error::{Error, Result};

type Key = (String, String);

#[derive(Default)]
struct State {
    version: u64,
    configurations: BTreeMap<Key, BackupConfiguration>,
    backup_sessions: BTreeMap<Key, BackupSession>,
    restore_sessions: BTreeMap<Key, RestoreSession>,
    functions: BTreeMap<Key, Function>,
    repos: BTreeMap<Key, Repo>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    workloads: BTreeMap<(String, &'static str, String), PodSpec>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    snapshot_classes: Vec<VolumeSnapshotClassInfo>,
    snapshots: BTreeMap<Key, VolumeSnapshot>,
    jobs: BTreeMap<Key, Job>,
    status_updates: usize,
    pod_spec_updates: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Store an object under a fresh resource version
    fn stamp<K: Resource>(&mut self, obj: &mut K) -> Key {
        obj.meta_mut().resource_version = Some(self.next_version());
        key_of(obj)
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn conflict(kind: &str, name: &str) -> Error {
    api_error(
        409,
        "Conflict",
        format!("the object has been modified; {} {} is stale", kind, name),
    )
}

fn already_exists(kind: &str, name: &str) -> Error {
    api_error(409, "AlreadyExists", format!("{} {} already exists", kind, name))
}

/// Equality-based label selector: `a=b,c=d`
fn matches_selector<K: Resource>(obj: &K, selector: &str) -> bool {
    let labels = obj.meta().labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

/// ClusterStore holding every object in memory
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_backup_configuration(&self, mut config: BackupConfiguration) {
        let mut state = self.state();
        let key = state.stamp(&mut config);
        state.configurations.insert(key, config);
    }

    /// Store a BackupSession and return the stored copy
    pub fn insert_backup_session(&self, mut session: BackupSession) -> BackupSession {
        let mut state = self.state();
        let key = state.stamp(&mut session);
        state.backup_sessions.insert(key, session.clone());
        session
    }

    pub fn backup_session(&self, namespace: &str, name: &str) -> Option<BackupSession> {
        self.state()
            .backup_sessions
            .get(&key(namespace, name))
            .cloned()
    }

    /// Store a RestoreSession and return the stored copy
    pub fn insert_restore_session(&self, mut session: RestoreSession) -> RestoreSession {
        let mut state = self.state();
        let key = state.stamp(&mut session);
        state.restore_sessions.insert(key, session.clone());
        session
    }

    pub fn restore_session(&self, namespace: &str, name: &str) -> Option<RestoreSession> {
        self.state()
            .restore_sessions
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn insert_function(&self, mut function: Function) {
        let mut state = self.state();
        let key = state.stamp(&mut function);
        state.functions.insert(key, function);
    }

    pub fn insert_repo(&self, mut repo: Repo) {
        let mut state = self.state();
        let key = state.stamp(&mut repo);
        state.repos.insert(key, repo);
    }

    pub fn insert_secret(&self, mut secret: Secret) {
        let mut state = self.state();
        let key = state.stamp(&mut secret);
        state.secrets.insert(key, secret);
    }

    pub fn insert_config_map(&self, mut config_map: ConfigMap) {
        let mut state = self.state();
        let key = state.stamp(&mut config_map);
        state.config_maps.insert(key, config_map);
    }

    /// Register a Deployment or StatefulSet by its pod template
    pub fn insert_workload(&self, namespace: &str, kind: TargetKind, name: &str, pod_spec: PodSpec) {
        self.state()
            .workloads
            .insert((namespace.to_string(), kind.as_str(), name.to_string()), pod_spec);
    }

    pub fn pod_spec(&self, namespace: &str, kind: TargetKind, name: &str) -> Option<PodSpec> {
        self.state()
            .workloads
            .get(&(namespace.to_string(), kind.as_str(), name.to_string()))
            .cloned()
    }

    pub fn insert_persistent_volume_claim(&self, mut claim: PersistentVolumeClaim) {
        let mut state = self.state();
        let key = state.stamp(&mut claim);
        state.claims.insert(key, claim);
    }

    pub fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(&key(namespace, name)).cloned()
    }

    pub fn insert_persistent_volume(&self, mut volume: PersistentVolume) {
        let mut state = self.state();
        volume.metadata.resource_version = Some(state.next_version());
        state.volumes.insert(volume.name_any(), volume);
    }

    pub fn insert_volume_snapshot_class(&self, name: &str, driver: &str) {
        self.state().snapshot_classes.push(VolumeSnapshotClassInfo {
            name: name.to_string(),
            driver: driver.to_string(),
        });
    }

    pub fn volume_snapshot(&self, namespace: &str, name: &str) -> Option<VolumeSnapshot> {
        self.state().snapshots.get(&key(namespace, name)).cloned()
    }

    pub fn volume_snapshot_names(&self, namespace: &str) -> Vec<String> {
        self.state()
            .snapshots
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Simulate the snapshot controller finishing a snapshot
    pub fn mark_snapshot_ready(&self, namespace: &str, name: &str, restore_size: Option<&str>) -> bool {
        let mut state = self.state();
        let version = state.next_version();
        match state.snapshots.get_mut(&key(namespace, name)) {
            Some(snapshot) => {
                snapshot.status = Some(VolumeSnapshotStatus {
                    ready_to_use: Some(true),
                    restore_size: restore_size.map(String::from),
                });
                snapshot.metadata.resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state().jobs.get(&key(namespace, name)).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }

    /// Number of accepted session status writes
    pub fn status_update_count(&self) -> usize {
        self.state().status_updates
    }

    /// Number of workload pod template replacements
    pub fn pod_spec_update_count(&self) -> usize {
        self.state().pod_spec_updates
    }
}

#[async_trait]
impl ClusterStore for MemoryCluster {
    async fn get_backup_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BackupConfiguration> {
        self.state()
            .configurations
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("BackupConfiguration", name))
    }

    async fn get_backup_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupSession>> {
        Ok(self.backup_session(namespace, name))
    }

    async fn update_backup_session_status(&self, session: &BackupSession) -> Result<BackupSession> {
        let mut state = self.state();
        let version = state.next_version();
        let name = session.name_any();
        let stored = state
            .backup_sessions
            .get_mut(&key_of(session))
            .ok_or_else(|| Error::not_found("BackupSession", name.clone()))?;
        if stored.metadata.resource_version != session.metadata.resource_version {
            return Err(conflict("BackupSession", &name));
        }
        stored.status = session.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_updates += 1;
        Ok(updated)
    }

    async fn get_restore_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RestoreSession>> {
        Ok(self.restore_session(namespace, name))
    }

    async fn update_restore_session_status(
        &self,
        session: &RestoreSession,
    ) -> Result<RestoreSession> {
        let mut state = self.state();
        let version = state.next_version();
        let name = session.name_any();
        let stored = state
            .restore_sessions
            .get_mut(&key_of(session))
            .ok_or_else(|| Error::not_found("RestoreSession", name.clone()))?;
        if stored.metadata.resource_version != session.metadata.resource_version {
            return Err(conflict("RestoreSession", &name));
        }
        stored.status = session.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_updates += 1;
        Ok(updated)
    }

    async fn get_function(&self, namespace: &str, name: &str) -> Result<Function> {
        self.state()
            .functions
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("Function", name))
    }

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Repo> {
        self.state()
            .repos
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("Repo", name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.state()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("Secret", name))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.state()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("ConfigMap", name))
    }

    async fn get_pod_spec(&self, namespace: &str, kind: TargetKind, name: &str) -> Result<PodSpec> {
        self.pod_spec(namespace, kind, name)
            .ok_or_else(|| Error::not_found(kind.as_str(), name))
    }

    async fn update_pod_spec(
        &self,
        namespace: &str,
        kind: TargetKind,
        name: &str,
        pod_spec: PodSpec,
    ) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .workloads
            .get_mut(&(namespace.to_string(), kind.as_str(), name.to_string()))
            .ok_or_else(|| Error::not_found(kind.as_str(), name))?;
        *entry = pod_spec;
        state.pod_spec_updates += 1;
        Ok(())
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.persistent_volume_claim(namespace, name))
    }

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let mut state = self.state();
        let name = claim.name_any();
        if state.claims.contains_key(&key(namespace, &name)) {
            return Err(already_exists("PersistentVolumeClaim", &name));
        }
        let mut claim = claim.clone();
        claim.metadata.namespace = Some(namespace.to_string());
        let key = state.stamp(&mut claim);
        state.claims.insert(key, claim.clone());
        Ok(claim)
    }

    async fn delete_persistent_volume_claims(&self, namespace: &str, selector: &str) -> Result<()> {
        self.state()
            .claims
            .retain(|(ns, _), claim| ns != namespace || !matches_selector(claim, selector));
        Ok(())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.state()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("PersistentVolume", name))
    }

    async fn list_volume_snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClassInfo>> {
        Ok(self.state().snapshot_classes.clone())
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        Ok(self.volume_snapshot(namespace, name))
    }

    async fn create_volume_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot> {
        let mut state = self.state();
        let name = snapshot.name_any();
        if state.snapshots.contains_key(&key(namespace, &name)) {
            return Err(already_exists("VolumeSnapshot", &name));
        }
        let mut snapshot = snapshot.clone();
        snapshot.metadata.namespace = Some(namespace.to_string());
        let key = state.stamp(&mut snapshot);
        state.snapshots.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_volume_snapshots(&self, namespace: &str, selector: &str) -> Result<()> {
        self.state()
            .snapshots
            .retain(|(ns, _), snapshot| ns != namespace || !matches_selector(snapshot, selector));
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let mut state = self.state();
        let name = job.name_any();
        if state.jobs.contains_key(&key(namespace, &name)) {
            return Err(already_exists("Job", &name));
        }
        let mut job = job.clone();
        job.metadata.namespace = Some(namespace.to_string());
        let key = state.stamp(&mut job);
        state.jobs.insert(key, job.clone());
        Ok(job)
    }

    async fn delete_jobs(&self, namespace: &str, selector: &str) -> Result<()> {
        self.state()
            .jobs
            .retain(|(ns, _), job| ns != namespace || !matches_selector(job, selector));
        Ok(())
    }
}
