//! Shared fixtures for the integration tests
//!
//! Reconcilers run against `MemoryCluster` with a recording target runner and
//! a scripted backup engine.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Container, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec,
    Secret, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use backup_session_agent::adapters::{BackupEngine, BackupResult, RepositoryConfig, TargetRunner};
use backup_session_agent::cluster::MemoryCluster;
use backup_session_agent::config::AgentConfig;
use backup_session_agent::crd::{
    Backend, BackupConfiguration, BackupConfigurationSpec, BackupSession, BackupSessionSpec,
    BackupSessionStatus, BackupType, ConfigRef, Function, FunctionSpec, Repo, RepoSpec,
    RetentionPolicy, S3Backend, SessionState, Step, Target, TargetContainer, TargetKind,
    TargetStatus, SIDECAR_CONTAINER_NAME,
};
use backup_session_agent::error::{Error, Result};
use backup_session_agent::session::Context;

pub const NAMESPACE: &str = "apps";
pub const CONFIG_NAME: &str = "nightly-config";
pub const CSI_DRIVER: &str = "rbd.csi.ceph.com";

// ============================================================================
// Fakes
// ============================================================================

/// One command run through the target runner
#[derive(Debug, Clone, PartialEq)]
pub struct RunCall {
    pub container: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Records commands, failing the ones whose executable is listed
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<RunCall>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeRunner {
    pub fn fail_command(&self, executable: &str) {
        self.failing.lock().unwrap().insert(executable.to_string());
    }

    pub fn calls(&self) -> Vec<RunCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn executables(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.command.first().cloned())
            .collect()
    }
}

#[async_trait]
impl TargetRunner for FakeRunner {
    async fn run(
        &self,
        container: &str,
        command: &[String],
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(RunCall {
            container: container.to_string(),
            command: command.to_vec(),
            args: args.to_vec(),
            env: env.clone(),
        });
        let executable = command.first().cloned().unwrap_or_default();
        if self.failing.lock().unwrap().contains(&executable) {
            return Err(Error::Command {
                command: executable,
                status: "exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}

/// One backup requested from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct BackupCall {
    pub url: String,
    pub tag: String,
    pub paths: Vec<String>,
}

/// Backup engine returning scripted results
pub struct FakeEngine {
    backups: Mutex<Vec<BackupCall>>,
    restores: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
    snapshot_id: Mutex<Option<String>>,
    fail_backup: Mutex<bool>,
    fail_restore: Mutex<bool>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            backups: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            snapshot_id: Mutex::new(Some("abc123".to_string())),
            fail_backup: Mutex::new(false),
            fail_restore: Mutex::new(false),
        }
    }
}

impl FakeEngine {
    pub fn fail_backups(&self) {
        *self.fail_backup.lock().unwrap() = true;
    }

    pub fn fail_restores(&self) {
        *self.fail_restore.lock().unwrap() = true;
    }

    pub fn set_snapshot_id(&self, snapshot_id: Option<&str>) {
        *self.snapshot_id.lock().unwrap() = snapshot_id.map(String::from);
    }

    pub fn backups(&self) -> Vec<BackupCall> {
        self.backups.lock().unwrap().clone()
    }

    pub fn restores(&self) -> Vec<String> {
        self.restores.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackupEngine for FakeEngine {
    async fn check_repo(&self, _repo: &RepositoryConfig) -> Result<()> {
        Ok(())
    }

    async fn backup_paths(
        &self,
        repo: &RepositoryConfig,
        tag: &str,
        paths: &[String],
    ) -> Result<BackupResult> {
        self.backups.lock().unwrap().push(BackupCall {
            url: repo.url.clone(),
            tag: tag.to_string(),
            paths: paths.to_vec(),
        });
        if *self.fail_backup.lock().unwrap() {
            return Err(Error::engine("repository unreachable"));
        }
        Ok(BackupResult {
            snapshot_id: self.snapshot_id.lock().unwrap().clone(),
            duration: Duration::from_millis(12_500),
        })
    }

    async fn restore_snapshot(&self, _repo: &RepositoryConfig, snapshot_id: &str) -> Result<()> {
        self.restores.lock().unwrap().push(snapshot_id.to_string());
        if *self.fail_restore.lock().unwrap() {
            return Err(Error::engine("snapshot not found"));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, _repo: &RepositoryConfig, snapshot_id: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(snapshot_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub cluster: Arc<MemoryCluster>,
    pub runner: Arc<FakeRunner>,
    pub engine: Arc<FakeEngine>,
    pub ctx: Context,
}

impl Harness {
    /// Agent for `target_name` with the given `BACKUP_PATHS`
    pub fn new(target_name: &str, backup_paths: &[&str]) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let runner = Arc::new(FakeRunner::default());
        let engine = Arc::new(FakeEngine::default());
        let config = AgentConfig {
            target_name: target_name.to_string(),
            namespace: NAMESPACE.to_string(),
            pod_name: None,
            backup_paths: backup_paths.iter().map(|p| p.to_string()).collect(),
            restic_exec: PathBuf::from("/usr/bin/restic"),
            proc_root: PathBuf::from("/proc"),
            metrics_port: 8080,
        };
        let ctx = Context::new(cluster.clone(), runner.clone(), engine.clone(), config);
        seed_repository(&cluster);
        Self {
            cluster,
            runner,
            engine,
            ctx,
        }
    }

    /// Current stored copy of a BackupSession
    pub fn backup_session(&self, name: &str) -> BackupSession {
        self.cluster.backup_session(NAMESPACE, name).unwrap()
    }

    pub fn backup_target_status(&self, name: &str, target: &str) -> TargetStatus {
        self.backup_session(name)
            .status
            .unwrap()
            .target(target)
            .cloned()
            .unwrap()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

pub fn seed_repository(cluster: &MemoryCluster) {
    let mut repo = Repo::new(
        "minio",
        RepoSpec {
            backend: Backend {
                s3: Some(S3Backend {
                    server: "minio:9000".to_string(),
                    bucket: "backups".to_string(),
                }),
            },
            repository_secrets: "repo-secrets".to_string(),
        },
    );
    repo.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.insert_repo(repo);

    cluster.insert_secret(Secret {
        metadata: metadata("repo-secrets"),
        data: Some(
            ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "RESTIC_PASSWORD"]
                .iter()
                .map(|k| (k.to_string(), ByteString(format!("{}-value", k).into_bytes())))
                .collect(),
        ),
        ..Default::default()
    });
}

pub fn function(name: &str, command: &[&str], args: &[&str]) -> Function {
    let mut function = Function::new(
        name,
        FunctionSpec {
            command: command.iter().map(|c| c.to_string()).collect(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: vec![],
            env_from: vec![],
        },
    );
    function.metadata.namespace = Some(NAMESPACE.to_string());
    function
}

pub fn container(name: &str) -> TargetContainer {
    TargetContainer {
        name: name.to_string(),
        share_path: String::new(),
        steps: vec![],
        job: vec![],
    }
}

pub fn initialize_step(function: &str) -> Step {
    Step {
        name: function.to_string(),
        finalize: None,
    }
}

pub fn finalize_step(function: &str) -> Step {
    Step {
        name: function.to_string(),
        finalize: Some(true),
    }
}

pub fn target(name: &str, backup_type: BackupType, containers: Vec<TargetContainer>) -> Target {
    Target {
        target_name: name.to_string(),
        target_kind: TargetKind::Deployment,
        backup_type,
        containers,
        paths: vec![],
        volume_snapshot: false,
    }
}

pub fn backup_configuration(targets: Vec<Target>) -> BackupConfiguration {
    let mut config = BackupConfiguration::new(
        CONFIG_NAME,
        BackupConfigurationSpec {
            repository: "minio".to_string(),
            keep: RetentionPolicy::default(),
            targets,
        },
    );
    config.metadata.namespace = Some(NAMESPACE.to_string());
    config
}

pub fn backup_session(name: &str, targets: Vec<TargetStatus>) -> BackupSession {
    let mut session = BackupSession::new(
        name,
        BackupSessionSpec {
            config_ref: ConfigRef {
                name: CONFIG_NAME.to_string(),
                namespace: None,
            },
        },
    );
    session.metadata.namespace = Some(NAMESPACE.to_string());
    session.status = Some(BackupSessionStatus { targets });
    session
}

pub fn target_status(name: &str, state: SessionState) -> TargetStatus {
    TargetStatus {
        session_state: state,
        ..TargetStatus::new(name)
    }
}

// ============================================================================
// Volume fixtures
// ============================================================================

/// Register a bound CSI claim `<volume>-pvc` backing pod volume `volume`
pub fn seed_csi_volume(cluster: &MemoryCluster, volume: &str) -> Volume {
    let claim_name = format!("{}-pvc", volume);
    let pv_name = format!("pv-{}", volume);

    cluster.insert_persistent_volume_claim(PersistentVolumeClaim {
        metadata: metadata(&claim_name),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some("csi-rbd".to_string()),
            volume_name: Some(pv_name.clone()),
            ..Default::default()
        }),
        ..Default::default()
    });
    cluster.insert_persistent_volume(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(pv_name),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER.to_string(),
                volume_handle: format!("handle-{}", volume),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name,
            read_only: None,
        }),
        ..Default::default()
    }
}

/// Pod template with the agent sidecar mounting every volume
pub fn pod_spec_with_sidecar(volumes: Vec<Volume>) -> PodSpec {
    let mounts = volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            mount_path: format!("/{}", v.name),
            read_only: Some(true),
            ..Default::default()
        })
        .collect();

    PodSpec {
        containers: vec![
            Container {
                name: "app".to_string(),
                image: Some("nginx:1.27".to_string()),
                ..Default::default()
            },
            Container {
                name: SIDECAR_CONTAINER_NAME.to_string(),
                image: Some("backup-agent:latest".to_string()),
                volume_mounts: Some(mounts),
                ..Default::default()
            },
        ],
        volumes: Some(volumes),
        ..Default::default()
    }
}

pub fn sidecar_mounts(pod_spec: &PodSpec) -> Vec<VolumeMount> {
    pod_spec
        .containers
        .iter()
        .find(|c| c.name == SIDECAR_CONTAINER_NAME)
        .and_then(|c| c.volume_mounts.clone())
        .unwrap_or_default()
}
