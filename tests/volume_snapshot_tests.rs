//! Volume snapshot tests
//!
//! Snapshots of the sidecar volumes and the snapshot-backed backup Job.

mod common;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use backup_session_agent::crd::{BackupType, SessionState, TargetKind};
use backup_session_agent::reconcilers::volume_snapshot::{
    cleanup_session_volumes, snapshot_volumes, SnapshotReadiness,
};
use backup_session_agent::reconcilers::{backup, Outcome};
use common::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn harness() -> Harness {
    let h = Harness::new("web", &["/data"]);
    h.cluster
        .insert_volume_snapshot_class("csi-rbd-snap", CSI_DRIVER);
    h
}

fn claim_of(pod_spec: &PodSpec, volume: &str) -> PersistentVolumeClaimVolumeSource {
    pod_spec
        .volumes
        .iter()
        .flatten()
        .find(|v| v.name == volume)
        .and_then(|v| v.persistent_volume_claim.clone())
        .unwrap()
}

async fn reconcile_nightly(h: &Harness) -> Outcome {
    let session = h.backup_session("nightly");
    backup::reconcile(&h.ctx, &session).await.unwrap()
}

async fn snapshot(h: &Harness, session: &str, pod_spec: &mut PodSpec) -> SnapshotReadiness {
    let mounts = sidecar_mounts(pod_spec);
    snapshot_volumes(&h.ctx, session, &mounts, pod_spec)
        .await
        .unwrap()
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn repeated_calls_reuse_the_snapshot() {
    let h = harness();
    let mut pod_spec = pod_spec_with_sidecar(vec![seed_csi_volume(&h.cluster, "data")]);

    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Pending
    );
    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Pending
    );
    assert_eq!(h.cluster.volume_snapshot_names(NAMESPACE), vec!["nightly-data"]);
    assert_eq!(claim_of(&pod_spec, "data").claim_name, "data-pvc");

    let snapshot_object = h.cluster.volume_snapshot(NAMESPACE, "nightly-data").unwrap();
    assert_eq!(
        snapshot_object.spec.volume_snapshot_class_name.as_deref(),
        Some("csi-rbd-snap")
    );
    assert_eq!(
        snapshot_object
            .spec
            .source
            .persistent_volume_claim_name
            .as_deref(),
        Some("data-pvc")
    );
}

#[tokio::test]
async fn ready_snapshot_is_mounted_read_only() {
    let h = harness();
    let mut pod_spec = pod_spec_with_sidecar(vec![seed_csi_volume(&h.cluster, "data")]);
    snapshot(&h, "nightly", &mut pod_spec).await;
    assert!(h
        .cluster
        .mark_snapshot_ready(NAMESPACE, "nightly-data", Some("2Gi")));

    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Ready
    );

    let claim = claim_of(&pod_spec, "data");
    assert_eq!(claim.claim_name, "nightly-data");
    assert_eq!(claim.read_only, Some(true));

    let derived = h
        .cluster
        .persistent_volume_claim(NAMESPACE, "nightly-data")
        .unwrap();
    let spec = derived.spec.unwrap();
    assert_eq!(
        spec.resources.unwrap().requests.unwrap()["storage"],
        Quantity("2Gi".to_string())
    );
    assert_eq!(spec.data_source.unwrap().name, "nightly-data");

    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Ready
    );
    assert_eq!(h.cluster.volume_snapshot_names(NAMESPACE).len(), 1);
}

#[tokio::test]
async fn pending_volume_does_not_block_the_others() {
    let h = harness();
    let volumes = ["data", "logs", "cache"]
        .iter()
        .map(|v| seed_csi_volume(&h.cluster, v))
        .collect();
    let mut pod_spec = pod_spec_with_sidecar(volumes);

    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Pending
    );
    assert_eq!(h.cluster.volume_snapshot_names(NAMESPACE).len(), 3);

    h.cluster
        .mark_snapshot_ready(NAMESPACE, "nightly-data", Some("1Gi"));
    h.cluster
        .mark_snapshot_ready(NAMESPACE, "nightly-logs", Some("1Gi"));

    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Pending
    );
    assert_eq!(claim_of(&pod_spec, "data").claim_name, "nightly-data");
    assert_eq!(claim_of(&pod_spec, "logs").claim_name, "nightly-logs");
    assert_eq!(claim_of(&pod_spec, "cache").claim_name, "cache-pvc");
    assert!(h
        .cluster
        .persistent_volume_claim(NAMESPACE, "nightly-cache")
        .is_none());
}

#[tokio::test]
async fn volumes_that_cannot_be_snapshotted_are_left_alone() {
    let h = harness();
    h.cluster.insert_persistent_volume_claim(PersistentVolumeClaim {
        metadata: metadata("nfs-pvc"),
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some("pv-nfs".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });
    h.cluster.insert_persistent_volume(PersistentVolume {
        metadata: ObjectMeta {
            name: Some("pv-nfs".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec::default()),
        ..Default::default()
    });
    let mut pod_spec = pod_spec_with_sidecar(vec![
        Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "nfs".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "nfs-pvc".to_string(),
                read_only: None,
            }),
            ..Default::default()
        },
        Volume {
            name: "unbound".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "missing-pvc".to_string(),
                read_only: None,
            }),
            ..Default::default()
        },
    ]);

    assert_eq!(
        snapshot(&h, "nightly", &mut pod_spec).await,
        SnapshotReadiness::Ready
    );
    assert!(h.cluster.volume_snapshot_names(NAMESPACE).is_empty());
    assert_eq!(claim_of(&pod_spec, "nfs").claim_name, "nfs-pvc");
}

#[tokio::test]
async fn cleanup_removes_only_the_session_volumes() {
    let h = harness();
    let mut nightly = pod_spec_with_sidecar(vec![seed_csi_volume(&h.cluster, "data")]);
    let mut weekly = nightly.clone();
    snapshot(&h, "nightly", &mut nightly).await;
    snapshot(&h, "weekly", &mut weekly).await;
    h.cluster
        .mark_snapshot_ready(NAMESPACE, "nightly-data", None);
    snapshot(&h, "nightly", &mut nightly).await;
    assert!(h
        .cluster
        .persistent_volume_claim(NAMESPACE, "nightly-data")
        .is_some());

    cleanup_session_volumes(&h.ctx, "nightly").await.unwrap();

    assert_eq!(h.cluster.volume_snapshot_names(NAMESPACE), vec!["weekly-data"]);
    assert!(h
        .cluster
        .persistent_volume_claim(NAMESPACE, "nightly-data")
        .is_none());
    assert!(h
        .cluster
        .persistent_volume_claim(NAMESPACE, "data-pvc")
        .is_some());
}

// ============================================================================
// Snapshot-backed backups
// ============================================================================

#[tokio::test]
async fn snapshot_backup_runs_through_a_job() {
    let h = harness();
    let mut web = target("web", BackupType::Online, vec![container("nginx")]);
    web.volume_snapshot = true;
    h.cluster
        .insert_backup_configuration(backup_configuration(vec![web]));
    h.cluster.insert_workload(
        NAMESPACE,
        TargetKind::Deployment,
        "web",
        pod_spec_with_sidecar(vec![seed_csi_volume(&h.cluster, "data")]),
    );
    h.cluster.insert_backup_session(backup_session(
        "nightly",
        vec![target_status("web", SessionState::Running)],
    ));

    assert!(matches!(reconcile_nightly(&h).await, Outcome::Requeue(_)));
    assert_eq!(h.cluster.job_count(), 0);

    h.cluster
        .mark_snapshot_ready(NAMESPACE, "nightly-data", Some("1Gi"));
    assert_eq!(reconcile_nightly(&h).await, Outcome::Unchanged);
    assert_eq!(reconcile_nightly(&h).await, Outcome::Unchanged);
    assert_eq!(h.cluster.job_count(), 1);

    let job = h
        .cluster
        .job(NAMESPACE, &backup::snapshot_job_name("nightly", "web"))
        .unwrap();
    let job_pod = job.spec.unwrap().template.spec.unwrap();
    assert_eq!(claim_of(&job_pod, "data").claim_name, "nightly-data");
    assert!(h.engine.backups().is_empty());

    let outcome = backup::backup_from_snapshot_job(&h.ctx, NAMESPACE, "nightly", "web")
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Transitioned(SessionState::Finalize));
    assert_eq!(h.engine.backups()[0].paths, vec!["/data"]);
    assert_eq!(
        h.backup_target_status("nightly", "web").snapshot_id.as_deref(),
        Some("abc123")
    );

    assert_eq!(
        reconcile_nightly(&h).await,
        Outcome::Transitioned(SessionState::Success)
    );
    assert_eq!(h.cluster.job_count(), 0);
    assert!(h.cluster.volume_snapshot_names(NAMESPACE).is_empty());
    assert!(h
        .cluster
        .persistent_volume_claim(NAMESPACE, "nightly-data")
        .is_none());
}

#[tokio::test]
async fn snapshot_job_ignores_a_target_that_is_not_running() {
    let h = harness();
    let mut web = target("web", BackupType::Online, vec![container("nginx")]);
    web.volume_snapshot = true;
    h.cluster
        .insert_backup_configuration(backup_configuration(vec![web]));
    h.cluster.insert_backup_session(backup_session(
        "nightly",
        vec![target_status("web", SessionState::Finalize)],
    ));

    let outcome = backup::backup_from_snapshot_job(&h.ctx, NAMESPACE, "nightly", "web")
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Unchanged);
    assert!(h.engine.backups().is_empty());
}

#[tokio::test]
async fn finished_session_retries_cleanup_for_snapshot_targets() {
    let h = harness();
    let mut web = target("web", BackupType::Online, vec![container("nginx")]);
    web.volume_snapshot = true;
    h.cluster
        .insert_backup_configuration(backup_configuration(vec![web]));
    let mut pod_spec = pod_spec_with_sidecar(vec![seed_csi_volume(&h.cluster, "data")]);
    snapshot(&h, "nightly", &mut pod_spec).await;
    h.cluster.insert_backup_session(backup_session(
        "nightly",
        vec![target_status("web", SessionState::Success)],
    ));

    assert_eq!(reconcile_nightly(&h).await, Outcome::Unchanged);

    assert!(h.cluster.volume_snapshot_names(NAMESPACE).is_empty());
    assert_eq!(h.cluster.status_update_count(), 0);
}

#[tokio::test]
async fn finished_session_without_snapshots_skips_cleanup() {
    let h = harness();
    h.cluster.insert_backup_configuration(backup_configuration(vec![target(
        "web",
        BackupType::Online,
        vec![container("nginx")],
    )]));
    let mut pod_spec = pod_spec_with_sidecar(vec![seed_csi_volume(&h.cluster, "data")]);
    snapshot(&h, "nightly", &mut pod_spec).await;
    h.cluster.insert_backup_session(backup_session(
        "nightly",
        vec![target_status("web", SessionState::Failure)],
    ));

    assert_eq!(reconcile_nightly(&h).await, Outcome::Unchanged);

    assert_eq!(h.cluster.volume_snapshot_names(NAMESPACE), vec!["nightly-data"]);
}
