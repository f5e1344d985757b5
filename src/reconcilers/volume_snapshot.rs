//! Storage snapshots of a target's volumes
//!
//! Before an in-place backup runs from snapshots, every persistent volume
//! mounted by the sidecar is snapshotted and a read-only claim is provisioned
//! from the snapshot. Snapshots and claims are named `<session>-<volume>`, so
//! repeated calls for the same session reuse what already exists.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, TypedLocalObjectReference,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::{
    VolumeSnapshot, VolumeSnapshotClassInfo, VolumeSnapshotSource, VolumeSnapshotSpec,
    BACKUP_SESSION_LABEL, SNAPSHOT_API_GROUP,
};
use crate::error::Result;
use crate::session::Context;

/// Aggregate state of the requested snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReadiness {
    /// Every snapshot is usable and the pod spec points at the derived claims
    Ready,
    /// At least one snapshot is still being taken
    Pending,
}

enum VolumeOutcome {
    Skipped,
    Pending,
    Ready,
}

/// Name shared by the snapshot and the claim derived from it
pub fn snapshot_name(session: &str, volume: &str) -> String {
    format!("{}-{}", session, volume)
}

/// Label selector matching the objects created for a session
pub fn session_selector(session: &str) -> String {
    format!("{}={}", BACKUP_SESSION_LABEL, session)
}

fn session_labels(session: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(BACKUP_SESSION_LABEL.to_string(), session.to_string())])
}

/// Snapshot the volumes behind `mounts` and point `pod_spec` at the copies
///
/// Volumes without a snapshot-capable CSI driver are left untouched. A
/// pending volume does not stop the others from being processed.
pub async fn snapshot_volumes(
    ctx: &Context,
    session: &str,
    mounts: &[VolumeMount],
    pod_spec: &mut PodSpec,
) -> Result<SnapshotReadiness> {
    let classes = ctx.cluster.list_volume_snapshot_classes().await?;
    let mut readiness = SnapshotReadiness::Ready;
    let mut seen = BTreeSet::new();

    for mount in mounts {
        if !seen.insert(mount.name.as_str()) {
            continue;
        }
        match snapshot_volume(ctx, session, &classes, &mount.name, pod_spec).await? {
            VolumeOutcome::Pending => readiness = SnapshotReadiness::Pending,
            VolumeOutcome::Ready | VolumeOutcome::Skipped => {}
        }
    }

    Ok(readiness)
}

async fn snapshot_volume(
    ctx: &Context,
    session: &str,
    classes: &[VolumeSnapshotClassInfo],
    volume_name: &str,
    pod_spec: &mut PodSpec,
) -> Result<VolumeOutcome> {
    let namespace = ctx.namespace();
    let name = snapshot_name(session, volume_name);

    let Some(claim_name) = pod_spec
        .volumes
        .iter()
        .flatten()
        .find(|v| v.name == volume_name)
        .and_then(|v| v.persistent_volume_claim.as_ref())
        .map(|pvc| pvc.claim_name.clone())
    else {
        debug!(volume = %volume_name, "Volume is not backed by a claim");
        return Ok(VolumeOutcome::Skipped);
    };
    if claim_name == name {
        return Ok(VolumeOutcome::Ready);
    }

    let Some(source_claim) = ctx
        .cluster
        .get_persistent_volume_claim(namespace, &claim_name)
        .await?
    else {
        warn!(claim = %claim_name, "Claim not found, volume not snapshotted");
        return Ok(VolumeOutcome::Skipped);
    };
    let Some(volume) = source_claim.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
        warn!(claim = %claim_name, "Claim is not bound, volume not snapshotted");
        return Ok(VolumeOutcome::Skipped);
    };
    let persistent_volume = match ctx.cluster.get_persistent_volume(&volume).await {
        Ok(pv) => pv,
        Err(e) if e.is_lookup_failure() => {
            warn!(volume = %volume, "PersistentVolume not found, volume not snapshotted");
            return Ok(VolumeOutcome::Skipped);
        }
        Err(e) => return Err(e),
    };
    let Some(driver) = persistent_volume
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .map(|csi| csi.driver.clone())
    else {
        debug!(volume = %volume, "Not a CSI volume, cannot snapshot");
        return Ok(VolumeOutcome::Skipped);
    };
    let Some(class) = classes.iter().find(|c| c.driver == driver) else {
        debug!(driver = %driver, "No VolumeSnapshotClass for driver");
        return Ok(VolumeOutcome::Skipped);
    };

    let snapshot = match ctx.cluster.get_volume_snapshot(namespace, &name).await? {
        Some(snapshot) => snapshot,
        None => {
            let snapshot = VolumeSnapshot {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(session_labels(session)),
                    ..Default::default()
                },
                spec: VolumeSnapshotSpec {
                    source: VolumeSnapshotSource {
                        persistent_volume_claim_name: Some(claim_name.clone()),
                        volume_snapshot_content_name: None,
                    },
                    volume_snapshot_class_name: Some(class.name.clone()),
                },
                status: None,
            };
            match ctx.cluster.create_volume_snapshot(namespace, &snapshot).await {
                Ok(_) => info!(snapshot = %name, claim = %claim_name, "Created VolumeSnapshot"),
                Err(e) if e.is_conflict() => debug!(snapshot = %name, "VolumeSnapshot already exists"),
                Err(e) => return Err(e),
            }
            return Ok(VolumeOutcome::Pending);
        }
    };

    if !snapshot.is_ready() {
        debug!(snapshot = %name, "VolumeSnapshot not ready yet");
        return Ok(VolumeOutcome::Pending);
    }

    if ctx
        .cluster
        .get_persistent_volume_claim(namespace, &name)
        .await?
        .is_none()
    {
        let claim = derived_claim(session, &name, &source_claim, &snapshot);
        match ctx.cluster.create_persistent_volume_claim(namespace, &claim).await {
            Ok(_) => info!(claim = %name, snapshot = %snapshot.name_any(), "Created claim from snapshot"),
            Err(e) if e.is_conflict() => debug!(claim = %name, "Claim already exists"),
            Err(e) => return Err(e),
        }
    }

    for pod_volume in pod_spec.volumes.iter_mut().flatten() {
        if pod_volume.name != volume_name {
            continue;
        }
        if let Some(pvc) = pod_volume.persistent_volume_claim.as_mut() {
            pvc.claim_name = name.clone();
            pvc.read_only = Some(true);
        }
    }

    Ok(VolumeOutcome::Ready)
}

/// Read-only copy of `source` provisioned from `snapshot`
fn derived_claim(
    session: &str,
    name: &str,
    source: &PersistentVolumeClaim,
    snapshot: &VolumeSnapshot,
) -> PersistentVolumeClaim {
    let source_spec = source.spec.clone().unwrap_or_default();
    let size = snapshot
        .status
        .as_ref()
        .and_then(|s| s.restore_size.clone())
        .map(Quantity)
        .or_else(|| {
            source_spec
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get("storage").cloned())
        });

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: source.namespace(),
            labels: Some(session_labels(session)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: source_spec.access_modes.clone(),
            storage_class_name: source_spec.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: size.map(|size| BTreeMap::from([("storage".to_string(), size)])),
                ..Default::default()
            }),
            data_source: Some(TypedLocalObjectReference {
                api_group: Some(SNAPSHOT_API_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name: snapshot.name_any(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Delete the backup Jobs, claims and snapshots created for a session
///
/// Jobs go first: their pods mount the derived claims, which stay in
/// Terminating while any pod still uses them.
pub async fn cleanup_session_volumes(ctx: &Context, session: &str) -> Result<()> {
    let selector = session_selector(session);
    ctx.cluster.delete_jobs(ctx.namespace(), &selector).await?;
    ctx.cluster
        .delete_persistent_volume_claims(ctx.namespace(), &selector)
        .await?;
    ctx.cluster
        .delete_volume_snapshots(ctx.namespace(), &selector)
        .await?;
    debug!(session = %session, "Removed session volumes");
    Ok(())
}
