//! BackupSession reconciler
//!
//! Drives the status entry of the agent's target through a backup:
//! - Initialize steps (quiesce the application)
//! - Job functions or an in-place backup of the target paths
//! - Snapshot-backed backups through a batch Job
//! - Finalize steps and cleanup of snapshot volumes

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Volume};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use super::volume_snapshot::{cleanup_session_volumes, snapshot_volumes, SnapshotReadiness};
use super::{Outcome, Transition, WAIT_REQUEUE};
use crate::crd::{
    BackupConfiguration, BackupSession, BackupType, SessionState, Target,
    BACKUP_SESSION_LABEL, SIDECAR_CONTAINER_NAME, SNAPSHOT_JOB_CONTAINER_NAME,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{Context, StepPhase};

const KIND: &str = "BackupSession";

/// Finished snapshot Jobs are garbage collected after this long
const SNAPSHOT_JOB_TTL_SECONDS: i32 = 3600;

/// Reconcile a delivered BackupSession for the agent's target
pub async fn reconcile(ctx: &Context, delivered: &BackupSession) -> Result<Outcome> {
    let name = delivered.name_any();
    let namespace = delivered
        .namespace()
        .unwrap_or_else(|| ctx.namespace().to_string());

    let Some(session) = ctx.cluster.get_backup_session(&namespace, &name).await? else {
        debug!(name = %name, "BackupSession no longer exists");
        return Ok(Outcome::Unchanged);
    };
    if session.resource_version() != delivered.resource_version() {
        debug!(name = %name, "Stale delivery, a newer version exists");
        return Ok(Outcome::Unchanged);
    }

    let status = session.status.clone().unwrap_or_default();
    if status.targets.is_empty() {
        debug!(name = %name, "BackupSession has no targets yet");
        return Ok(Outcome::Requeue(WAIT_REQUEUE));
    }
    let Some(target_status) = status.target(ctx.target_name()) else {
        debug!(name = %name, target = %ctx.target_name(), "No status entry for this target");
        return Ok(Outcome::Unchanged);
    };

    let state = target_status.session_state;
    if state.is_terminal() {
        if uses_volume_snapshots(ctx, &session, &namespace).await {
            if let Err(e) = cleanup_session_volumes(ctx, &name).await {
                warn!(name = %name, error = %e, "Unable to clean up snapshot volumes");
            }
        }
        return Ok(Outcome::Unchanged);
    }

    let config = backup_configuration(ctx, &session, &namespace).await?;
    let target = config
        .spec
        .target(ctx.target_name())
        .ok_or_else(|| {
            Error::validation(format!(
                "target {} is not part of BackupConfiguration {}",
                ctx.target_name(),
                config.name_any()
            ))
        })?
        .clone();

    info!(name = %name, target = %target.target_name, state = %state, "Reconciling BackupSession");

    let transition = match state {
        SessionState::New => Transition::to(SessionState::Initializing).starting(),
        SessionState::Initializing => {
            match ctx.run_steps(&target, StepPhase::Initialize).await {
                Ok(()) => Transition::to(SessionState::Initialized),
                Err(e) if e.is_lookup_failure() => return Err(e),
                Err(e) => {
                    error!(target = %target.target_name, error = %e, "Initialize steps failed");
                    Transition::to(SessionState::Failure).with_message(e.to_string())
                }
            }
        }
        SessionState::Initialized => Transition::to(SessionState::Running),
        SessionState::Running => {
            if target.backup_type.is_in_place() && target.volume_snapshot {
                return start_snapshot_backup(ctx, &session, &target).await;
            }
            run_backup(ctx, &session, &config, &target).await?
        }
        SessionState::Waiting => Transition::to(SessionState::Finalize),
        SessionState::Finalize => {
            let steps = match ctx.run_steps(&target, StepPhase::Finalize).await {
                Err(e) if e.is_lookup_failure() => return Err(e),
                steps => steps,
            };
            if target.volume_snapshot {
                if let Err(e) = cleanup_session_volumes(ctx, &name).await {
                    warn!(name = %name, error = %e, "Unable to clean up snapshot volumes");
                }
            }
            finalize_transition(steps, target_status.snapshot_id.is_some())
        }
        SessionState::Success | SessionState::Failure => return Ok(Outcome::Unchanged),
    };

    write_transition(ctx, session, transition).await
}

/// Terminal transition once the finalize steps ran
fn finalize_transition(steps: Result<()>, has_snapshot: bool) -> Transition {
    match (steps, has_snapshot) {
        (Ok(()), true) => Transition::to(SessionState::Success),
        (Ok(()), false) => Transition::to(SessionState::Failure),
        (Err(e), _) => {
            error!(error = %e, "Finalize steps failed");
            Transition::to(SessionState::Failure).with_message(e.to_string())
        }
    }
}

async fn backup_configuration(
    ctx: &Context,
    session: &BackupSession,
    namespace: &str,
) -> Result<BackupConfiguration> {
    let config_ref = &session.spec.config_ref;
    let config_namespace = config_ref.namespace.as_deref().unwrap_or(namespace);
    let config = ctx
        .cluster
        .get_backup_configuration(config_namespace, &config_ref.name)
        .await?;
    if config.spec.targets.is_empty() {
        return Err(Error::validation(format!(
            "BackupConfiguration {} has no targets",
            config_ref.name
        )));
    }
    Ok(config)
}

/// Whether the agent's target backs up from volume snapshots
///
/// Used for the cleanup retry on finished sessions, so a missing
/// configuration is not an error there.
async fn uses_volume_snapshots(ctx: &Context, session: &BackupSession, namespace: &str) -> bool {
    match backup_configuration(ctx, session, namespace).await {
        Ok(config) => config
            .spec
            .target(ctx.target_name())
            .is_some_and(|t| t.volume_snapshot),
        Err(e) => {
            debug!(name = %session.name_any(), error = %e, "No configuration for a finished session");
            false
        }
    }
}

/// Paths backed up for an in-place target
fn in_place_paths(ctx: &Context, target: &Target) -> Vec<String> {
    if ctx.config.backup_paths.is_empty() {
        target.paths.clone()
    } else {
        ctx.config.backup_paths.clone()
    }
}

/// Produce and back up the target's data, always moving on to Finalize
async fn run_backup(
    ctx: &Context,
    session: &BackupSession,
    config: &BackupConfiguration,
    target: &Target,
) -> Result<Transition> {
    let paths = match target.backup_type {
        BackupType::Job => {
            match ctx.run_job_steps(target).await {
                Ok(()) => {}
                Err(e) if e.is_lookup_failure() => return Err(e),
                Err(e) => {
                    error!(target = %target.target_name, error = %e, "Job functions failed");
                    return Ok(Transition::to(SessionState::Finalize)
                        .timed()
                        .with_message(e.to_string()));
                }
            }
            target.share_paths()
        }
        BackupType::Online | BackupType::Sidecar => in_place_paths(ctx, target),
    };

    let repo = ctx.repository_config(config).await?;
    let timer = metrics::BACKUP_DURATION
        .with_label_values(&[ctx.namespace(), target.target_name.as_str()])
        .start_timer();
    let result = ctx
        .engine
        .backup_paths(&repo, &session.name_any(), &paths)
        .await;
    timer.observe_duration();

    Ok(match result {
        Ok(result) => {
            info!(
                target = %target.target_name,
                snapshot_id = ?result.snapshot_id,
                duration = ?result.duration,
                "Backup completed"
            );
            Transition::to(SessionState::Finalize).with_snapshot(result.snapshot_id)
        }
        Err(e) => {
            error!(target = %target.target_name, error = %e, "Backup failed");
            Transition::to(SessionState::Finalize)
                .timed()
                .with_message(e.to_string())
        }
    })
}

/// Name of the Job backing up a target from snapshots
pub fn snapshot_job_name(session: &str, target: &str) -> String {
    format!("{}-{}", session, target)
}

/// Snapshot the sidecar volumes and hand the backup over to a batch Job
async fn start_snapshot_backup(
    ctx: &Context,
    session: &BackupSession,
    target: &Target,
) -> Result<Outcome> {
    let name = session.name_any();
    let namespace = ctx.namespace();
    let job_name = snapshot_job_name(&name, &target.target_name);

    if ctx.cluster.get_job(namespace, &job_name).await?.is_some() {
        debug!(job = %job_name, "Snapshot backup job already running");
        return Ok(Outcome::Unchanged);
    }

    let mut pod_spec = ctx
        .cluster
        .get_pod_spec(namespace, target.target_kind, &target.target_name)
        .await?;
    let sidecar = sidecar_container(&pod_spec, &target.target_name)?;
    let mounts = sidecar.volume_mounts.clone().unwrap_or_default();

    match snapshot_volumes(ctx, &name, &mounts, &mut pod_spec).await? {
        SnapshotReadiness::Pending => {
            metrics::SNAPSHOTS_PENDING
                .with_label_values(&[namespace])
                .inc();
            info!(name = %name, "Waiting for volume snapshots");
            Ok(Outcome::Requeue(WAIT_REQUEUE))
        }
        SnapshotReadiness::Ready => {
            let job = snapshot_backup_job(&name, namespace, &target.target_name, &job_name, &pod_spec, &sidecar);
            match ctx.cluster.create_job(namespace, &job).await {
                Ok(_) => info!(job = %job_name, "Created snapshot backup job"),
                Err(e) if e.is_conflict() => debug!(job = %job_name, "Snapshot backup job already exists"),
                Err(e) => return Err(e),
            }
            Ok(Outcome::Unchanged)
        }
    }
}

pub(crate) fn sidecar_container(pod_spec: &PodSpec, target_name: &str) -> Result<Container> {
    pod_spec
        .containers
        .iter()
        .find(|c| c.name == SIDECAR_CONTAINER_NAME)
        .cloned()
        .ok_or_else(|| {
            Error::validation(format!(
                "{} has no {} container",
                target_name, SIDECAR_CONTAINER_NAME
            ))
        })
}

/// Batch Job running `backupsession backup` over the snapshot claims
fn snapshot_backup_job(
    session: &str,
    namespace: &str,
    target_name: &str,
    job_name: &str,
    pod_spec: &PodSpec,
    sidecar: &Container,
) -> Job {
    let mounts = sidecar.volume_mounts.clone().unwrap_or_default();
    let volumes: Vec<Volume> = pod_spec
        .volumes
        .iter()
        .flatten()
        .filter(|v| mounts.iter().any(|m| m.name == v.name))
        .cloned()
        .collect();

    let mut container = sidecar.clone();
    container.name = SNAPSHOT_JOB_CONTAINER_NAME.to_string();
    container.args = Some(vec![
        "backupsession".to_string(),
        "backup".to_string(),
        "--name".to_string(),
        session.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--target-name".to_string(),
        target_name.to_string(),
    ]);
    container.volume_mounts = Some(
        mounts
            .into_iter()
            .map(|mut m| {
                m.read_only = Some(true);
                m
            })
            .collect(),
    );
    container.liveness_probe = None;
    container.readiness_probe = None;

    let labels = BTreeMap::from([(BACKUP_SESSION_LABEL.to_string(), session.to_string())]);
    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(SNAPSHOT_JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: pod_spec.service_account_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Back up from inside the snapshot Job and record the result
///
/// Runs once per Job. The session moves to `Finalize` whether or not the
/// backup succeeded; the agent in the target pod finishes the session.
pub async fn backup_from_snapshot_job(
    ctx: &Context,
    namespace: &str,
    name: &str,
    target_name: &str,
) -> Result<Outcome> {
    let session = ctx
        .cluster
        .get_backup_session(namespace, name)
        .await?
        .ok_or_else(|| Error::not_found(KIND, name))?;
    let state = session
        .status
        .as_ref()
        .and_then(|s| s.target(target_name))
        .map(|t| t.session_state)
        .ok_or_else(|| Error::not_found("target status", target_name))?;
    if state != SessionState::Running {
        info!(name = %name, state = %state, "Target is not running, nothing to back up");
        return Ok(Outcome::Unchanged);
    }

    let config = backup_configuration(ctx, &session, namespace).await?;
    let target = config.spec.target(target_name).cloned().ok_or_else(|| {
        Error::validation(format!("target {} is not part of the configuration", target_name))
    })?;

    let transition = match ctx.repository_config(&config).await {
        Ok(repo) => {
            let paths = in_place_paths(ctx, &target);
            match ctx.engine.backup_paths(&repo, name, &paths).await {
                Ok(result) => {
                    Transition::to(SessionState::Finalize).with_snapshot(result.snapshot_id)
                }
                Err(e) => {
                    error!(error = %e, "Snapshot backup failed");
                    Transition::to(SessionState::Finalize)
                        .timed()
                        .with_message(e.to_string())
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Unable to open the repository");
            Transition::to(SessionState::Finalize)
                .timed()
                .with_message(e.to_string())
        }
    };

    write_transition_for(ctx, session, target_name, transition).await
}

/// Forget a backup snapshot of a BackupConfiguration and prune its data
pub async fn delete_snapshot(
    ctx: &Context,
    namespace: &str,
    config_name: &str,
    snapshot_id: &str,
) -> Result<()> {
    let config = ctx
        .cluster
        .get_backup_configuration(namespace, config_name)
        .await?;
    let repo = ctx.repository_config(&config).await?;
    ctx.engine.delete_snapshot(&repo, snapshot_id).await?;
    info!(config = %config_name, snapshot_id = %snapshot_id, "Snapshot deleted");
    Ok(())
}

async fn write_transition(
    ctx: &Context,
    session: BackupSession,
    transition: Transition,
) -> Result<Outcome> {
    let target_name = ctx.target_name().to_string();
    write_transition_for(ctx, session, &target_name, transition).await
}

/// Apply a transition to the session status and write it once
async fn write_transition_for(
    ctx: &Context,
    mut session: BackupSession,
    target_name: &str,
    transition: Transition,
) -> Result<Outcome> {
    let status = session.status.get_or_insert_with(Default::default);
    let (from, to) = transition.apply(&mut status.targets, target_name)?;

    if let Err(e) = ctx.cluster.update_backup_session_status(&session).await {
        error!(
            name = %session.name_any(),
            target = %target_name,
            error = %e,
            "Unable to update BackupSession status"
        );
        return Err(e);
    }

    info!(name = %session.name_any(), target = %target_name, from = %from, to = %to, "BackupSession target transitioned");
    metrics::record_transition(KIND, from, to);
    if to.is_terminal() {
        metrics::BACKUPS_TOTAL
            .with_label_values(&[metrics::outcome_label(to), ctx.namespace(), target_name])
            .inc();
    }
    Ok(Outcome::Transitioned(to))
}
