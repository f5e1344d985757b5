//! RestoreSession reconciler
//!
//! Mirrors the backup state machine. Job targets are restored directly by
//! the agent. Online and Sidecar targets have their data mounted read-only,
//! so the restore is delegated to an init-container added to the workload;
//! the init-container reports back through [`restore_from_init_container`].

use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use super::backup::sidecar_container;
use super::{Outcome, Transition, WAIT_REQUEUE};
use crate::crd::{
    BackupConfiguration, BackupType, RestoreSession, SessionState, Target,
    RESTORE_CONTAINER_NAME,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{Context, StepPhase};

const KIND: &str = "RestoreSession";

/// Reconcile a delivered RestoreSession for the agent's target
pub async fn reconcile(ctx: &Context, delivered: &RestoreSession) -> Result<Outcome> {
    let name = delivered.name_any();
    let namespace = delivered
        .namespace()
        .unwrap_or_else(|| ctx.namespace().to_string());

    let Some(session) = ctx.cluster.get_restore_session(&namespace, &name).await? else {
        debug!(name = %name, "RestoreSession no longer exists");
        return Ok(Outcome::Unchanged);
    };
    if session.resource_version() != delivered.resource_version() {
        debug!(name = %name, "Stale delivery, a newer version exists");
        return Ok(Outcome::Unchanged);
    }

    let status = session.status.clone().unwrap_or_default();
    if status.targets.is_empty() {
        debug!(name = %name, "RestoreSession has no targets yet");
        return Ok(Outcome::Requeue(WAIT_REQUEUE));
    }
    let Some(target_status) = status.target(ctx.target_name()) else {
        debug!(name = %name, target = %ctx.target_name(), "No status entry for this target");
        return Ok(Outcome::Unchanged);
    };
    let state = target_status.session_state;
    if state.is_terminal() {
        return Ok(Outcome::Unchanged);
    }

    let config = backup_configuration(ctx, &session, &namespace).await?;
    let target = find_target(&config, ctx.target_name())?;

    info!(name = %name, target = %target.target_name, state = %state, "Reconciling RestoreSession");

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
        SessionState::Running => match target.backup_type {
            BackupType::Job => restore_snapshot(ctx, &session, &config, &target).await?,
            BackupType::Online | BackupType::Sidecar => {
                match add_restore_init_container(ctx, &session, &target).await {
                    Ok(()) => return Ok(Outcome::Unchanged),
                    Err(e) if e.is_lookup_failure() || matches!(e, Error::Kube(_)) => {
                        return Err(e)
                    }
                    Err(e) => {
                        error!(target = %target.target_name, error = %e, "Unable to add the restore init-container");
                        Transition::to(SessionState::Failure).with_message(e.to_string())
                    }
                }
            }
        },
        SessionState::Waiting => Transition::to(SessionState::Finalize),
        SessionState::Finalize => match ctx.run_steps(&target, StepPhase::Finalize).await {
            Ok(()) => Transition::to(SessionState::Success).timed(),
            Err(e) if e.is_lookup_failure() => return Err(e),
            Err(e) => {
                error!(target = %target.target_name, error = %e, "Finalize steps failed");
                Transition::to(SessionState::Failure)
                    .timed()
                    .with_message(e.to_string())
            }
        },
        SessionState::Success | SessionState::Failure => return Ok(Outcome::Unchanged),
    };

    write_transition(ctx, session, &target.target_name, transition).await
}

async fn backup_configuration(
    ctx: &Context,
    session: &RestoreSession,
    namespace: &str,
) -> Result<BackupConfiguration> {
    let backup_ref = &session.spec.backup_session_ref;
    let config_ref = &backup_ref.spec.config_ref;
    let config_namespace = config_ref
        .namespace
        .as_deref()
        .or(Some(backup_ref.namespace.as_str()).filter(|ns| !ns.is_empty()))
        .unwrap_or(namespace);
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

fn find_target(config: &BackupConfiguration, target_name: &str) -> Result<Target> {
    config.spec.target(target_name).cloned().ok_or_else(|| {
        Error::validation(format!(
            "target {} is not part of BackupConfiguration {}",
            target_name,
            config.name_any()
        ))
    })
}

/// Snapshot recorded for a target by the originating backup
fn backup_snapshot_id(session: &RestoreSession, target_name: &str) -> Result<String> {
    session
        .spec
        .backup_session_ref
        .status
        .target(target_name)
        .and_then(|t| t.snapshot_id.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            Error::validation(format!(
                "BackupSession {} has no snapshot for target {}",
                session.spec.backup_session_ref.name, target_name
            ))
        })
}

/// Restore the target's snapshot in place, moving to Waiting or Failure
async fn restore_snapshot(
    ctx: &Context,
    session: &RestoreSession,
    config: &BackupConfiguration,
    target: &Target,
) -> Result<Transition> {
    let snapshot_id = match backup_snapshot_id(session, &target.target_name) {
        Ok(id) => id,
        Err(e) => {
            error!(target = %target.target_name, error = %e, "Nothing to restore");
            return Ok(Transition::to(SessionState::Failure).with_message(e.to_string()));
        }
    };
    let repo = ctx.repository_config(config).await?;

    Ok(match ctx.engine.restore_snapshot(&repo, &snapshot_id).await {
        Ok(()) => {
            info!(target = %target.target_name, snapshot_id = %snapshot_id, "Snapshot restored");
            Transition::to(SessionState::Waiting)
        }
        Err(e) => {
            error!(target = %target.target_name, snapshot_id = %snapshot_id, error = %e, "Restore failed");
            Transition::to(SessionState::Failure).with_message(e.to_string())
        }
    })
}

/// Init-container restoring the snapshot before the target starts
///
/// A copy of the sidecar keeps its volume mounts, made writable.
fn restore_init_container(
    sidecar: &Container,
    session: &str,
    namespace: &str,
    target_name: &str,
) -> Container {
    let mut container = sidecar.clone();
    container.name = RESTORE_CONTAINER_NAME.to_string();
    if let Some(mounts) = container.volume_mounts.as_mut() {
        for mount in mounts.iter_mut() {
            mount.read_only = Some(false);
        }
    }
    container.args = Some(vec![
        "restoresession".to_string(),
        "start".to_string(),
        "--name".to_string(),
        session.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--target-name".to_string(),
        target_name.to_string(),
    ]);
    container.liveness_probe = None;
    container.readiness_probe = None;
    container.startup_probe = None;
    container
}

fn has_restore_container(pod_spec: &PodSpec) -> bool {
    pod_spec
        .init_containers
        .iter()
        .flatten()
        .any(|c| c.name == RESTORE_CONTAINER_NAME)
}

/// Add the restore init-container to the workload, rolling its pods
async fn add_restore_init_container(
    ctx: &Context,
    session: &RestoreSession,
    target: &Target,
) -> Result<()> {
    let namespace = ctx.namespace();
    let mut pod_spec = ctx
        .cluster
        .get_pod_spec(namespace, target.target_kind, &target.target_name)
        .await?;
    if has_restore_container(&pod_spec) {
        debug!(target = %target.target_name, "Restore init-container already present");
        return Ok(());
    }

    let sidecar = sidecar_container(&pod_spec, &target.target_name)?;
    let init = restore_init_container(
        &sidecar,
        &session.name_any(),
        &session.namespace().unwrap_or_else(|| namespace.to_string()),
        &target.target_name,
    );
    pod_spec.init_containers.get_or_insert_with(Vec::new).push(init);

    ctx.cluster
        .update_pod_spec(namespace, target.target_kind, &target.target_name, pod_spec)
        .await?;
    info!(target = %target.target_name, kind = target.target_kind.as_str(), "Added restore init-container");
    Ok(())
}

/// Remove the restore init-container from the workload
async fn remove_restore_init_container(ctx: &Context, target: &Target) -> Result<()> {
    let namespace = ctx.namespace();
    let mut pod_spec = ctx
        .cluster
        .get_pod_spec(namespace, target.target_kind, &target.target_name)
        .await?;
    if !has_restore_container(&pod_spec) {
        return Ok(());
    }
    if let Some(init_containers) = pod_spec.init_containers.as_mut() {
        init_containers.retain(|c| c.name != RESTORE_CONTAINER_NAME);
    }
    ctx.cluster
        .update_pod_spec(namespace, target.target_kind, &target.target_name, pod_spec)
        .await?;
    info!(target = %target.target_name, "Removed restore init-container");
    Ok(())
}

/// Restore from inside the init-container and report back
///
/// The restore only runs while the target is `Running`. The init-container
/// is removed from the workload in every case so the pods can start normally.
pub async fn restore_from_init_container(
    ctx: &Context,
    namespace: &str,
    name: &str,
    target_name: &str,
) -> Result<Outcome> {
    let session = ctx
        .cluster
        .get_restore_session(namespace, name)
        .await?
        .ok_or_else(|| Error::not_found(KIND, name))?;
    let config = backup_configuration(ctx, &session, namespace).await?;
    let target = find_target(&config, target_name)?;

    let state = session
        .status
        .as_ref()
        .and_then(|s| s.target(target_name))
        .map(|t| t.session_state);

    let outcome = if state == Some(SessionState::Running) {
        let transition = restore_snapshot(ctx, &session, &config, &target).await;
        match transition {
            Ok(transition) => write_transition(ctx, session, target_name, transition).await,
            Err(e) => Err(e),
        }
    } else {
        info!(name = %name, state = ?state, "Target is not running, skipping restore");
        Ok(Outcome::Unchanged)
    };

    if let Err(e) = remove_restore_init_container(ctx, &target).await {
        warn!(target = %target_name, error = %e, "Unable to remove the restore init-container");
        if outcome.is_ok() {
            return Err(e);
        }
    }
    outcome
}

/// Apply a transition to the session status and write it once
async fn write_transition(
    ctx: &Context,
    mut session: RestoreSession,
    target_name: &str,
    transition: Transition,
) -> Result<Outcome> {
    let status = session.status.get_or_insert_with(Default::default);
    let (from, to) = transition.apply(&mut status.targets, target_name)?;

    if let Err(e) = ctx.cluster.update_restore_session_status(&session).await {
        error!(
            name = %session.name_any(),
            target = %target_name,
            error = %e,
            "Unable to update RestoreSession status"
        );
        return Err(e);
    }

    info!(name = %session.name_any(), target = %target_name, from = %from, to = %to, "RestoreSession target transitioned");
    metrics::record_transition(KIND, from, to);
    if to.is_terminal() {
        metrics::RESTORES_TOTAL
            .with_label_values(&[metrics::outcome_label(to), ctx.namespace(), target_name])
            .inc();
    }
    Ok(Outcome::Transitioned(to))
}
