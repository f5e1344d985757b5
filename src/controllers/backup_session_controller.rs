//! BackupSession controller
//!
//! Watches BackupSession resources and triggers reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument};

use super::requeue_after;
use crate::crd::BackupSession;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::backup as backup_reconciler;
use crate::session::Context;

/// Run the BackupSession controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<BackupSession> = Api::namespaced(client, context.namespace());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("BackupSession CRD not installed: {}", e);
        return;
    }

    info!(
        namespace = %context.namespace(),
        target = %context.target_name(),
        "Starting BackupSession controller"
    );

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled BackupSession"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["BackupSession"])
                        .inc();
                }
            }
        })
        .await;
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<BackupSession>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["BackupSession"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["BackupSession"])
        .inc();

    let outcome = backup_reconciler::reconcile(&ctx, &obj).await?;
    Ok(outcome.into_action())
}

fn error_policy(obj: Arc<BackupSession>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );
    Action::requeue(requeue_after(error))
}
