//! RestoreSession controller
//!
//! Watches RestoreSession resources and triggers reconciliation.

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
use crate::crd::RestoreSession;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::restore as restore_reconciler;
use crate::session::Context;

/// Run the RestoreSession controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<RestoreSession> = Api::namespaced(client, context.namespace());

    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("RestoreSession CRD not installed: {}", e);
        return;
    }

    info!(namespace = %context.namespace(), "Starting RestoreSession controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(name = %obj.name, "Reconciled RestoreSession");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["RestoreSession"])
                        .inc();
                }
            }
        })
        .await;
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<RestoreSession>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["RestoreSession"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["RestoreSession"])
        .inc();

    let outcome = restore_reconciler::reconcile(&ctx, &obj).await?;
    Ok(outcome.into_action())
}

fn error_policy(obj: Arc<RestoreSession>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );
    Action::requeue(requeue_after(error))
}
