//! Kubernetes controllers for the session CRDs
//!
//! Each controller watches one session kind in the agent's namespace and
//! hands every delivered object to its reconciler.

mod backup_session_controller;
mod restore_session_controller;

pub use backup_session_controller::run as run_backup_session_controller;
pub use restore_session_controller::run as run_restore_session_controller;

use std::time::Duration;

use crate::error::Error;

/// Retry delay after a failed reconciliation
pub(crate) fn requeue_after(error: &Error) -> Duration {
    if error.is_conflict() {
        Duration::from_secs(5)
    } else if error.is_lookup_failure() {
        Duration::from_secs(30)
    } else {
        match error {
            Error::Config(_) | Error::Validation(_) => Duration::from_secs(300),
            _ => Duration::from_secs(30),
        }
    }
}
