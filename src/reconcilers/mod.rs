//! Session state machines
//!
//! Each reconciler drives the status entry of the agent's own target through
//! `New → Initializing → Initialized → Running → Waiting → Finalize →
//! Success | Failure`. A reconciliation makes at most one transition and
//! writes it with a single status update.

pub mod backup;
pub mod restore;
pub mod volume_snapshot;

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;

use crate::crd::{SessionState, TargetStatus};
use crate::error::{Error, Result};

/// Delay before retrying a session waiting on something outside the agent
pub const WAIT_REQUEUE: Duration = Duration::from_secs(10);

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The target moved to a new state
    Transitioned(SessionState),
    /// Nothing to do for this delivery
    Unchanged,
    /// Try again later without a state change
    Requeue(Duration),
}

impl Outcome {
    pub fn into_action(self) -> Action {
        match self {
            Outcome::Transitioned(_) | Outcome::Unchanged => Action::await_change(),
            Outcome::Requeue(after) => Action::requeue(after),
        }
    }
}

/// Change of a target's status entry
#[derive(Debug, Clone, Default)]
pub(crate) struct Transition {
    pub to: Option<SessionState>,
    pub snapshot_id: Option<String>,
    pub message: Option<String>,
    pub start: bool,
    pub record_duration: bool,
}

impl Transition {
    pub fn to(state: SessionState) -> Self {
        Self {
            to: Some(state),
            ..Default::default()
        }
    }

    pub fn starting(mut self) -> Self {
        self.start = true;
        self
    }

    pub fn with_snapshot(mut self, snapshot_id: Option<String>) -> Self {
        self.snapshot_id = snapshot_id;
        self.record_duration = true;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn timed(mut self) -> Self {
        self.record_duration = true;
        self
    }

    /// Apply to the named entry, returning the previous and new state
    pub fn apply(
        self,
        targets: &mut [TargetStatus],
        target_name: &str,
    ) -> Result<(SessionState, SessionState)> {
        let entry = targets
            .iter_mut()
            .find(|t| t.target_name == target_name)
            .ok_or_else(|| Error::not_found("target status", target_name))?;

        let from = entry.session_state;
        let to = self.to.unwrap_or(from);
        if !from.can_transition_to(to) {
            return Err(Error::validation(format!(
                "illegal transition {} -> {} for target {}",
                from, to, target_name
            )));
        }

        let now = Utc::now();
        if self.start && entry.start_time.is_none() {
            entry.start_time = Some(now);
        }
        if self.snapshot_id.is_some() {
            entry.snapshot_id = self.snapshot_id;
        }
        if self.message.is_some() {
            entry.message = self.message;
        }
        if self.record_duration {
            entry.record_duration(now);
        }
        entry.session_state = to;
        Ok((from, to))
    }
}
