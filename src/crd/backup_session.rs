//! BackupSession Custom Resource Definition

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupSession resource specification
///
/// One BackupSession is created per backup invocation. Its status carries one
/// [`TargetStatus`] per target of the referenced BackupConfiguration.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "agent.backup.io",
    version = "v1alpha1",
    kind = "BackupSession",
    plural = "backupsessions",
    singular = "backupsession",
    shortname = "bs",
    namespaced,
    status = "BackupSessionStatus",
    printcolumn = r#"{"name": "Configuration", "type": "string", "jsonPath": ".spec.configRef.name"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionSpec {
    /// BackupConfiguration this session executes
    pub config_ref: ConfigRef,
}

/// Reference to a BackupConfiguration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRef {
    /// BackupConfiguration name
    pub name: String,

    /// Namespace (defaults to the session namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// BackupSession status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionStatus {
    /// Per-target progress, keyed by target name
    #[serde(default)]
    pub targets: Vec<TargetStatus>,
}

impl BackupSessionStatus {
    /// Find the status entry of a target by name
    pub fn target(&self, target_name: &str) -> Option<&TargetStatus> {
        self.targets.iter().find(|t| t.target_name == target_name)
    }

    /// Find the status entry of a target by name, mutably
    pub fn target_mut(&mut self, target_name: &str) -> Option<&mut TargetStatus> {
        self.targets
            .iter_mut()
            .find(|t| t.target_name == target_name)
    }
}

/// Progress of one target within a session
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Target name (matches `Target::target_name`)
    pub target_name: String,

    /// Current state of the target
    #[serde(default)]
    pub session_state: SessionState,

    /// Backup engine snapshot identifier, set once the backup succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    /// When the target started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Elapsed seconds since `start_time` when the work completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,

    /// Last error recorded for this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TargetStatus {
    /// New status entry for a target
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            ..Default::default()
        }
    }

    /// Record the elapsed time since `start_time`
    pub fn record_duration(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.start_time {
            let elapsed = now - start;
            self.duration_seconds = Some(elapsed.num_milliseconds() as f64 / 1000.0);
        }
    }
}

/// State of a target within a BackupSession or RestoreSession
///
/// Transitions only move forward; `Success` and `Failure` are absorbing.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    New,
    Initializing,
    Initialized,
    Running,
    Waiting,
    Finalize,
    Success,
    Failure,
}

impl SessionState {
    /// All states in lifecycle order
    pub const ALL: [SessionState; 8] = [
        SessionState::New,
        SessionState::Initializing,
        SessionState::Initialized,
        SessionState::Running,
        SessionState::Waiting,
        SessionState::Finalize,
        SessionState::Success,
        SessionState::Failure,
    ];

    /// Position in the lifecycle; both terminal states share the last rank
    pub fn rank(self) -> u8 {
        match self {
            SessionState::New => 0,
            SessionState::Initializing => 1,
            SessionState::Initialized => 2,
            SessionState::Running => 3,
            SessionState::Waiting => 4,
            SessionState::Finalize => 5,
            SessionState::Success | SessionState::Failure => 6,
        }
    }

    /// Whether the state is absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Success | SessionState::Failure)
    }

    /// Whether moving from `self` to `next` respects forward-only ordering
    pub fn can_transition_to(self, next: SessionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::New => "New",
            SessionState::Initializing => "Initializing",
            SessionState::Initialized => "Initialized",
            SessionState::Running => "Running",
            SessionState::Waiting => "Waiting",
            SessionState::Finalize => "Finalize",
            SessionState::Success => "Success",
            SessionState::Failure => "Failure",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
