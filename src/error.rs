//! Error types for the backup session agent

use thiserror::Error;

/// Result type alias using the agent's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Agent error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced object does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Secret key not found
    #[error("Key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// A command exited unsuccessfully
    #[error("Command '{command}' failed: {status}")]
    Command { command: String, status: String },

    /// Backup engine error
    #[error("Backup engine error: {0}")]
    BackupEngine(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a backup engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Error::BackupEngine(msg.into())
    }

    /// Create a not-found error for the given object kind
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Referenced object (or one of its keys) is missing.
    ///
    /// These abort the reconciliation without a state transition and rely on
    /// redelivery once the dependency exists.
    pub fn is_lookup_failure(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::SecretKeyNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Optimistic concurrency rejection from the object store
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}
