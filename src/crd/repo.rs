//! Repo Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backup repository location and credentials
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agent.backup.io",
    version = "v1alpha1",
    kind = "Repo",
    plural = "repos",
    singular = "repo",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    /// Storage backend
    pub backend: Backend,

    /// Secret holding the backend credentials and the repository password
    pub repository_secrets: String,
}

/// Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// S3 compatible object storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Backend>,
}

/// S3 compatible backend
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Backend {
    /// Host and port of the S3 endpoint
    pub server: String,

    /// Bucket name
    pub bucket: String,
}
