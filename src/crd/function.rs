//! Function Custom Resource Definition

use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named, parameterised command run inside a target container
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agent.backup.io",
    version = "v1alpha1",
    kind = "Function",
    plural = "functions",
    singular = "function",
    shortname = "fn",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Executable and leading arguments
    pub command: Vec<String>,

    /// Arguments, `$(VAR)` references are expanded from the resolved env
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Whole ConfigMaps / Secrets imported as environment variables
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,
}
