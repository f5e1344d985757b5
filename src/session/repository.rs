//! Backup repository credentials

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use super::env::secret_string;
use super::Context;
use crate::adapters::RepositoryConfig;
use crate::crd::{BackupConfiguration, Repo};
use crate::error::{Error, Result};

const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";

/// Build the repository location of a BackupConfiguration
///
/// Each configuration gets its own repository under the bucket, named
/// `<NAMESPACE>-<name>`.
pub fn build_repository_config(
    repo: &Repo,
    secret: &Secret,
    config_namespace: &str,
    config_name: &str,
) -> Result<RepositoryConfig> {
    let s3 = repo.spec.backend.s3.as_ref().ok_or_else(|| {
        Error::config(format!("Repo {} has no supported backend", repo.name_any()))
    })?;

    let url = format!(
        "s3:http://{}/{}/{}-{}",
        s3.server,
        s3.bucket,
        config_namespace.to_uppercase(),
        config_name.to_lowercase()
    );

    let mut env = BTreeMap::new();
    for key in [AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, RESTIC_PASSWORD] {
        env.insert(key.to_string(), secret_string(secret, key)?);
    }

    Ok(RepositoryConfig { url, env })
}

impl Context {
    /// Load the Repo of a BackupConfiguration and its credentials
    pub async fn repository_config(&self, config: &BackupConfiguration) -> Result<RepositoryConfig> {
        let namespace = config.namespace().unwrap_or_else(|| self.namespace().to_string());
        let repo = self
            .cluster
            .get_repo(&namespace, &config.spec.repository)
            .await?;
        let secret = self
            .cluster
            .get_secret(&namespace, &repo.spec.repository_secrets)
            .await?;
        build_repository_config(&repo, &secret, &namespace, &config.name_any())
    }
}
