//! Restic backup engine adapter

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::exec::stream_command;
use crate::error::{Error, Result};

/// Repository location and the credentials needed to open it
#[derive(Clone, Default, PartialEq)]
pub struct RepositoryConfig {
    pub url: String,
    /// Variables set on every engine invocation (credentials, password)
    pub env: BTreeMap<String, String>,
}

impl std::fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("url", &self.url)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outcome of a backup run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupResult {
    pub snapshot_id: Option<String>,
    pub duration: Duration,
}

/// Operations the agent needs from a backup engine
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Make sure the repository exists and is usable
    async fn check_repo(&self, repo: &RepositoryConfig) -> Result<()>;

    /// Back up `paths` into a snapshot tagged with `tag`
    async fn backup_paths(
        &self,
        repo: &RepositoryConfig,
        tag: &str,
        paths: &[String],
    ) -> Result<BackupResult>;

    /// Restore a snapshot over the filesystem root
    async fn restore_snapshot(&self, repo: &RepositoryConfig, snapshot_id: &str) -> Result<()>;

    /// Forget a snapshot and prune its data
    async fn delete_snapshot(&self, repo: &RepositoryConfig, snapshot_id: &str) -> Result<()>;
}

/// Runs the restic binary
#[derive(Debug, Clone)]
pub struct Restic {
    exec: PathBuf,
}

impl Restic {
    pub fn new(exec: impl Into<PathBuf>) -> Self {
        Self { exec: exec.into() }
    }

    fn command(&self, repo: &RepositoryConfig, args: &[&str]) -> (Command, String) {
        let mut cmd = Command::new(&self.exec);
        cmd.args(args).arg("-r").arg(&repo.url).envs(&repo.env);
        let cmdline = format!("restic {}", args.first().copied().unwrap_or_default());
        (cmd, cmdline)
    }

    async fn run(&self, repo: &RepositoryConfig, args: &[&str]) -> Result<()> {
        let (cmd, cmdline) = self.command(repo, args);
        stream_command(cmd, &cmdline, |line| info!("{}", line)).await
    }
}

#[async_trait]
impl BackupEngine for Restic {
    async fn check_repo(&self, repo: &RepositoryConfig) -> Result<()> {
        if let Err(e) = self.run(repo, &["unlock"]).await {
            warn!(repository = %repo.url, error = %e, "Unable to unlock repository");
        }

        // A failed check is taken to mean the repository does not exist yet.
        // It may also be corrupt, in which case init fails on the existing config.
        if let Err(e) = self.run(repo, &["check"]).await {
            info!(repository = %repo.url, error = %e, "Repository check failed, initializing");
            self.run(repo, &["init"]).await.map_err(|e| {
                Error::engine(format!("unable to initialize repository {}: {}", repo.url, e))
            })?;
        }
        Ok(())
    }

    async fn backup_paths(
        &self,
        repo: &RepositoryConfig,
        tag: &str,
        paths: &[String],
    ) -> Result<BackupResult> {
        if paths.is_empty() {
            return Err(Error::validation("no paths to back up"));
        }
        self.check_repo(repo).await?;

        info!(tag = %tag, paths = ?paths, "Starting backup");
        let mut args = vec!["backup", "--json", "--tag", tag];
        args.extend(paths.iter().map(String::as_str));
        let (cmd, cmdline) = self.command(repo, &args);

        let mut parser = BackupOutputParser::default();
        let status = stream_command(cmd, &cmdline, |line| parser.feed(line)).await;
        let result = parser.finish();
        match status {
            Ok(()) => Ok(result),
            // restic exits 3 when the snapshot was written but some files were unreadable
            Err(e) if result.snapshot_id.is_some() => {
                warn!(
                    snapshot_id = ?result.snapshot_id,
                    error = %e,
                    "Backup finished with errors, keeping the reported snapshot"
                );
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    async fn restore_snapshot(&self, repo: &RepositoryConfig, snapshot_id: &str) -> Result<()> {
        self.check_repo(repo).await?;
        info!(snapshot_id = %snapshot_id, "Restoring snapshot");
        self.run(repo, &["restore", snapshot_id, "--target", "/"]).await
    }

    async fn delete_snapshot(&self, repo: &RepositoryConfig, snapshot_id: &str) -> Result<()> {
        self.check_repo(repo).await?;
        info!(snapshot_id = %snapshot_id, "Deleting snapshot");
        self.run(repo, &["forget", "--prune", snapshot_id]).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum BackupMessage {
    Status {
        #[serde(default)]
        percent_done: f64,
    },
    Summary {
        #[serde(default)]
        snapshot_id: Option<String>,
        #[serde(default)]
        total_duration: f64,
    },
    #[serde(other)]
    Other,
}

/// Accumulates `restic backup --json` output
#[derive(Debug, Default)]
pub struct BackupOutputParser {
    result: Option<BackupResult>,
}

impl BackupOutputParser {
    pub fn feed(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<BackupMessage>(line) {
            Ok(BackupMessage::Status { percent_done }) => {
                info!(percent_done = percent_done * 100.0, "Backup in progress");
            }
            Ok(BackupMessage::Summary {
                snapshot_id,
                total_duration,
            }) => {
                info!(snapshot_id = ?snapshot_id, total_duration, "Backup summary");
                self.result = Some(BackupResult {
                    snapshot_id,
                    duration: Duration::try_from_secs_f64(total_duration).unwrap_or_default(),
                });
            }
            Ok(BackupMessage::Other) => debug!("{}", line),
            Err(_) => info!("{}", line),
        }
    }

    /// Result of the last summary seen, empty when none was reported
    pub fn finish(self) -> BackupResult {
        self.result.unwrap_or_default()
    }
}
