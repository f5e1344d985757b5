//! Running commands inside a sibling container's filesystem
//!
//! The agent shares the pod's process namespace with the target containers.
//! Each target container carries an environment tag naming it, so the root of
//! a container is found by scanning `/proc/<pid>/environ` for that tag and
//! using `/proc/<pid>/root` as the chroot directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::exec::stream_command;
use crate::crd::TARGET_CONTAINER_TAG;
use crate::error::{Error, Result};

/// Finds the filesystem root of a target container
pub trait RootLocator: Send + Sync {
    fn locate(&self, container: &str) -> Result<PathBuf>;
}

/// Executes a command inside a target container
#[async_trait]
pub trait TargetRunner: Send + Sync {
    /// Run `command` followed by `args` with the given environment
    async fn run(
        &self,
        container: &str,
        command: &[String],
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Locates container roots through a procfs mount
#[derive(Debug, Clone)]
pub struct ProcRootLocator {
    proc_root: PathBuf,
    tag: String,
}

impl ProcRootLocator {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            tag: TARGET_CONTAINER_TAG.to_string(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
}

impl RootLocator for ProcRootLocator {
    fn locate(&self, container: &str) -> Result<PathBuf> {
        let own_pid = std::process::id();
        let needle = format!("{}={}", self.tag, container);

        let mut pids: Vec<u32> = fs::read_dir(&self.proc_root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| *pid != 1 && *pid != own_pid)
            .collect();
        pids.sort_unstable();

        for pid in pids {
            let dir = self.proc_root.join(pid.to_string());
            let environ = match fs::read(dir.join("environ")) {
                Ok(environ) => environ,
                Err(e) => {
                    debug!(pid, error = %e, "Skipping unreadable process environment");
                    continue;
                }
            };

            if environ
                .split(|b| *b == 0)
                .any(|entry| entry == needle.as_bytes())
            {
                let root = dir.join("root");
                fs::metadata(&root)?;
                debug!(pid, container = %container, root = %root.display(), "Located container root");
                return Ok(root);
            }
        }

        Err(Error::not_found("container process", container))
    }
}

/// Runs commands through `chroot` into a located container root
pub struct ChrootRunner<L> {
    locator: L,
    chroot: PathBuf,
}

impl<L: RootLocator> ChrootRunner<L> {
    pub fn new(locator: L) -> Self {
        Self {
            locator,
            chroot: PathBuf::from("chroot"),
        }
    }

    /// Use a different chroot executable
    pub fn with_chroot(mut self, chroot: impl Into<PathBuf>) -> Self {
        self.chroot = chroot.into();
        self
    }
}

#[async_trait]
impl<L: RootLocator> TargetRunner for ChrootRunner<L> {
    async fn run(
        &self,
        container: &str,
        command: &[String],
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        if command.is_empty() {
            return Err(Error::validation(format!(
                "empty command for container {}",
                container
            )));
        }

        let root = self.locator.locate(container)?;
        let cmdline = command.join(" ");
        info!(container = %container, command = %cmdline, "Running command in container");

        let mut cmd = Command::new(&self.chroot);
        cmd.arg(&root).args(command).args(args).envs(env);

        stream_command(cmd, &cmdline, |line| {
            info!(container = %container, "{}", line);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn fake_process(proc_root: &Path, pid: &str, environ: &[&str]) {
        let dir = proc_root.join(pid);
        fs::create_dir_all(dir.join("root")).unwrap();
        let mut bytes = Vec::new();
        for var in environ {
            bytes.extend_from_slice(var.as_bytes());
            bytes.push(0);
        }
        fs::write(dir.join("environ"), bytes).unwrap();
    }

    #[test]
    fn finds_the_tagged_process() {
        let proc_root = TempDir::new().unwrap();
        fake_process(proc_root.path(), "7", &["PATH=/bin", "BACKUP_AGENT_TARGET_CONTAINER=db"]);
        fake_process(proc_root.path(), "42", &["BACKUP_AGENT_TARGET_CONTAINER=web", "HOME=/"]);

        let locator = ProcRootLocator::new(proc_root.path());
        assert_eq!(
            locator.locate("web").unwrap(),
            proc_root.path().join("42").join("root")
        );
    }

    #[test]
    fn skips_init_and_non_numeric_entries() {
        let proc_root = TempDir::new().unwrap();
        fake_process(proc_root.path(), "1", &["BACKUP_AGENT_TARGET_CONTAINER=web"]);
        fake_process(proc_root.path(), "self", &["BACKUP_AGENT_TARGET_CONTAINER=web"]);

        let err = ProcRootLocator::new(proc_root.path()).locate("web").unwrap_err();
        assert!(err.is_lookup_failure());
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let proc_root = TempDir::new().unwrap();
        fs::create_dir_all(proc_root.path().join("5")).unwrap();
        fake_process(proc_root.path(), "9", &["BACKUP_AGENT_TARGET_CONTAINER=web"]);

        let root = ProcRootLocator::new(proc_root.path()).locate("web").unwrap();
        assert_eq!(root, proc_root.path().join("9").join("root"));
    }

    #[test]
    fn tag_must_match_the_whole_entry() {
        let proc_root = TempDir::new().unwrap();
        fake_process(proc_root.path(), "12", &["BACKUP_AGENT_TARGET_CONTAINER=web-2"]);

        assert!(ProcRootLocator::new(proc_root.path()).locate("web").is_err());
    }

    #[test]
    fn custom_tag() {
        let proc_root = TempDir::new().unwrap();
        fake_process(proc_root.path(), "12", &["APP=web"]);

        let locator = ProcRootLocator::new(proc_root.path()).with_tag("APP");
        assert!(locator.locate("web").is_ok());
    }

    struct FixedRoot(PathBuf);

    impl RootLocator for FixedRoot {
        fn locate(&self, _container: &str) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let runner = ChrootRunner::new(FixedRoot(PathBuf::from("/")));
        let err = runner
            .run("web", &[], &[], &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
