//! Git source: shallow-clones a branch into a per-run checkout.

use async_trait::async_trait;
use convoy_core::builder::{SourceProvider, SourceRequest, SourceSnapshot};
use convoy_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Fetches sources with the `git` command line.
pub struct GitSource {
    work_dir: PathBuf,
}

impl Default for GitSource {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("convoy-src"))
    }
}

impl GitSource {
    /// Checkouts are created under `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn checkout_path(&self, request: &SourceRequest) -> PathBuf {
        let repo_hash = format!("{:x}", md5::compute(&request.repository));
        self.work_dir
            .join(format!("{}-{}", &repo_hash[..12], request.run_id.short()))
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut command = Command::new("git");
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        debug!(args = ?args, "Running git");
        let output = command
            .output()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExecutionFailed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceSnapshot> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| Error::Internal(format!("creating work dir failed: {}", e)))?;

        let path = self.checkout_path(request);
        if path.exists() {
            warn!(path = %path.display(), "Removing stale checkout");
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| Error::Internal(format!("removing stale checkout failed: {}", e)))?;
        }

        let target = path.to_string_lossy();
        info!(
            repository = %request.repository,
            branch = %request.branch,
            path = %target,
            "Cloning source"
        );
        self.git(
            None,
            &[
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                &request.branch,
                &request.repository,
                &target,
            ],
        )
        .await?;

        if let Some(commit) = &request.commit {
            let head = self.git(Some(&path), &["rev-parse", "HEAD"]).await?;
            if &head != commit {
                self.git(Some(&path), &["fetch", "--depth", "1", "origin", commit])
                    .await?;
                self.git(Some(&path), &["checkout", "--detach", commit])
                    .await?;
            }
        }

        let commit = self.git(Some(&path), &["rev-parse", "HEAD"]).await?;
        info!(commit = %commit, path = %target, "Source fetched");

        Ok(SourceSnapshot {
            repository: request.repository.clone(),
            branch: request.branch.clone(),
            commit,
            path,
        })
    }

    async fn release(&self, snapshot: &SourceSnapshot) -> Result<()> {
        if !snapshot.path.starts_with(&self.work_dir) {
            return Err(Error::InvalidInput(format!(
                "{} is not a checkout of this source",
                snapshot.path.display()
            )));
        }
        match tokio::fs::remove_dir_all(&snapshot.path).await {
            Ok(()) => {
                debug!(path = %snapshot.path.display(), "Removed checkout");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(format!("removing checkout failed: {}", e))),
        }
    }
}
