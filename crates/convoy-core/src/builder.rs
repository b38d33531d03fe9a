//! Source and builder collaborator traits.
//!
//! The Source collaborator turns a branch reference into a local snapshot;
//! the Builder turns that snapshot into a container image.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{Error, Result, RunId};

/// Request to fetch a branch from source control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRequest {
    /// Run this fetch belongs to.
    pub run_id: RunId,
    /// Repository clone URL.
    pub repository: String,
    /// Branch to fetch.
    pub branch: String,
    /// Specific commit to check out (defaults to the branch head).
    pub commit: Option<String>,
}

/// A fetched source tree at a specific commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    /// Local checkout path.
    pub path: PathBuf,
}

impl SourceSnapshot {
    /// First seven characters of the commit.
    pub fn short_commit(&self) -> &str {
        let end = self
            .commit
            .char_indices()
            .nth(7)
            .map_or(self.commit.len(), |(i, _)| i);
        &self.commit[..end]
    }
}

/// A container image reference (`repository:tag`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl std::str::FromStr for ImageRef {
    type Err = Error;

    /// Parses `repo:tag`. A colon inside the registry host (`host:5000/app`)
    /// is not taken as the tag separator; a missing tag means `latest`.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidInput("empty image reference".to_string()));
        }
        match s.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() && !tag.is_empty() => {
                Ok(Self::new(repo, tag))
            }
            _ => Ok(Self::new(s, "latest")),
        }
    }
}

/// Request to build an image from a source snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub run_id: RunId,
    /// Source tree to build.
    pub source: SourceSnapshot,
    /// Image of the build environment.
    pub build_image: String,
    /// Commands run inside the build environment, in order.
    pub commands: Vec<String>,
    /// Environment variables for the build.
    pub env: HashMap<String, String>,
    /// Whether the build needs access to a container daemon.
    pub privileged: bool,
    /// Image the build is expected to produce.
    pub output: ImageRef,
}

/// Fetches source snapshots.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceSnapshot>;

    /// Discard a snapshot once its run has finished.
    async fn release(&self, _snapshot: &SourceSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Turns a source snapshot into an image.
#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the build. Failures are reported as [`Error::Build`].
    async fn build(&self, request: BuildRequest) -> Result<ImageRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_parse() {
        let img: ImageRef = "sdlc-automation:latest".parse().unwrap();
        assert_eq!(img, ImageRef::new("sdlc-automation", "latest"));

        let img: ImageRef = "registry.local:5000/app".parse().unwrap();
        assert_eq!(img, ImageRef::new("registry.local:5000/app", "latest"));

        let img: ImageRef = "registry.local:5000/app:v2".parse().unwrap();
        assert_eq!(img.tag, "v2");
        assert_eq!(img.to_string(), "registry.local:5000/app:v2");

        assert!("".parse::<ImageRef>().is_err());
    }

    #[test]
    fn test_short_commit() {
        let snap = SourceSnapshot {
            repository: "repo".into(),
            branch: "main".into(),
            commit: "0123456789abcdef".into(),
            path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(snap.short_commit(), "0123456");
    }

    #[test]
    fn test_short_commit_of_odd_values() {
        let mut snap = SourceSnapshot {
            repository: "repo".into(),
            branch: "main".into(),
            commit: "abc".into(),
            path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(snap.short_commit(), "abc");

        snap.commit = "ab\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}".into();
        assert_eq!(snap.short_commit(), "ab\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}");

        snap.commit = String::new();
        assert_eq!(snap.short_commit(), "");
    }
}
