//! Source repository push events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A push to a source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub after: String,
    pub repository: String,
    pub branch: Option<String>,
    pub head_commit: Option<CommitInfo>,
    pub pusher: String,
}

/// Commit information from a push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PushEvent {
    /// A push of `sha` to `branch`, as produced by a local trigger.
    pub fn for_branch(
        repository: impl Into<String>,
        branch: impl Into<String>,
        sha: impl Into<String>,
    ) -> Self {
        let branch = branch.into();
        Self {
            r#ref: format!("refs/heads/{}", branch),
            after: sha.into(),
            repository: repository.into(),
            branch: Some(branch),
            head_commit: None,
            pusher: "local".to_string(),
        }
    }

    /// Parse a GitHub-style push webhook payload.
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository = payload
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string();

        let branch = r#ref.strip_prefix("refs/heads/").map(String::from);

        let head_commit = payload
            .get("head_commit")
            .and_then(CommitInfo::from_github_commit);

        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            r#ref,
            after,
            repository,
            branch,
            head_commit,
            pusher,
        })
    }

    /// Whether the push deleted the ref (all-zero `after`).
    pub fn is_deletion(&self) -> bool {
        !self.after.is_empty() && self.after.chars().all(|c| c == '0')
    }
}

impl CommitInfo {
    fn from_github_commit(value: &serde_json::Value) -> Option<Self> {
        Some(CommitInfo {
            sha: value.get("id")?.as_str()?.to_string(),
            message: value.get("message")?.as_str()?.to_string(),
            author: value
                .get("author")
                .and_then(|a| a.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string(),
            timestamp: value
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }
}
