//! Variable interpolation for build and deploy settings.
//!
//! Supports variables like:
//! - `${units.Network.vpc_id}` - Output of a provisioned unit
//! - `${git.sha}` - Full commit SHA of the triggering push
//! - `${git.short_sha}` - Short (7 char) commit SHA
//! - `${git.branch}` - Branch that was pushed
//! - `${git.message}` - Commit message (first line)
//! - `${git.author}` - Commit author name
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${env.VAR_NAME}` - Environment variable

use convoy_core::repository::PushEvent;
use convoy_core::stack::{OutputRef, Outputs};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

/// All values available for interpolation during one run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline_name: String,
    pub run_id: String,
    /// Outputs of provisioned units, by unit name.
    pub units: HashMap<String, Outputs>,
    pub env: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub message: String,
    pub author: String,
}

impl GitContext {
    pub fn from_push(push: &PushEvent) -> Self {
        let (message, author) = push
            .head_commit
            .as_ref()
            .map(|c| {
                let first_line = c.message.lines().next().unwrap_or_default().to_string();
                (first_line, c.author.clone())
            })
            .unwrap_or_default();

        Self {
            sha: push.after.clone(),
            short_sha: push.after.chars().take(7).collect(),
            branch: push.branch.clone().unwrap_or_default(),
            message,
            author,
        }
    }
}

// Segments after the namespace may contain dashes (unit names).
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z0-9_-]+)*)\}")
        .expect("variable pattern is a valid regex")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current process environment into `env.*`.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),

            ["pipeline", "name"] => Some(self.pipeline_name.clone()),
            ["run", "id"] => Some(self.run_id.clone()),

            ["env", name] => self.env.get(*name).cloned(),
            ["units", unit, key] => self.units.get(*unit).and_then(|o| o.get(*key)).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string, leaving unknown ones as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate all variables in a string; any unknown variable is an error.
    pub fn try_interpolate(&self, input: &str) -> ConfigResult<String> {
        if let Some(missing) = VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .find(|name| self.resolve(name).is_none())
        {
            return Err(ConfigError::InvalidReference(format!(
                "unresolved variable ${{{}}}",
                missing
            )));
        }
        Ok(self.interpolate(input))
    }

    /// Interpolate every value of a map.
    pub fn try_interpolate_map(
        &self,
        map: &HashMap<String, String>,
    ) -> ConfigResult<HashMap<String, String>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.try_interpolate(v)?)))
            .collect()
    }
}

/// Unit outputs referenced through `${units.Unit.key}` in a string.
pub fn unit_references(input: &str) -> Vec<OutputRef> {
    VAR_REGEX
        .captures_iter(input)
        .filter_map(|caps| match caps[1].split('.').collect::<Vec<_>>().as_slice() {
            ["units", unit, key] => Some(OutputRef::new(*unit, *key)),
            _ => None,
        })
        .collect()
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_push(mut self, push: &PushEvent) -> Self {
        self.ctx.git = GitContext::from_push(push);
        self
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline_name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>) -> Self {
        self.ctx.run_id = id.into();
        self
    }

    pub fn with_unit_outputs(mut self, unit: impl Into<String>, outputs: Outputs) -> Self {
        self.ctx.units.insert(unit.into(), outputs);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890")
            .with_git_branch("main")
            .build();

        let result = ctx.interpolate("Commit ${git.sha} on ${git.branch}");
        assert_eq!(result, "Commit abc1234567890 on main");
        assert_eq!(ctx.interpolate("${git.short_sha}"), "abc1234");
    }

    #[test]
    fn test_unit_outputs() {
        let mut outputs = Outputs::new();
        outputs.insert("cluster_name".into(), "prod-eks".into());
        let ctx = VariableContextBuilder::new()
            .with_unit_outputs("Cluster", outputs)
            .build();

        assert_eq!(
            ctx.interpolate("kubectl --context ${units.Cluster.cluster_name}"),
            "kubectl --context prod-eks"
        );
        assert_eq!(ctx.resolve("units.Cluster.missing"), None);
    }

    #[test]
    fn test_env_and_run_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("AWS_REGION", "eu-west-1")
            .with_pipeline("sdlc-automation")
            .with_run("run-1")
            .build();

        let result = ctx.interpolate("${pipeline.name}/${run.id} in ${env.AWS_REGION}");
        assert_eq!(result, "sdlc-automation/run-1 in eu-west-1");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("Unknown: ${unknown.var}"), "Unknown: ${unknown.var}");
    }

    #[test]
    fn test_strict_interpolation() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();
        assert_eq!(ctx.try_interpolate("app:${git.sha}").unwrap(), "app:abc123");

        match ctx.try_interpolate("app:${env.MISSING}") {
            Err(ConfigError::InvalidReference(msg)) => assert!(msg.contains("env.MISSING")),
            other => panic!("expected InvalidReference, got {:?}", other),
        }

        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "${git.short_sha}".to_string());
        let env = ctx.try_interpolate_map(&env).unwrap();
        assert_eq!(env["TAG"], "abc123");
    }

    #[test]
    fn test_git_context_from_push() {
        let mut push = PushEvent::for_branch("acme/app", "main", "9f1c2e7d8a4b");
        push.head_commit = Some(convoy_core::repository::CommitInfo {
            sha: "9f1c2e7d8a4b".into(),
            message: "Fix health check\n\nLonger body".into(),
            author: "Dev".into(),
            timestamp: None,
        });

        let git = GitContext::from_push(&push);
        assert_eq!(git.short_sha, "9f1c2e7");
        assert_eq!(git.branch, "main");
        assert_eq!(git.message, "Fix health check");
        assert_eq!(git.author, "Dev");
    }

    #[test]
    fn test_unit_references() {
        let refs = unit_references("${units.Network.vpc_id}-${git.sha}-${units.eks-cluster.name}");
        assert_eq!(
            refs,
            vec![
                OutputRef::new("Network", "vpc_id"),
                OutputRef::new("eks-cluster", "name")
            ]
        );
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();
        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
