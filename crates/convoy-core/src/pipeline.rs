//! Pipeline, stage and action definitions.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::deployer::{DEFAULT_DEPLOYMENT_TIMEOUT, DeploymentTarget};
use crate::repository::PushEvent;
use crate::{Error, Result};

/// The fixed phases of a pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    Source,
    Build,
    Deploy,
}

impl StageKind {
    /// The only valid stage order.
    pub const ORDER: [StageKind; 3] = [StageKind::Source, StageKind::Build, StageKind::Deploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Source => "Source",
            StageKind::Build => "Build",
            StageKind::Deploy => "Deploy",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "source" => Ok(StageKind::Source),
            "build" => Ok(StageKind::Build),
            "deploy" => Ok(StageKind::Deploy),
            _ => Err(Error::InvalidInput(format!("unknown stage kind: {}", s))),
        }
    }
}

/// Pull a branch from source control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAction {
    /// Repository clone URL.
    pub repository: String,
    /// Branch whose pushes trigger the pipeline.
    pub branch: String,
}

/// Build an image from the source artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAction {
    /// Image of the build environment.
    pub build_image: String,
    /// Commands to run; empty means the builder's default build-and-push.
    pub commands: Vec<String>,
    /// Environment variables (may contain `${...}` variables).
    pub env: HashMap<String, String>,
    /// Whether the build needs a container daemon.
    pub privileged: bool,
    /// Image to produce, as `repository:tag` (may contain variables).
    pub image: String,
}

/// Roll an image out to a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAction {
    pub target: DeploymentTarget,
    /// Budget for the rollout to converge.
    pub timeout: Duration,
}

impl DeployAction {
    pub fn new(target: DeploymentTarget) -> Self {
        Self {
            target,
            timeout: DEFAULT_DEPLOYMENT_TIMEOUT,
        }
    }
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Source(SourceAction),
    Build(BuildAction),
    Deploy(Box<DeployAction>),
}

impl ActionKind {
    /// The stage kind this action may appear in.
    pub fn stage_kind(&self) -> StageKind {
        match self {
            ActionKind::Source(_) => StageKind::Source,
            ActionKind::Build(_) => StageKind::Build,
            ActionKind::Deploy(_) => StageKind::Deploy,
        }
    }
}

/// A unit of work bound to one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    /// Artifacts consumed, by name.
    pub inputs: Vec<String>,
    /// Artifacts produced, by name.
    pub outputs: Vec<String>,
    pub kind: ActionKind,
}

impl Action {
    /// Number of (inputs, outputs) an action of this kind must declare.
    fn expected_shape(&self) -> (usize, usize) {
        match self.kind {
            ActionKind::Source(_) => (0, 1),
            ActionKind::Build(_) => (1, 1),
            ActionKind::Deploy(_) => (1, 0),
        }
    }
}

/// A named phase of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub actions: Vec<Action>,
}

impl Stage {
    /// Artifacts consumed by any action of this stage.
    pub fn consumes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.actions
            .iter()
            .flat_map(|a| a.inputs.iter())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// Artifacts produced by any action of this stage.
    pub fn produces(&self) -> Vec<String> {
        self.actions
            .iter()
            .flat_map(|a| a.outputs.iter().cloned())
            .collect()
    }
}

/// What starts a pipeline run: a push to the source branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub repository: String,
    pub branch: String,
}

impl Trigger {
    /// Whether a push event should start a run.
    pub fn matches(&self, push: &PushEvent) -> bool {
        push.branch.as_deref() == Some(self.branch.as_str())
    }
}

/// A deployment pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// The trigger, derived from the first source action.
    pub fn trigger(&self) -> Option<Trigger> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .find_map(|a| match &a.kind {
                ActionKind::Source(src) => Some(Trigger {
                    repository: src.repository.clone(),
                    branch: src.branch.clone(),
                }),
                _ => None,
            })
    }

    /// Check stage order, action shapes and artifact wiring.
    pub fn validate(&self) -> Result<()> {
        let kinds: Vec<StageKind> = self.stages.iter().map(|s| s.kind).collect();
        if kinds != StageKind::ORDER {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' must have stages Source, Build, Deploy in that order; found {:?}",
                self.name, kinds
            )));
        }

        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.actions.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' has no actions",
                    stage.name
                )));
            }

            let mut action_names = HashSet::new();
            for action in &stage.actions {
                if !action_names.insert(action.name.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "duplicate action '{}' in stage '{}'",
                        action.name, stage.name
                    )));
                }
                if action.kind.stage_kind() != stage.kind {
                    return Err(Error::InvalidInput(format!(
                        "action '{}' is a {} action but stage '{}' is a {} stage",
                        action.name,
                        action.kind.stage_kind(),
                        stage.name,
                        stage.kind
                    )));
                }
                let (inputs, outputs) = action.expected_shape();
                if action.inputs.len() != inputs || action.outputs.len() != outputs {
                    return Err(Error::InvalidInput(format!(
                        "action '{}' must declare {} input(s) and {} output(s)",
                        action.name, inputs, outputs
                    )));
                }
            }
        }

        // Artifacts visible to a stage are those produced by earlier stages.
        let mut produced: HashSet<&str> = HashSet::new();
        for stage in &self.stages {
            for action in &stage.actions {
                for input in &action.inputs {
                    if !produced.contains(input.as_str()) {
                        return Err(Error::ArtifactNotFound {
                            artifact: input.clone(),
                            stage: stage.name.clone(),
                        });
                    }
                }
            }
            let mut this_stage: HashSet<&str> = HashSet::new();
            for output in stage.actions.iter().flat_map(|a| a.outputs.iter()) {
                if produced.contains(output.as_str()) || !this_stage.insert(output.as_str()) {
                    return Err(Error::DuplicateArtifact {
                        artifact: output.clone(),
                        stage: stage.name.clone(),
                    });
                }
            }
            produced.extend(this_stage);
        }

        Ok(())
    }
}

/// Where a stage is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Running,
    Done,
    Failed,
    TimedOut,
}

/// Overall pipeline position, e.g. `Build.Running` or `Deploy.TimedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelinePhase {
    Pending,
    Stage { kind: StageKind, state: StageState },
}

impl PipelinePhase {
    pub fn stage(kind: StageKind, state: StageState) -> Self {
        PipelinePhase::Stage { kind, state }
    }

    /// Whether the whole pipeline completed.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Stage {
                kind: StageKind::Deploy,
                state: StageState::Done
            }
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Stage {
                state: StageState::Failed | StageState::TimedOut,
                ..
            }
        )
    }
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelinePhase::Pending => write!(f, "Pending"),
            PipelinePhase::Stage { kind, state } => write!(f, "{}.{:?}", kind, state),
        }
    }
}
