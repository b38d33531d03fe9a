//! Artifacts and the channel that hands them from stage to stage.
//!
//! The channel knows the stage order and what each stage declares it consumes
//! and produces, so it can tell "nobody upstream makes this" apart from "the
//! producer has not finished yet". Artifacts are immutable once produced and
//! handed out as `Arc`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::builder::{ImageRef, SourceSnapshot};
use crate::pipeline::Pipeline;
use crate::{Error, Result};

/// Content of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactPayload {
    /// A source tree at a commit.
    Source(SourceSnapshot),
    /// A built container image.
    Image(ImageRef),
}

/// An immutable payload passed between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    name: String,
    producer: String,
    payload: ArtifactPayload,
    created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, producer: impl Into<String>, payload: ArtifactPayload) -> Self {
        Self {
            name: name.into(),
            producer: producer.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage that produced this artifact.
    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn payload(&self) -> &ArtifactPayload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn as_source(&self) -> Option<&SourceSnapshot> {
        match &self.payload {
            ArtifactPayload::Source(snapshot) => Some(snapshot),
            ArtifactPayload::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageRef> {
        match &self.payload {
            ArtifactPayload::Image(image) => Some(image),
            ArtifactPayload::Source(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StageEntry {
    name: String,
    consumes: Vec<String>,
    produces: Vec<String>,
    completed: bool,
}

/// Typed artifact handoff between the stages of one run.
#[derive(Debug, Default)]
pub struct ArtifactChannel {
    stages: Vec<StageEntry>,
    available: HashMap<String, Arc<Artifact>>,
    /// Artifacts produced in this run and since dropped.
    retired: HashSet<String>,
}

impl ArtifactChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel with every stage of `pipeline` registered in order.
    pub fn for_pipeline(pipeline: &Pipeline) -> Result<Self> {
        let mut channel = Self::new();
        for stage in &pipeline.stages {
            channel.register_stage(&stage.name, stage.consumes(), stage.produces())?;
        }
        Ok(channel)
    }

    /// Declare the next stage in order, with the artifacts it consumes and produces.
    pub fn register_stage(
        &mut self,
        stage: &str,
        consumes: Vec<String>,
        produces: Vec<String>,
    ) -> Result<()> {
        if self.position(stage).is_some() {
            return Err(Error::InvalidInput(format!(
                "stage '{}' is already registered",
                stage
            )));
        }
        self.stages.push(StageEntry {
            name: stage.to_string(),
            consumes,
            produces,
            completed: false,
        });
        Ok(())
    }

    /// Make an artifact available from `stage`. Names are unique per run.
    pub fn produce(
        &mut self,
        stage: &str,
        name: impl Into<String>,
        payload: ArtifactPayload,
    ) -> Result<Arc<Artifact>> {
        let name = name.into();
        if self.position(stage).is_none() {
            return Err(Error::NotFound(format!("stage '{}'", stage)));
        }
        if self.available.contains_key(&name) || self.retired.contains(&name) {
            return Err(Error::DuplicateArtifact {
                artifact: name,
                stage: stage.to_string(),
            });
        }

        let artifact = Arc::new(Artifact::new(name.clone(), stage, payload));
        self.available.insert(name, artifact.clone());
        Ok(artifact)
    }

    /// Fetch an artifact for `stage`. Only artifacts of completed, preceding
    /// stages can be consumed.
    pub fn consume(&self, stage: &str, name: &str) -> Result<Arc<Artifact>> {
        let consumer = self
            .position(stage)
            .ok_or_else(|| Error::NotFound(format!("stage '{}'", stage)))?;

        let not_found = || Error::ArtifactNotFound {
            artifact: name.to_string(),
            stage: stage.to_string(),
        };

        if self.retired.contains(name) {
            return Err(not_found());
        }

        let producer = match self.available.get(name) {
            Some(artifact) => self.position(artifact.producer()),
            None => self
                .stages
                .iter()
                .position(|s| s.produces.iter().any(|p| p == name)),
        };
        let producer = match producer {
            Some(idx) if idx < consumer => idx,
            _ => return Err(not_found()),
        };

        let entry = &self.stages[producer];
        match self.available.get(name) {
            Some(artifact) if entry.completed => Ok(artifact.clone()),
            _ => Err(Error::ArtifactNotYetAvailable {
                artifact: name.to_string(),
                stage: stage.to_string(),
                producer: entry.name.clone(),
            }),
        }
    }

    /// Mark a stage as completed, releasing its artifacts to later stages.
    pub fn complete_stage(&mut self, stage: &str) -> Result<()> {
        let idx = self
            .position(stage)
            .ok_or_else(|| Error::NotFound(format!("stage '{}'", stage)))?;
        self.stages[idx].completed = true;
        Ok(())
    }

    /// Drop artifacts no pending stage consumes. Returns the dropped names.
    pub fn prune(&mut self) -> Vec<String> {
        let mut dropped: Vec<String> = self
            .available
            .iter()
            .filter(|(name, artifact)| {
                let producer_done = self
                    .position(artifact.producer())
                    .map(|idx| self.stages[idx].completed)
                    .unwrap_or(true);
                producer_done
                    && !self
                        .stages
                        .iter()
                        .any(|s| !s.completed && s.consumes.iter().any(|c| c == *name))
            })
            .map(|(name, _)| name.clone())
            .collect();
        dropped.sort();

        for name in &dropped {
            self.available.remove(name);
            self.retired.insert(name.clone());
        }
        dropped
    }

    /// Whether an artifact is currently held.
    pub fn contains(&self, name: &str) -> bool {
        self.available.contains_key(name)
    }

    fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }
}
