//! Stack resolution and pipeline execution for Convoy.
//!
//! Resolves the resource graph into a provisioning order, provisions it,
//! then drives the Source, Build and Deploy stages of the pipeline.

pub mod monitor;
pub mod orchestrator;
pub mod resolver;
pub mod runner;

pub use monitor::DeploymentMonitor;
pub use orchestrator::{PipelineEngine, PipelineEvent, PipelineResult, RunContext, StageFailure};
pub use resolver::{ProvisionFailure, ProvisionedUnit, StackOutputs, provision, resolve};
pub use runner::{OrchestrationReport, Orchestrator, RunStatus};
