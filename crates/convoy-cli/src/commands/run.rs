//! Provisioning and local pipeline runs.

use anyhow::{Context, Result};
use clap::Args;
use convoy_core::pipeline::PipelinePhase;
use convoy_core::repository::PushEvent;
use convoy_deployer::KubernetesDeployer;
use convoy_executor::{DockerBuilder, GitSource};
use convoy_provisioner::TerraformProvider;
use convoy_scheduler::{Orchestrator, PipelineEngine, PipelineEvent, RunStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::load;

/// Settings for the provisioning, build and deploy backends.
#[derive(Args, Debug)]
pub struct Backends {
    /// Terraform binary
    #[arg(long, env = "TERRAFORM_BIN", default_value = "terraform")]
    terraform_bin: String,

    /// Directory for source checkouts
    #[arg(long, env = "CONVOY_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Namespace of deployments that do not name one
    #[arg(long, env = "CONVOY_NAMESPACE", default_value = "default")]
    namespace: String,
}

impl Backends {
    /// Unit sources are resolved relative to the configuration file.
    fn provider(&self, config: &Path) -> TerraformProvider {
        let root = config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        TerraformProvider::new(&self.terraform_bin, root)
    }

    async fn engine(&self) -> Result<PipelineEngine> {
        let source = match &self.work_dir {
            Some(dir) => GitSource::new(dir),
            None => GitSource::default(),
        };
        let builder = DockerBuilder::new().context("Failed to connect to Docker")?;
        let deployer = KubernetesDeployer::new(&self.namespace)
            .await
            .context("Failed to connect to Kubernetes")?;
        Ok(PipelineEngine::new(
            Arc::new(source),
            Arc::new(builder),
            Arc::new(deployer),
        ))
    }
}

/// Provision every unit and print the outputs of the stack.
pub async fn provision(config: &Path, backends: &Backends) -> Result<()> {
    let orchestration = load(config)?;
    let provider = backends.provider(config);

    let order = convoy_scheduler::resolve(&orchestration.graph)?;
    match convoy_scheduler::provision(&order, &provider).await {
        Ok(stack) => {
            println!("{}", serde_json::to_string_pretty(&stack.to_map())?);
            Ok(())
        }
        Err(failure) => {
            if !failure.provisioned.is_empty() {
                println!("{}", serde_json::to_string_pretty(&failure.provisioned.to_map())?);
            }
            anyhow::bail!("Provisioning failed: {}", failure.error);
        }
    }
}

/// Simulate a push to `branch` and run the whole orchestration.
pub async fn run(
    config: &Path,
    branch: Option<String>,
    sha: Option<String>,
    backends: &Backends,
) -> Result<()> {
    let orchestration = load(config)?;
    let trigger = orchestration
        .pipeline
        .trigger()
        .context("Pipeline has no source action to trigger on")?;

    let branch = branch.unwrap_or_else(|| trigger.branch.clone());
    // An empty commit means "whatever the branch head is"
    let push = PushEvent::for_branch(&trigger.repository, branch, sha.unwrap_or_default());

    let engine = backends.engine().await?;
    let orchestrator = Orchestrator::new(Arc::new(backends.provider(config)), engine)
        .with_process_env();

    println!("Running pipeline: {}", orchestration.pipeline.name);
    println!("\n--- Starting run ---\n");

    let (tx, mut rx) = mpsc::channel(100);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", describe(&event));
        }
    });

    let report = orchestrator
        .run_with_events(&orchestration.graph, &orchestration.pipeline, push, tx)
        .await;
    printer.await.context("Event printer failed")?;

    if !report.stack.is_empty() {
        println!("\n--- Stack outputs ---");
        println!("{}", serde_json::to_string_pretty(&report.stack.to_map())?);
    }

    match report.status {
        RunStatus::Skipped { reason } => {
            println!("\n⊘ Run skipped: {}", reason);
            Ok(())
        }
        RunStatus::ProvisioningFailed(e) => {
            anyhow::bail!("Provisioning failed: {}", e);
        }
        RunStatus::Finished(result) => {
            println!("\n--- Phases ---");
            for phase in &result.history {
                println!("  {}", phase);
            }
            match &result.failure {
                None => {
                    println!("\n✓ Pipeline succeeded!");
                    Ok(())
                }
                Some(failure) => {
                    let location = match (&failure.stage, &failure.action) {
                        (Some(stage), Some(action)) => format!("{}/{}", stage, action),
                        (Some(stage), None) => stage.clone(),
                        _ => "validation".to_string(),
                    };
                    anyhow::bail!("Pipeline failed at {}: {}", location, failure.error);
                }
            }
        }
    }
}

fn describe(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::PhaseChanged { phase } => format!("● {}", phase),
        PipelineEvent::ActionStarted { stage, action } => {
            format!("▶ {}/{} started", stage, action)
        }
        PipelineEvent::ArtifactProduced { stage, artifact } => {
            format!("  {} produced {}", stage, artifact)
        }
        PipelineEvent::ActionCompleted { stage, action } => {
            format!("✓ {}/{} completed", stage, action)
        }
        PipelineEvent::PipelineCompleted { phase } if phase.is_success() => {
            "--- Pipeline completed successfully ---".to_string()
        }
        PipelineEvent::PipelineCompleted { phase: PipelinePhase::Pending } => {
            "--- Pipeline rejected ---".to_string()
        }
        PipelineEvent::PipelineCompleted { phase } => format!("--- Pipeline stopped at {} ---", phase),
    }
}
