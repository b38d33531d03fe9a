//! End-to-end runs: provision the stack, then run the pipeline.

use convoy_core::pipeline::Pipeline;
use convoy_core::provider::ResourceProvider;
use convoy_core::repository::PushEvent;
use convoy_core::stack::ResourceGraph;
use convoy_core::{Error, RunId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::orchestrator::{PipelineEngine, PipelineEvent, PipelineResult, RunContext};
use crate::resolver::{self, ProvisionFailure, StackOutputs};

/// How an orchestration run ended.
#[derive(Debug, Clone)]
pub enum RunStatus {
    /// The push did not match the pipeline trigger; nothing ran.
    Skipped { reason: String },
    /// Resolution or provisioning failed; no stage ran.
    ProvisioningFailed(Error),
    /// The pipeline ran; see its result for the final phase.
    Finished(Box<PipelineResult>),
}

#[derive(Debug, Clone)]
pub struct OrchestrationReport {
    pub run_id: RunId,
    /// Outputs of the units provisioned before the run stopped.
    pub stack: StackOutputs,
    pub status: RunStatus,
}

impl OrchestrationReport {
    pub fn is_success(&self) -> bool {
        matches!(&self.status, RunStatus::Finished(result) if result.is_success())
    }

    pub fn pipeline(&self) -> Option<&PipelineResult> {
        match &self.status {
            RunStatus::Finished(result) => Some(result.as_ref()),
            _ => None,
        }
    }
}

/// Provisions the resource graph and runs the pipeline for a push.
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn ResourceProvider>,
    engine: PipelineEngine,
    process_env: bool,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ResourceProvider>, engine: PipelineEngine) -> Self {
        Self {
            provider,
            engine,
            process_env: false,
        }
    }

    /// Expose the process environment as `${env.*}` during runs.
    pub fn with_process_env(mut self) -> Self {
        self.process_env = true;
        self
    }

    /// Resolve and provision the graph without running the pipeline.
    pub async fn provision(
        &self,
        graph: &ResourceGraph,
    ) -> Result<StackOutputs, ProvisionFailure> {
        let order = resolver::resolve(graph)?;
        info!(
            units = ?order.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
            "Resolved provisioning order"
        );
        resolver::provision(&order, self.provider.as_ref()).await
    }

    pub async fn run(
        &self,
        graph: &ResourceGraph,
        pipeline: &Pipeline,
        push: PushEvent,
    ) -> OrchestrationReport {
        self.run_inner(graph, pipeline, push, None).await
    }

    pub async fn run_with_events(
        &self,
        graph: &ResourceGraph,
        pipeline: &Pipeline,
        push: PushEvent,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> OrchestrationReport {
        self.run_inner(graph, pipeline, push, Some(tx)).await
    }

    async fn run_inner(
        &self,
        graph: &ResourceGraph,
        pipeline: &Pipeline,
        push: PushEvent,
        tx: Option<mpsc::Sender<PipelineEvent>>,
    ) -> OrchestrationReport {
        let mut ctx = RunContext::new(push);
        if self.process_env {
            ctx = ctx.with_process_env();
        }
        let run_id = ctx.run_id;

        let report = |stack, status| OrchestrationReport {
            run_id,
            stack,
            status,
        };

        let Some(trigger) = pipeline.trigger() else {
            return report(
                StackOutputs::new(),
                RunStatus::Skipped {
                    reason: format!("pipeline '{}' has no source action", pipeline.name),
                },
            );
        };
        if !trigger.matches(&ctx.push) {
            info!(
                %run_id,
                pushed = ctx.push.branch.as_deref().unwrap_or("-"),
                branch = %trigger.branch,
                "Push does not match trigger, skipping"
            );
            return report(
                StackOutputs::new(),
                RunStatus::Skipped {
                    reason: format!(
                        "push to {} does not match branch '{}'",
                        ctx.push.r#ref, trigger.branch
                    ),
                },
            );
        }

        if ctx.push.is_deletion() {
            info!(%run_id, git_ref = %ctx.push.r#ref, "Push deleted the branch, skipping");
            return report(
                StackOutputs::new(),
                RunStatus::Skipped {
                    reason: format!("push deleted {}", ctx.push.r#ref),
                },
            );
        }

        info!(%run_id, pipeline = %pipeline.name, units = graph.len(), "Starting orchestration run");

        let stack = match self.provision(graph).await {
            Ok(stack) => stack,
            Err(ProvisionFailure { provisioned, error }) => {
                error!(
                    %run_id,
                    error = %error,
                    provisioned = provisioned.len(),
                    "Provisioning failed, pipeline not started"
                );
                return report(provisioned, RunStatus::ProvisioningFailed(error));
            }
        };

        let ctx = ctx.with_stack_outputs(&stack);
        let result = match tx {
            Some(tx) => self.engine.run_with_events(pipeline, ctx, tx).await,
            None => self.engine.run(pipeline, ctx).await,
        };

        report(stack, RunStatus::Finished(Box::new(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::tests::MockDeployer;
    use crate::orchestrator::tests::{MockBuilder, MockSource, sdlc_pipeline};
    use crate::resolver::tests::{MockProvider, network_and_cluster};
    use convoy_core::pipeline::{PipelinePhase, StageKind, StageState};
    use std::time::Duration;

    fn orchestrator(provider: Arc<MockProvider>) -> (Orchestrator, Arc<MockSource>) {
        let source = Arc::new(MockSource::default());
        let engine = PipelineEngine::new(
            source.clone(),
            Arc::new(MockBuilder::default()),
            Arc::new(MockDeployer::ready_after(Duration::from_secs(30))),
        );
        (Orchestrator::new(provider, engine), source)
    }

    fn push(branch: &str) -> PushEvent {
        PushEvent::for_branch("acme/sdlc-automation", branch, "9f1c2e7d8a4b3c6e")
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run() {
        let provider = Arc::new(MockProvider::default());
        let (orchestrator, _) = orchestrator(provider.clone());

        let report = orchestrator
            .run(
                &network_and_cluster(),
                &sdlc_pipeline(Duration::from_secs(600)),
                push("main"),
            )
            .await;

        assert!(report.is_success());
        let provisioned: Vec<&str> = report.stack.units().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(provisioned, vec!["Network", "Cluster"]);
        assert_eq!(report.pipeline().unwrap().run_id, report.run_id);
    }

    #[tokio::test]
    async fn test_other_branch_is_skipped() {
        let provider = Arc::new(MockProvider::default());
        let (orchestrator, source) = orchestrator(provider.clone());

        let report = orchestrator
            .run(
                &network_and_cluster(),
                &sdlc_pipeline(Duration::from_secs(600)),
                push("feature/x"),
            )
            .await;

        assert!(matches!(report.status, RunStatus::Skipped { .. }));
        assert!(provider.calls.lock().unwrap().is_empty());
        assert!(source.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_branch_deletion_is_skipped() {
        let provider = Arc::new(MockProvider::default());
        let (orchestrator, source) = orchestrator(provider.clone());

        let deletion = PushEvent::for_branch("acme/sdlc-automation", "main", "0".repeat(40));
        let report = orchestrator
            .run(
                &network_and_cluster(),
                &sdlc_pipeline(Duration::from_secs(600)),
                deletion,
            )
            .await;

        match &report.status {
            RunStatus::Skipped { reason } => assert!(reason.contains("deleted")),
            other => panic!("expected Skipped, got {:?}", other),
        }
        assert!(provider.calls.lock().unwrap().is_empty());
        assert!(source.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_failure_halts_before_pipeline() {
        let provider = Arc::new(MockProvider {
            fail_on: Some("Network".into()),
            ..Default::default()
        });
        let (orchestrator, source) = orchestrator(provider.clone());

        let report = orchestrator
            .run(
                &network_and_cluster(),
                &sdlc_pipeline(Duration::from_secs(600)),
                push("main"),
            )
            .await;

        match &report.status {
            RunStatus::ProvisioningFailed(Error::Provisioning { unit, .. }) => {
                assert_eq!(unit, "Network");
            }
            other => panic!("expected ProvisioningFailed, got {:?}", other),
        }
        assert!(report.pipeline().is_none());
        assert!(report.stack.is_empty());
        assert!(source.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_keeps_units_provisioned_before_failure() {
        let provider = Arc::new(MockProvider {
            fail_on: Some("Cluster".into()),
            ..Default::default()
        });
        let (orchestrator, _) = orchestrator(provider.clone());

        let report = orchestrator
            .run(
                &network_and_cluster(),
                &sdlc_pipeline(Duration::from_secs(600)),
                push("main"),
            )
            .await;

        assert!(matches!(report.status, RunStatus::ProvisioningFailed(_)));
        let provisioned: Vec<&str> = report.stack.units().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(provisioned, vec!["Network"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_unit_output_fails_deploy() {
        let provider = Arc::new(MockProvider::default());
        let (orchestrator, _) = orchestrator(provider);

        // The deploy namespace reads ${units.Cluster.cluster_name}.
        let mut graph = ResourceGraph::new();
        graph
            .add_unit(convoy_core::stack::ProvisioningUnit::new("Network").with_output("vpc_id"))
            .unwrap();

        let report = orchestrator
            .run(&graph, &sdlc_pipeline(Duration::from_secs(600)), push("main"))
            .await;

        let result = report.pipeline().unwrap();
        assert_eq!(
            result.phase,
            PipelinePhase::stage(StageKind::Deploy, StageState::Failed)
        );
        assert!(matches!(
            result.failure.as_ref().map(|f| &f.error),
            Some(Error::InvalidInput(_))
        ));
    }
}
