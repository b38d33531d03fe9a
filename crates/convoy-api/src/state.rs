//! Application state.

use convoy_config::Orchestration;
use convoy_core::repository::PushEvent;
use convoy_scheduler::{OrchestrationReport, Orchestrator, RunStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestration: Arc<Orchestration>,
    pub orchestrator: Arc<Orchestrator>,
    /// Secret for `X-Hub-Signature-256`; unsigned pushes are accepted when unset.
    pub webhook_secret: Option<String>,
    /// Held for the length of a run so pushes are processed one at a time.
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(orchestration: Orchestration, orchestrator: Orchestrator) -> Self {
        Self {
            orchestration: Arc::new(orchestration),
            orchestrator: Arc::new(orchestrator),
            webhook_secret: None,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.filter(|s| !s.is_empty());
        self
    }

    /// Start an orchestration run for `push` on a background task.
    pub fn spawn_run(&self, push: PushEvent) -> tokio::task::JoinHandle<OrchestrationReport> {
        let state = self.clone();
        tokio::spawn(async move {
            let _guard = state.run_lock.lock().await;
            let orchestration = &state.orchestration;
            let report = state
                .orchestrator
                .run(&orchestration.graph, &orchestration.pipeline, push)
                .await;
            log_report(&report);
            report
        })
    }
}

fn log_report(report: &OrchestrationReport) {
    match &report.status {
        RunStatus::Skipped { reason } => info!(run_id = %report.run_id, %reason, "Run skipped"),
        RunStatus::ProvisioningFailed(e) => {
            error!(run_id = %report.run_id, error = %e, "Run stopped during provisioning")
        }
        RunStatus::Finished(result) if result.is_success() => {
            info!(run_id = %report.run_id, phase = %result.phase, "Run succeeded")
        }
        RunStatus::Finished(result) => {
            let failure = result.failure.as_ref().map(|f| f.error.to_string());
            warn!(run_id = %report.run_id, phase = %result.phase, error = ?failure, "Run failed")
        }
    }
}
