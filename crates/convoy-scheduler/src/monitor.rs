//! Deployment monitor - rolls an image out and waits for the target to converge.

use convoy_core::artifact::Artifact;
use convoy_core::builder::ImageRef;
use convoy_core::deployer::{DeployOutcome, Deployer, DeploymentTarget, Health, TargetStatus};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the target's status is polled when not configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DeploymentMonitor {
    poll_interval: Duration,
}

impl Default for DeploymentMonitor {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DeploymentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Apply an image artifact to `target` and wait up to `budget` for it to converge.
    ///
    /// When the budget elapses the monitor stops waiting and reports
    /// `TimedOut`; the target keeps whatever state the rollout reached.
    pub async fn deploy(
        &self,
        deployer: &dyn Deployer,
        target: &DeploymentTarget,
        artifact: &Artifact,
        budget: Duration,
    ) -> DeployOutcome {
        let Some(image) = artifact.as_image() else {
            return DeployOutcome::Failed {
                message: format!("artifact '{}' is not a container image", artifact.name()),
            };
        };

        info!(
            service = %target.service,
            image = %image,
            capacity = target.desired_capacity,
            budget_secs = budget.as_secs(),
            "Starting deployment"
        );

        let mut last_status = None;
        let result = tokio::time::timeout(
            budget,
            self.rollout(deployer, target, image, &mut last_status),
        )
        .await;

        match result {
            Ok(Ok(status)) => {
                info!(service = %target.service, ready = status.ready, "Deployment converged");
                DeployOutcome::Done { status }
            }
            Ok(Err(message)) => {
                warn!(service = %target.service, %message, "Deployment failed");
                DeployOutcome::Failed { message }
            }
            Err(_) => {
                warn!(service = %target.service, budget_secs = budget.as_secs(), "Deployment timed out");
                DeployOutcome::TimedOut {
                    budget,
                    last_status,
                }
            }
        }
    }

    async fn rollout(
        &self,
        deployer: &dyn Deployer,
        target: &DeploymentTarget,
        image: &ImageRef,
        last_status: &mut Option<TargetStatus>,
    ) -> std::result::Result<TargetStatus, String> {
        deployer
            .apply_image(target, image)
            .await
            .map_err(|e| format!("applying image {} failed: {}", image, e))?;

        deployer
            .set_desired_capacity(target, target.desired_capacity)
            .await
            .map_err(|e| format!("setting desired capacity failed: {}", e))?;

        loop {
            let status = deployer
                .status(target)
                .await
                .map_err(|e| format!("reading status failed: {}", e))?;

            if let Health::Failed { message } = &status.health {
                return Err(message.clone());
            }

            let converged = status.converged_at(target.desired_capacity);
            *last_status = Some(status.clone());
            if converged {
                return Ok(status);
            }

            debug!(
                service = %target.service,
                desired = status.desired,
                ready = status.ready,
                updated = status.updated,
                "Waiting for deployment to converge"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
