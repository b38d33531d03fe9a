//! Deployment target and control-plane trait.
//!
//! A deployer is the control plane of the running service the pipeline's
//! final stage updates (an ECS service, a Kubernetes Deployment, ...).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;
use crate::builder::ImageRef;

/// Deploy budget used when an action does not set one.
pub const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Container health check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub port: u16,
    pub interval: Duration,
    pub retries: u32,
    /// Grace period before failed checks count.
    pub start_period: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            port: 80,
            interval: Duration::from_secs(30),
            retries: 3,
            start_period: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

/// The addressable running service updated by the deploy stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Service name.
    pub service: String,
    /// Cluster namespace, if the control plane has one.
    pub namespace: Option<String>,
    /// Container to update (defaults to the service name).
    pub container: Option<String>,
    /// Capacity the rollout converges to. Starts at zero: a deploy does not
    /// scale the service up unless this is raised explicitly.
    pub desired_capacity: u32,
    pub health_check: HealthCheck,
}

impl DeploymentTarget {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: None,
            container: None,
            desired_capacity: 0,
            health_check: HealthCheck::default(),
        }
    }

    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.service)
    }
}

/// Health as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    /// Rollout in progress or instances not yet passing checks.
    Pending,
    Healthy,
    /// The control plane gave up on the rollout.
    Failed { message: String },
}

/// Observed state of a deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStatus {
    /// Desired instance count currently set on the target.
    pub desired: u32,
    /// Instances passing health checks.
    pub ready: u32,
    /// Instances running the latest applied image.
    pub updated: u32,
    /// All instances, including ones still running a previous image.
    pub total: u32,
    pub health: Health,
}

impl TargetStatus {
    /// Whether the target runs `capacity` up-to-date, ready instances and
    /// nothing else.
    pub fn converged_at(&self, capacity: u32) -> bool {
        self.desired == capacity
            && self.ready == capacity
            && self.updated == capacity
            && self.total == capacity
            && !matches!(self.health, Health::Failed { .. })
    }
}

/// Terminal result of a deploy action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployOutcome {
    /// The target converged within budget.
    Done { status: TargetStatus },
    /// The control plane reported a failure before the budget elapsed.
    Failed { message: String },
    /// The budget elapsed first; the target is left as it was.
    TimedOut {
        budget: Duration,
        last_status: Option<TargetStatus>,
    },
}

/// Control plane of a deployment target.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Point the target at a new image.
    async fn apply_image(&self, target: &DeploymentTarget, image: &ImageRef) -> Result<()>;

    /// Set the number of instances the target should run.
    async fn set_desired_capacity(&self, target: &DeploymentTarget, capacity: u32) -> Result<()>;

    /// Read the target's current state.
    async fn status(&self, target: &DeploymentTarget) -> Result<TargetStatus>;
}
