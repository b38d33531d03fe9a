//! Kubernetes deployer: drives a Deployment through the API server.

use async_trait::async_trait;
use convoy_core::builder::ImageRef;
use convoy_core::deployer::{Deployer, DeploymentTarget, Health, HealthCheck, TargetStatus};
use convoy_core::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Deployment condition reason set when a rollout stops making progress.
const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Field manager recorded on patches.
const FIELD_MANAGER: &str = "convoy";

/// Kubernetes-based deployer.
pub struct KubernetesDeployer {
    client: Client,
    /// Namespace used when a target does not name one.
    namespace: String,
}

impl KubernetesDeployer {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self, target: &DeploymentTarget) -> Api<Deployment> {
        let namespace = target.namespace.as_deref().unwrap_or(&self.namespace);
        Api::namespaced(self.client.clone(), namespace)
    }

    fn params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn api_error(target: &DeploymentTarget, action: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(response) if response.code == 404 => {
            Error::NotFound(format!("deployment '{}'", target.service))
        }
        other => Error::ExecutionFailed(format!(
            "{} deployment '{}' failed: {}",
            action, target.service, other
        )),
    }
}

#[async_trait]
impl Deployer for KubernetesDeployer {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn apply_image(&self, target: &DeploymentTarget, image: &ImageRef) -> Result<()> {
        info!(
            deployment = %target.service,
            container = target.container_name(),
            image = %image,
            "Patching deployment image"
        );
        let patch = image_patch(target, image);
        self.deployments(target)
            .patch(&target.service, &Self::params(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| api_error(target, "patching", e))?;
        Ok(())
    }

    async fn set_desired_capacity(&self, target: &DeploymentTarget, capacity: u32) -> Result<()> {
        info!(deployment = %target.service, replicas = capacity, "Scaling deployment");
        let patch = json!({ "spec": { "replicas": capacity } });
        self.deployments(target)
            .patch_scale(&target.service, &Self::params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(target, "scaling", e))?;
        Ok(())
    }

    async fn status(&self, target: &DeploymentTarget) -> Result<TargetStatus> {
        let deployment = self
            .deployments(target)
            .get(&target.service)
            .await
            .map_err(|e| api_error(target, "reading", e))?;
        let status = target_status(&deployment);
        debug!(deployment = %target.service, status = ?status, "Read deployment status");
        Ok(status)
    }
}

/// Strategic merge patch setting the container's image and liveness probe.
/// Containers merge by name, so other containers are left alone.
fn image_patch(target: &DeploymentTarget, image: &ImageRef) -> Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": target.container_name(),
                        "image": image.to_string(),
                        "livenessProbe": liveness_probe(&target.health_check),
                    }]
                }
            }
        }
    })
}

fn liveness_probe(check: &HealthCheck) -> Value {
    json!({
        "httpGet": {
            "path": check.path,
            "port": check.port,
        },
        "periodSeconds": check.interval.as_secs(),
        "failureThreshold": check.retries,
        "initialDelaySeconds": check.start_period.as_secs(),
        "timeoutSeconds": check.timeout.as_secs(),
    })
}

fn count(value: Option<i32>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

/// Map a Deployment to the monitor's view of it.
///
/// Until the controller has observed the latest generation the counts
/// describe the previous rollout, so nothing is reported as updated.
/// Pods count as ready only once they are also available.
fn target_status(deployment: &Deployment) -> TargetStatus {
    let desired = count(deployment.spec.as_ref().and_then(|s| s.replicas).or(Some(1)));
    let Some(status) = deployment.status.as_ref() else {
        return TargetStatus {
            desired,
            ready: 0,
            updated: 0,
            total: 0,
            health: Health::Pending,
        };
    };

    let failure = status.conditions.iter().flatten().find(|c| {
        c.type_ == "Progressing"
            && c.status == "False"
            && c.reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED)
    });
    if let Some(condition) = failure {
        return TargetStatus {
            desired,
            ready: count(status.ready_replicas),
            updated: count(status.updated_replicas),
            total: count(status.replicas),
            health: Health::Failed {
                message: condition
                    .message
                    .clone()
                    .unwrap_or_else(|| PROGRESS_DEADLINE_EXCEEDED.to_string()),
            },
        };
    }

    let observed = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    };

    let ready = count(status.ready_replicas).min(count(status.available_replicas));
    let total = count(status.replicas);
    let updated = if observed {
        count(status.updated_replicas)
    } else {
        0
    };
    let health = if observed && ready == desired && updated == desired && total == updated {
        Health::Healthy
    } else {
        Health::Pending
    };

    TargetStatus {
        desired,
        ready,
        updated,
        total,
        health,
    }
}
