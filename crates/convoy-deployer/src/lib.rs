//! Deployment control planes for Convoy.
//!
//! Provides deployer implementations:
//! - Kubernetes Deployments

pub mod kubernetes;

pub use convoy_core::deployer::{Deployer, DeploymentTarget, Health, TargetStatus};
pub use kubernetes::KubernetesDeployer;
