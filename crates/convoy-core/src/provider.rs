//! Resource provider trait.
//!
//! Providers create the actual infrastructure behind a provisioning unit
//! (Terraform, CloudFormation, ...). Idempotency and retries are theirs to
//! handle; the resolver calls each provider exactly once per unit.

use async_trait::async_trait;

use crate::Result;
use crate::stack::{Outputs, ProvisioningUnit};

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Provision a unit given its resolved inputs, returning its outputs.
    async fn provision(&self, unit: &ProvisioningUnit, inputs: &Outputs) -> Result<Outputs>;
}
