//! Resource providers for Convoy.
//!
//! Currently ships a Terraform provider that applies one root module per
//! provisioning unit.

pub mod terraform;

pub use terraform::{TerraformError, TerraformProvider};
