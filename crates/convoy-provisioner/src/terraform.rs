//! Terraform provider: each unit is a root module applied in place.

use async_trait::async_trait;
use convoy_core::provider::ResourceProvider;
use convoy_core::stack::{Outputs, ProvisioningUnit};
use convoy_core::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Unit property naming the module directory.
pub const SOURCE_PROPERTY: &str = "source";

#[derive(Debug, thiserror::Error)]
pub enum TerraformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unit has no 'source' directory")]
    MissingSource,

    #[error("terraform init failed: {0}")]
    InitFailed(String),

    #[error("terraform apply failed: {0}")]
    ApplyFailed(String),

    #[error("terraform output failed: {0}")]
    OutputFailed(String),

    #[error("failed to parse terraform output: {0}")]
    ParseFailed(String),
}

/// One entry of `terraform output -json`.
#[derive(Debug, Deserialize)]
struct TerraformOutput {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// Provisions units with the `terraform` CLI.
#[derive(Debug, Clone)]
pub struct TerraformProvider {
    terraform_bin: String,
    /// Unit `source` directories are resolved against this root.
    root: PathBuf,
}

impl Default for TerraformProvider {
    fn default() -> Self {
        Self::new("terraform", ".")
    }
}

impl TerraformProvider {
    pub fn new(terraform_bin: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            terraform_bin: terraform_bin.into(),
            root: root.into(),
        }
    }

    pub fn terraform_bin(&self) -> &str {
        &self.terraform_bin
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_dir(&self, unit: &ProvisioningUnit) -> std::result::Result<PathBuf, TerraformError> {
        let source = unit
            .property(SOURCE_PROPERTY)
            .ok_or(TerraformError::MissingSource)?;
        Ok(self.root.join(source))
    }

    async fn terraform(&self, dir: &Path, args: &[String]) -> std::io::Result<(bool, String, String)> {
        debug!(dir = %dir.display(), args = ?args, "Running terraform");
        let output = Command::new(&self.terraform_bin)
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    pub async fn init(&self, dir: &Path) -> std::result::Result<(), TerraformError> {
        info!(dir = %dir.display(), "Running terraform init");
        let args = ["init", "-input=false", "-no-color"].map(String::from);
        let (ok, stdout, stderr) = self.terraform(dir, &args).await?;
        if !ok {
            error!(output = %stderr, "Terraform init failed");
            return Err(TerraformError::InitFailed(format!("{}\n{}", stdout, stderr)));
        }
        Ok(())
    }

    pub async fn apply(
        &self,
        dir: &Path,
        variables: &BTreeMap<String, String>,
    ) -> std::result::Result<(), TerraformError> {
        info!(dir = %dir.display(), variables = variables.len(), "Running terraform apply");
        let (ok, stdout, stderr) = self.terraform(dir, &apply_args(variables)).await?;
        if !ok {
            error!(output = %stderr, "Terraform apply failed");
            return Err(TerraformError::ApplyFailed(format!("{}\n{}", stdout, stderr)));
        }
        Ok(())
    }

    pub async fn outputs(&self, dir: &Path) -> std::result::Result<Outputs, TerraformError> {
        let args = ["output", "-json"].map(String::from);
        let (ok, stdout, stderr) = self.terraform(dir, &args).await?;
        if !ok {
            return Err(TerraformError::OutputFailed(stderr));
        }
        parse_outputs(&stdout)
    }

    async fn provision_unit(
        &self,
        unit: &ProvisioningUnit,
        inputs: &Outputs,
    ) -> std::result::Result<Outputs, TerraformError> {
        let dir = self.module_dir(unit)?;
        self.init(&dir).await?;
        self.apply(&dir, &variables(unit, inputs)).await?;
        self.outputs(&dir).await
    }
}

#[async_trait]
impl ResourceProvider for TerraformProvider {
    fn name(&self) -> &'static str {
        "terraform"
    }

    async fn provision(&self, unit: &ProvisioningUnit, inputs: &Outputs) -> Result<Outputs> {
        let outputs = self
            .provision_unit(unit, inputs)
            .await
            .map_err(|e| Error::Provisioning {
                unit: unit.name.clone(),
                cause: e.to_string(),
            })?;
        info!(unit = %unit.name, outputs = ?outputs.keys().collect::<Vec<_>>(), "Terraform apply succeeded");
        Ok(outputs)
    }
}

/// Module variables: unit properties other than `source`, overridden by the
/// resolved inputs.
fn variables(unit: &ProvisioningUnit, inputs: &Outputs) -> BTreeMap<String, String> {
    unit.properties
        .iter()
        .filter(|(k, _)| k.as_str() != SOURCE_PROPERTY)
        .chain(inputs.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn apply_args(variables: &BTreeMap<String, String>) -> Vec<String> {
    let mut args: Vec<String> = ["apply", "-auto-approve", "-input=false", "-no-color"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(variables.iter().map(|(k, v)| format!("-var={}={}", k, v)));
    args
}

/// Parse `terraform output -json`. String values are taken as-is; anything
/// else is kept as its JSON text.
fn parse_outputs(json: &str) -> std::result::Result<Outputs, TerraformError> {
    if json.trim().is_empty() {
        return Ok(Outputs::new());
    }
    let raw: HashMap<String, TerraformOutput> =
        serde_json::from_str(json).map_err(|e| TerraformError::ParseFailed(e.to_string()))?;

    Ok(raw
        .into_iter()
        .map(|(key, output)| {
            if output.sensitive {
                debug!(output = %key, "Sensitive output passed through");
            }
            let value = match output.value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}
