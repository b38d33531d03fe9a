//! Stack resolver - orders provisioning units and provisions them.

use convoy_core::provider::ResourceProvider;
use convoy_core::stack::{OutputRef, Outputs, ProvisioningUnit, ResourceGraph};
use convoy_core::{Error, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use tracing::{error, info};

/// A unit that was provisioned, with the outputs its provider returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedUnit {
    pub name: String,
    pub outputs: Outputs,
}

/// Outputs of every provisioned unit, in provisioning order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StackOutputs {
    units: Vec<ProvisionedUnit>,
}

impl StackOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> &[ProvisionedUnit] {
        &self.units
    }

    pub fn get(&self, unit: &str) -> Option<&Outputs> {
        self.units
            .iter()
            .find(|u| u.name == unit)
            .map(|u| &u.outputs)
    }

    pub fn value(&self, reference: &OutputRef) -> Option<&str> {
        self.get(&reference.unit)?
            .get(&reference.key)
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn push_unit(&mut self, name: impl Into<String>, outputs: Outputs) {
        self.units.push(ProvisionedUnit {
            name: name.into(),
            outputs,
        });
    }

    /// Unit name to outputs, for reporting.
    pub fn to_map(&self) -> BTreeMap<String, Outputs> {
        self.units
            .iter()
            .map(|u| (u.name.clone(), u.outputs.clone()))
            .collect()
    }
}

/// Order the units of a graph so every unit follows the units it references.
///
/// Among units that are ready at the same time, the one registered first
/// goes first, so the order is stable for a given graph.
pub fn resolve(graph: &ResourceGraph) -> Result<Vec<&ProvisioningUnit>> {
    graph.validate()?;

    let units = graph.units();
    let mut pending: Vec<usize> = vec![0; units.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];

    for (idx, unit) in units.iter().enumerate() {
        for dep in unit.depends_on() {
            let dep_idx = graph
                .position(dep)
                .ok_or_else(|| Error::Internal(format!("unit '{}' vanished from graph", dep)))?;
            pending[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut order = Vec::with_capacity(units.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(&units[idx]);
        for &next in &dependents[idx] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != units.len() {
        return Err(Error::Internal(
            "validated graph could not be fully ordered".to_string(),
        ));
    }

    Ok(order)
}

/// Provisioning stopped at a failed unit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct ProvisionFailure {
    /// Units provisioned before the failure. They are left in place.
    pub provisioned: StackOutputs,
    pub error: Error,
}

impl From<Error> for ProvisionFailure {
    fn from(error: Error) -> Self {
        Self {
            provisioned: StackOutputs::new(),
            error,
        }
    }
}

/// Provision units in the given order, stopping at the first failure.
///
/// Units after a failed one are never attempted and nothing already
/// provisioned is rolled back.
pub async fn provision(
    order: &[&ProvisioningUnit],
    provider: &dyn ResourceProvider,
) -> std::result::Result<StackOutputs, ProvisionFailure> {
    let mut stack = StackOutputs::new();

    for unit in order {
        match provision_unit(unit, provider, &stack).await {
            Ok(outputs) => {
                info!(unit = %unit.name, outputs = outputs.len(), "Unit provisioned");
                stack.push_unit(unit.name.clone(), outputs);
            }
            Err(error) => {
                return Err(ProvisionFailure {
                    provisioned: stack,
                    error,
                });
            }
        }
    }

    Ok(stack)
}

async fn provision_unit(
    unit: &ProvisioningUnit,
    provider: &dyn ResourceProvider,
    stack: &StackOutputs,
) -> Result<Outputs> {
    let inputs = resolve_inputs(unit, stack)?;

    info!(unit = %unit.name, provider = provider.name(), inputs = inputs.len(), "Provisioning unit");

    let outputs = provider.provision(unit, &inputs).await.map_err(|e| {
        error!(unit = %unit.name, error = %e, "Provisioning failed");
        match e {
            Error::Provisioning { .. } => e,
            other => Error::Provisioning {
                unit: unit.name.clone(),
                cause: other.to_string(),
            },
        }
    })?;

    if let Some(missing) = unit.outputs.iter().find(|k| !outputs.contains_key(*k)) {
        error!(unit = %unit.name, output = %missing, "Provider did not return a declared output");
        return Err(Error::Provisioning {
            unit: unit.name.clone(),
            cause: format!("provider did not return declared output '{}'", missing),
        });
    }

    Ok(outputs)
}

fn resolve_inputs(unit: &ProvisioningUnit, stack: &StackOutputs) -> Result<Outputs> {
    unit.inputs
        .iter()
        .map(|(input, reference)| {
            stack
                .value(reference)
                .map(|v| (input.clone(), v.to_string()))
                .ok_or_else(|| Error::Provisioning {
                    unit: unit.name.clone(),
                    cause: format!(
                        "input '{}' references '{}', which has not been provisioned",
                        input, reference
                    ),
                })
        })
        .collect()
}
