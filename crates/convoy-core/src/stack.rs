//! Provisioning units ("stacks") and the resource graph that ties them together.
//!
//! A unit declares the output keys it will expose once provisioned, and may
//! reference outputs of other units as its own inputs. The graph only holds
//! definitions; output values are collected by the resolver as units are
//! provisioned.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{Error, Result};

/// Output values of a provisioned unit, keyed by output name.
pub type Outputs = BTreeMap<String, String>;

/// Reference to one declared output of a unit, written `Unit.key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub unit: String,
    pub key: String,
}

impl OutputRef {
    pub fn new(unit: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.unit, self.key)
    }
}

impl std::str::FromStr for OutputRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((unit, key)) if !unit.is_empty() && !key.is_empty() => Ok(Self::new(unit, key)),
            _ => Err(Error::InvalidInput(format!(
                "output reference '{}' must have the form Unit.key",
                s
            ))),
        }
    }
}

/// A named set of infrastructure resources provisioned together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningUnit {
    /// Unit name, unique within a graph.
    pub name: String,
    /// Output keys this unit exposes after provisioning.
    pub outputs: BTreeSet<String>,
    /// Inputs, keyed by the name the provider sees them under.
    pub inputs: BTreeMap<String, OutputRef>,
    /// Provider-specific settings (e.g. `source` directory).
    pub properties: BTreeMap<String, String>,
}

impl ProvisioningUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: BTreeSet::new(),
            inputs: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.outputs.insert(key.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>, target: OutputRef) -> Self {
        self.inputs.insert(input.into(), target);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Names of the units this unit reads outputs from.
    pub fn depends_on(&self) -> BTreeSet<&str> {
        self.inputs.values().map(|r| r.unit.as_str()).collect()
    }
}

/// The set of provisioning units and their reference edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGraph {
    units: Vec<ProvisioningUnit>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit. Registration order is the resolver's tie-break.
    pub fn add_unit(&mut self, unit: ProvisioningUnit) -> Result<()> {
        if self.index.contains_key(&unit.name) {
            return Err(Error::InvalidInput(format!(
                "unit '{}' is already registered",
                unit.name
            )));
        }
        self.index.insert(unit.name.clone(), self.units.len());
        self.units.push(unit);
        Ok(())
    }

    /// Record that `from` consumes `to.output_key`, under the input name `output_key`.
    pub fn add_reference(&mut self, from: &str, to: &str, output_key: &str) -> Result<()> {
        self.add_reference_as(from, output_key, OutputRef::new(to, output_key))
    }

    /// Record that `from` consumes `target` under the given input name.
    ///
    /// An input name can be bound to one output only; repeating the same
    /// binding is a no-op.
    pub fn add_reference_as(&mut self, from: &str, input: &str, target: OutputRef) -> Result<()> {
        let idx = self
            .index
            .get(from)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("unit '{}'", from)))?;
        let inputs = &mut self.units[idx].inputs;
        match inputs.get(input) {
            Some(existing) if *existing != target => Err(Error::InvalidInput(format!(
                "input '{}' of unit '{}' already references '{}'",
                input, from, existing
            ))),
            Some(_) => Ok(()),
            None => {
                inputs.insert(input.to_string(), target);
                Ok(())
            }
        }
    }

    pub fn unit(&self, name: &str) -> Option<&ProvisioningUnit> {
        self.position(name).map(|idx| &self.units[idx])
    }

    /// Units in registration order.
    pub fn units(&self) -> &[ProvisioningUnit] {
        &self.units
    }

    /// Registration index of a unit.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Distinct units that `name` references, sorted by name.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.unit(name)
            .map(|u| u.depends_on().into_iter().collect())
            .unwrap_or_default()
    }

    /// Check that every reference resolves and that the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        for unit in &self.units {
            for target in unit.inputs.values() {
                let Some(dep) = self.unit(&target.unit) else {
                    return Err(Error::UnresolvedReference {
                        from: unit.name.clone(),
                        target: target.clone(),
                        reason: format!("no unit named '{}'", target.unit),
                    });
                };
                if !dep.outputs.contains(&target.key) {
                    return Err(Error::UnresolvedReference {
                        from: unit.name.clone(),
                        target: target.clone(),
                        reason: format!(
                            "unit '{}' does not declare output '{}'",
                            dep.name, target.key
                        ),
                    });
                }
            }
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        for unit in &self.units {
            if !marks.contains_key(unit.name.as_str()) {
                if let Some(path) = self.find_cycle(&unit.name, &mut marks, &mut stack) {
                    return Err(Error::Cycle { path });
                }
            }
        }
        Ok(())
    }

    fn find_cycle<'a>(
        &'a self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(name, Mark::InProgress);
        stack.push(name);

        if let Some(unit) = self.unit(name) {
            for dep in unit.depends_on() {
                match marks.get(dep) {
                    Some(Mark::Done) => {}
                    Some(Mark::InProgress) => {
                        let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|n| n.to_string()).collect();
                        path.push(dep.to_string());
                        return Some(path);
                    }
                    None => {
                        if let Some(path) = self.find_cycle(dep, marks, stack) {
                            return Some(path);
                        }
                    }
                }
            }
        }

        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    /// Rebuild the name index, e.g. after deserializing.
    pub fn reindex(&mut self) {
        self.index = self
            .units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.name.clone(), i))
            .collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_cluster() -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph
            .add_unit(ProvisioningUnit::new("Network").with_output("vpcId"))
            .unwrap();
        graph
            .add_unit(ProvisioningUnit::new("Cluster").with_output("clusterName"))
            .unwrap();
        graph.add_reference("Cluster", "Network", "vpcId").unwrap();
        graph
    }

    #[test]
    fn test_valid_graph() {
        let graph = network_cluster();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.dependencies("Cluster"), vec!["Network"]);
        assert!(graph.dependencies("Network").is_empty());
    }

    #[test]
    fn test_output_ref_parse() {
        let r: OutputRef = "Network.vpcId".parse().unwrap();
        assert_eq!(r, OutputRef::new("Network", "vpcId"));
        assert_eq!(r.to_string(), "Network.vpcId");

        assert!("Network".parse::<OutputRef>().is_err());
        assert!(".vpcId".parse::<OutputRef>().is_err());
    }

    #[test]
    fn test_duplicate_unit_rejected() {
        let mut graph = network_cluster();
        let err = graph
            .add_unit(ProvisioningUnit::new("Network"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_reference_from_unknown_unit() {
        let mut graph = network_cluster();
        let err = graph.add_reference("Nope", "Network", "vpcId").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_input_cannot_be_rebound() {
        let mut graph = network_cluster();
        graph
            .add_unit(ProvisioningUnit::new("Peering").with_output("vpcId"))
            .unwrap();

        // Same binding again is accepted
        graph.add_reference("Cluster", "Network", "vpcId").unwrap();

        let err = graph.add_reference("Cluster", "Peering", "vpcId").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(graph.dependencies("Cluster"), vec!["Network"]);
    }

    #[test]
    fn test_unresolved_unit() {
        let mut graph = network_cluster();
        graph.add_reference("Cluster", "Database", "endpoint").unwrap();
        let err = graph.validate().unwrap_err();
        match err {
            Error::UnresolvedReference { from, target, .. } => {
                assert_eq!(from, "Cluster");
                assert_eq!(target, OutputRef::new("Database", "endpoint"));
            }
            other => panic!("expected UnresolvedReference, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_output_key() {
        let mut graph = network_cluster();
        graph.add_reference("Cluster", "Network", "subnetIds").unwrap();
        assert!(matches!(
            graph.validate(),
            Err(Error::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_two_unit_cycle() {
        let mut graph = network_cluster();
        graph.add_reference("Network", "Cluster", "clusterName").unwrap();
        match graph.validate().unwrap_err() {
            Error::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"Network".to_string()));
                assert!(path.contains(&"Cluster".to_string()));
            }
            other => panic!("expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut graph = ResourceGraph::new();
        graph
            .add_unit(ProvisioningUnit::new("Loop").with_output("x"))
            .unwrap();
        graph.add_reference("Loop", "Loop", "x").unwrap();
        match graph.validate().unwrap_err() {
            Error::Cycle { path } => assert_eq!(path, vec!["Loop", "Loop"]),
            other => panic!("expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_transitive_cycle() {
        let mut graph = ResourceGraph::new();
        for name in ["a", "b", "c"] {
            graph
                .add_unit(ProvisioningUnit::new(name).with_output("out"))
                .unwrap();
        }
        graph.add_reference("a", "b", "out").unwrap();
        graph.add_reference("b", "c", "out").unwrap();
        graph.add_reference("c", "a", "out").unwrap();

        match graph.validate().unwrap_err() {
            Error::Cycle { path } => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_reindex_after_deserialize() {
        let graph = network_cluster();
        let json = serde_json::to_string(&graph).unwrap();
        let mut restored: ResourceGraph = serde_json::from_str(&json).unwrap();
        assert!(restored.unit("Cluster").is_none());
        restored.reindex();
        assert!(restored.unit("Cluster").is_some());
        assert!(restored.validate().is_ok());
    }
}
