//! Resource graph configuration parsing.
//!
//! ```kdl
//! unit "Network" source="infra/network" {
//!     output "vpc_id" "subnet_ids"
//! }
//!
//! unit "Cluster" source="infra/cluster" {
//!     input "vpc_id" from="Network.vpc_id"
//!     output "cluster_name"
//! }
//! ```

use convoy_core::stack::{OutputRef, ProvisioningUnit, ResourceGraph};
use kdl::{KdlDocument, KdlNode};

use crate::nodes::{all_string_args, first_string_arg, string_prop, string_props};
use crate::{ConfigError, ConfigResult};

/// Parse and validate a resource graph from KDL text.
pub fn parse_stack(kdl: &str) -> ConfigResult<ResourceGraph> {
    let doc: KdlDocument = kdl.parse()?;
    let graph = graph_from_document(&doc)?;
    graph.validate().map_err(ConfigError::Graph)?;
    Ok(graph)
}

/// Collect every `unit` node of a document, in declaration order.
pub(crate) fn graph_from_document(doc: &KdlDocument) -> ConfigResult<ResourceGraph> {
    let mut graph = ResourceGraph::new();
    for node in doc.nodes().iter().filter(|n| n.name().value() == "unit") {
        let unit = parse_unit(node)?;
        if graph.unit(&unit.name).is_some() {
            return Err(ConfigError::Duplicate(format!("unit '{}'", unit.name)));
        }
        graph.add_unit(unit).map_err(ConfigError::Graph)?;
    }
    Ok(graph)
}

fn parse_unit(node: &KdlNode) -> ConfigResult<ProvisioningUnit> {
    let name =
        first_string_arg(node).ok_or_else(|| ConfigError::MissingField("unit name".to_string()))?;
    let mut unit = ProvisioningUnit::new(&name);

    for (key, value) in string_props(node) {
        unit = unit.with_property(key, value);
    }

    let Some(children) = node.children() else {
        return Ok(unit);
    };

    for child in children.nodes() {
        match child.name().value() {
            "output" => {
                let keys = all_string_args(child);
                if keys.is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "output key in unit '{}'",
                        name
                    )));
                }
                for key in keys {
                    unit = unit.with_output(key);
                }
            }
            "input" => {
                let input = first_string_arg(child).ok_or_else(|| {
                    ConfigError::MissingField(format!("input name in unit '{}'", name))
                })?;
                let from = string_prop(child, "from").ok_or_else(|| {
                    ConfigError::MissingField(format!("from= on input '{}' of unit '{}'", input, name))
                })?;
                let target: OutputRef = from.parse().map_err(|_| {
                    ConfigError::invalid(
                        format!("input '{}' of unit '{}'", input, name),
                        format!("expected Unit.key, got '{}'", from),
                    )
                })?;
                if unit.inputs.contains_key(&input) {
                    return Err(ConfigError::Duplicate(format!(
                        "input '{}' of unit '{}'",
                        input, name
                    )));
                }
                unit = unit.with_input(input, target);
            }
            "property" => match all_string_args(child).as_slice() {
                [key, value] => unit = unit.with_property(key, value),
                _ => {
                    return Err(ConfigError::invalid(
                        format!("property in unit '{}'", name),
                        "expected `property \"key\" \"value\"`",
                    ));
                }
            },
            other => {
                return Err(ConfigError::invalid(
                    format!("unit '{}'", name),
                    format!("unknown node '{}'", other),
                ));
            }
        }
    }

    Ok(unit)
}
