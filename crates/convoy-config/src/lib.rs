//! KDL configuration parsing for Convoy.
//!
//! This crate handles parsing of:
//! - Provisioning units and their output references
//! - The deployment pipeline
//! - Variable interpolation

pub mod error;
mod nodes;
pub mod pipeline;
pub mod stack;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use variables::{GitContext, VariableContext, VariableContextBuilder};

use convoy_core::pipeline::{ActionKind, Pipeline};
use convoy_core::stack::ResourceGraph;
use kdl::KdlDocument;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Everything a `convoy.kdl` file declares.
#[derive(Debug, Clone, Serialize)]
pub struct Orchestration {
    pub graph: ResourceGraph,
    pub pipeline: Pipeline,
}

/// Parse and validate a complete configuration.
pub fn parse_orchestration(kdl: &str) -> ConfigResult<Orchestration> {
    let doc: KdlDocument = kdl.parse()?;

    let graph = stack::graph_from_document(&doc)?;
    let pipeline = pipeline::pipeline_from_document(&doc)?;

    graph.validate().map_err(ConfigError::Graph)?;
    pipeline.validate().map_err(ConfigError::Pipeline)?;
    check_unit_variables(&graph, &pipeline)?;

    Ok(Orchestration { graph, pipeline })
}

/// Read and parse a configuration file.
pub fn load_orchestration(path: impl AsRef<Path>) -> ConfigResult<Orchestration> {
    let text = std::fs::read_to_string(path)?;
    parse_orchestration(&text)
}

/// `${units.U.k}` in action settings must name a declared output.
fn check_unit_variables(graph: &ResourceGraph, pipeline: &Pipeline) -> ConfigResult<()> {
    for action in pipeline.stages.iter().flat_map(|s| s.actions.iter()) {
        let fields: Vec<&str> = match &action.kind {
            ActionKind::Source(_) => Vec::new(),
            ActionKind::Build(build) => std::iter::once(build.image.as_str())
                .chain(build.commands.iter().map(String::as_str))
                .chain(build.env.values().map(String::as_str))
                .collect(),
            ActionKind::Deploy(deploy) => std::iter::once(deploy.target.service.as_str())
                .chain(deploy.target.namespace.as_deref())
                .chain(deploy.target.container.as_deref())
                .collect(),
        };

        for reference in fields.into_iter().flat_map(variables::unit_references) {
            let declared = graph
                .unit(&reference.unit)
                .is_some_and(|u| u.outputs.contains(&reference.key));
            if !declared {
                return Err(ConfigError::InvalidReference(format!(
                    "action '{}' uses ${{units.{}}}, which no unit declares",
                    action.name, reference
                )));
            }
        }
    }
    Ok(())
}

/// Parse a duration such as `"30s"`, `"10m"`, `"1h"` or `"90"` (seconds).
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let s = input.trim();
    let invalid = || {
        ConfigError::invalid(
            "duration",
            format!("expected e.g. \"30s\", \"10m\" or \"1h\", got \"{}\"", input),
        )
    };

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(invalid()),
    };
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONVOY_KDL: &str = r#"
        unit "Network" source="infra/network" {
            output "vpc_id"
        }

        unit "Cluster" source="infra/cluster" {
            input "vpc_id" from="Network.vpc_id"
            output "cluster_name"
        }

        pipeline "sdlc-automation" {
            stage "Source" {
                action "Checkout" {
                    output "SourceArtifact"
                    repository "https://git.example.com/sdlc-automation.git"
                    branch "main"
                }
            }
            stage "Build" {
                action "Image" {
                    input "SourceArtifact"
                    output "BuildArtifact"
                    build-image "docker:27-cli"
                    image "sdlc-automation:${git.short_sha}"
                }
            }
            stage "Deploy" {
                action "Rollout" {
                    input "BuildArtifact"
                    service "sdlc-automation"
                    namespace "${units.Cluster.cluster_name}"
                }
            }
        }
    "#;

    #[test]
    fn test_parse_orchestration() {
        let orchestration = parse_orchestration(CONVOY_KDL).unwrap();
        assert_eq!(orchestration.graph.len(), 2);
        assert_eq!(orchestration.pipeline.name, "sdlc-automation");
    }

    #[test]
    fn test_pipeline_wiring_checked() {
        let kdl = CONVOY_KDL.replace(r#"input "BuildArtifact""#, r#"input "Missing""#);
        match parse_orchestration(&kdl) {
            Err(ConfigError::Pipeline(convoy_core::Error::ArtifactNotFound { artifact, .. })) => {
                assert_eq!(artifact, "Missing");
            }
            other => panic!("expected ArtifactNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_graph_checked() {
        let kdl = CONVOY_KDL.replace("Network.vpc_id", "Network.subnet_id");
        assert!(matches!(
            parse_orchestration(&kdl),
            Err(ConfigError::Graph(convoy_core::Error::UnresolvedReference { .. }))
        ));
    }

    #[test]
    fn test_error_messages_name_their_source() {
        let graph = parse_orchestration(&CONVOY_KDL.replace("Network.vpc_id", "Network.subnet_id"))
            .unwrap_err();
        assert!(graph.to_string().starts_with("invalid resource graph"));

        let pipeline = parse_orchestration(
            &CONVOY_KDL.replace(r#"input "BuildArtifact""#, r#"input "Missing""#),
        )
        .unwrap_err();
        assert!(pipeline.to_string().starts_with("invalid pipeline"));
    }

    #[test]
    fn test_unknown_unit_variable() {
        let kdl = CONVOY_KDL.replace("units.Cluster.cluster_name", "units.Cluster.name");
        assert!(matches!(
            parse_orchestration(&kdl),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
    }
}
