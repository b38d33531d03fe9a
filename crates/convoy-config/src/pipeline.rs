//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "sdlc-automation" {
//!     stage "Source" {
//!         action "Checkout" {
//!             output "SourceArtifact"
//!             repository "https://git.example.com/sdlc-automation.git"
//!             branch "main"
//!         }
//!     }
//!     stage "Build" {
//!         action "Image" {
//!             input "SourceArtifact"
//!             output "BuildArtifact"
//!             build-image "docker:27-cli"
//!             privileged #true
//!             image "sdlc-automation:${git.short_sha}"
//!             run "docker build -t $IMAGE_REPO_NAME:$IMAGE_TAG ."
//!         }
//!     }
//!     stage "Deploy" {
//!         action "Rollout" {
//!             input "BuildArtifact"
//!             service "sdlc-automation"
//!             timeout "10m"
//!         }
//!     }
//! }
//! ```
//!
//! A stage's kind comes from its `kind=` property, or from its name when
//! that is one of `Source`, `Build` or `Deploy`. Actions take the kind of
//! their stage.

use convoy_core::deployer::{DeploymentTarget, HealthCheck};
use convoy_core::pipeline::{
    Action, ActionKind, BuildAction, DeployAction, Pipeline, SourceAction, Stage, StageKind,
};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashMap;

use crate::nodes::{
    all_string_args, duration_value, first_arg, first_string_arg, flag, required_string_arg,
    string_prop, u16_value, u32_value,
};
use crate::{ConfigError, ConfigResult};

/// Parse a pipeline configuration from KDL text. Wiring is not validated here.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;
    pipeline_from_document(&doc)
}

/// The single `pipeline` node of a document.
pub(crate) fn pipeline_from_document(doc: &KdlDocument) -> ConfigResult<Pipeline> {
    let mut nodes = doc
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "pipeline");

    let node = nodes
        .next()
        .ok_or_else(|| ConfigError::MissingField("pipeline".to_string()))?;
    if nodes.next().is_some() {
        return Err(ConfigError::Duplicate(
            "only one pipeline may be defined".to_string(),
        ));
    }

    parse_pipeline_node(node)
}

fn parse_pipeline_node(node: &KdlNode) -> ConfigResult<Pipeline> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;

    let mut stages = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "stage" => stages.push(parse_stage(child)?),
                other => {
                    return Err(ConfigError::invalid(
                        format!("pipeline '{}'", name),
                        format!("unknown node '{}'", other),
                    ));
                }
            }
        }
    }

    Ok(Pipeline { name, stages })
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let kind_name = string_prop(node, "kind").unwrap_or_else(|| name.clone());
    let kind: StageKind = kind_name.parse().map_err(|_| {
        ConfigError::invalid(
            format!("kind of stage '{}'", name),
            format!("expected source, build or deploy, got '{}'", kind_name),
        )
    })?;

    let mut actions = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "action" => actions.push(parse_action(child, kind)?),
                other => {
                    return Err(ConfigError::invalid(
                        format!("stage '{}'", name),
                        format!("unknown node '{}'", other),
                    ));
                }
            }
        }
    }

    Ok(Stage {
        name,
        kind,
        actions,
    })
}

fn parse_action(node: &KdlNode, kind: StageKind) -> ConfigResult<Action> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("action name".to_string()))?;

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut settings = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "input" => inputs.extend(all_string_args(child)),
                "output" => outputs.extend(all_string_args(child)),
                _ => settings.push(child),
            }
        }
    }

    let kind = match kind {
        StageKind::Source => ActionKind::Source(parse_source(&name, &settings)?),
        StageKind::Build => ActionKind::Build(parse_build(&name, &settings)?),
        StageKind::Deploy => ActionKind::Deploy(Box::new(parse_deploy(&name, &settings)?)),
    };

    Ok(Action {
        name,
        inputs,
        outputs,
        kind,
    })
}

fn unknown_setting(action: &str, node: &KdlNode) -> ConfigError {
    ConfigError::invalid(
        format!("action '{}'", action),
        format!("unknown setting '{}'", node.name().value()),
    )
}

fn parse_source(action: &str, settings: &[&KdlNode]) -> ConfigResult<SourceAction> {
    let mut repository = None;
    let mut branch = None;

    for node in settings {
        match node.name().value() {
            "repository" => repository = Some(required_string_arg(node, "repository")?),
            "branch" => branch = Some(required_string_arg(node, "branch")?),
            _ => return Err(unknown_setting(action, node)),
        }
    }

    Ok(SourceAction {
        repository: repository
            .ok_or_else(|| ConfigError::MissingField(format!("repository for action '{}'", action)))?,
        branch: branch
            .ok_or_else(|| ConfigError::MissingField(format!("branch for action '{}'", action)))?,
    })
}

fn parse_build(action: &str, settings: &[&KdlNode]) -> ConfigResult<BuildAction> {
    let mut build_image = None;
    let mut image = None;
    let mut commands = Vec::new();
    let mut env = HashMap::new();
    let mut privileged = false;

    for node in settings {
        match node.name().value() {
            "build-image" => build_image = Some(required_string_arg(node, "build-image")?),
            "image" => image = Some(required_string_arg(node, "image")?),
            "run" => commands.push(required_string_arg(node, "run")?),
            "privileged" => privileged = flag(node)?,
            "env" => {
                if let Some(vars) = node.children() {
                    for var in vars.nodes() {
                        let key = var.name().value().to_string();
                        let value = first_string_arg(var).ok_or_else(|| {
                            ConfigError::invalid(
                                format!("env {} of action '{}'", key, action),
                                "expected a string value",
                            )
                        })?;
                        env.insert(key, value);
                    }
                }
            }
            _ => return Err(unknown_setting(action, node)),
        }
    }

    Ok(BuildAction {
        build_image: build_image
            .ok_or_else(|| ConfigError::MissingField(format!("build-image for action '{}'", action)))?,
        commands,
        env,
        privileged,
        image: image
            .ok_or_else(|| ConfigError::MissingField(format!("image for action '{}'", action)))?,
    })
}

fn parse_deploy(action: &str, settings: &[&KdlNode]) -> ConfigResult<DeployAction> {
    let mut service = None;
    let mut namespace = None;
    let mut container = None;
    let mut capacity = 0;
    let mut timeout = None;
    let mut health_check = HealthCheck::default();

    for node in settings {
        match node.name().value() {
            "service" => service = Some(required_string_arg(node, "service")?),
            "namespace" => namespace = Some(required_string_arg(node, "namespace")?),
            "container" => container = Some(required_string_arg(node, "container")?),
            "capacity" => {
                let value = first_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("capacity value".to_string()))?;
                capacity = u32_value(value, "capacity")?;
            }
            "timeout" => {
                let value = first_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("timeout value".to_string()))?;
                timeout = Some(duration_value(value, "timeout")?);
            }
            "health-check" => health_check = parse_health_check(node)?,
            _ => return Err(unknown_setting(action, node)),
        }
    }

    let service = service
        .ok_or_else(|| ConfigError::MissingField(format!("service for action '{}'", action)))?;

    let mut target = DeploymentTarget::new(service);
    target.namespace = namespace;
    target.container = container;
    target.desired_capacity = capacity;
    target.health_check = health_check;

    let mut deploy = DeployAction::new(target);
    if let Some(timeout) = timeout {
        deploy.timeout = timeout;
    }
    Ok(deploy)
}

/// `health-check path="/health" port=80 interval="30s" retries=3 start-period="60s" timeout="30s"`
fn parse_health_check(node: &KdlNode) -> ConfigResult<HealthCheck> {
    let mut hc = HealthCheck::default();

    for entry in node.entries() {
        let Some(name) = entry.name() else { continue };
        let value = entry.value();
        match name.value() {
            "path" => {
                hc.path = value
                    .as_string()
                    .ok_or_else(|| ConfigError::invalid("health-check path", "expected a string"))?
                    .to_string();
            }
            "port" => hc.port = u16_value(value, "health-check port")?,
            "interval" => hc.interval = duration_value(value, "health-check interval")?,
            "retries" => hc.retries = u32_value(value, "health-check retries")?,
            "start-period" => hc.start_period = duration_value(value, "health-check start-period")?,
            "timeout" => hc.timeout = duration_value(value, "health-check timeout")?,
            other => {
                return Err(ConfigError::invalid(
                    "health-check",
                    format!("unknown property '{}'", other),
                ));
            }
        }
    }

    Ok(hc)
}
