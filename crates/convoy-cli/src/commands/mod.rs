//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use convoy_config::{Orchestration, VariableContext, VariableContextBuilder};
use convoy_core::pipeline::ActionKind;
use std::path::Path;

pub(crate) fn load(path: &Path) -> Result<Orchestration> {
    convoy_config::load_orchestration(path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))
}

pub fn validate(path: &Path) -> Result<()> {
    let orchestration = load(path)?;
    println!(
        "Configuration is valid: {} unit(s), pipeline '{}' with {} stage(s)",
        orchestration.graph.len(),
        orchestration.pipeline.name,
        orchestration.pipeline.stages.len()
    );
    Ok(())
}

pub fn plan(path: &Path, branch: Option<String>, sha: &str) -> Result<()> {
    let orchestration = load(path)?;
    let branch = branch
        .or_else(|| orchestration.pipeline.trigger().map(|t| t.branch))
        .unwrap_or_default();

    let ctx = VariableContextBuilder::new()
        .with_git_branch(branch)
        .with_git_sha(sha)
        .with_pipeline(&orchestration.pipeline.name)
        .build();

    for line in plan_lines(&orchestration, &ctx)? {
        println!("{}", line);
    }
    Ok(())
}

/// Render the provisioning order and the pipeline with variables filled in
/// where they are already known.
fn plan_lines(orchestration: &Orchestration, ctx: &VariableContext) -> Result<Vec<String>> {
    let order = convoy_scheduler::resolve(&orchestration.graph)?;
    let pipeline = &orchestration.pipeline;
    let mut lines = Vec::new();

    lines.push("Provisioning order:".to_string());
    for (i, unit) in order.iter().enumerate() {
        let source = unit.property("source").unwrap_or("-");
        lines.push(format!("  {}. {} ({})", i + 1, unit.name, source));
        for (input, reference) in &unit.inputs {
            lines.push(format!("       {} <- {}", input, reference));
        }
        if !unit.outputs.is_empty() {
            let outputs: Vec<&str> = unit.outputs.iter().map(String::as_str).collect();
            lines.push(format!("       outputs: {}", outputs.join(", ")));
        }
    }

    match pipeline.trigger() {
        Some(trigger) => lines.push(format!(
            "Pipeline '{}' (runs on pushes to {})",
            pipeline.name, trigger.branch
        )),
        None => lines.push(format!("Pipeline '{}'", pipeline.name)),
    }

    for stage in &pipeline.stages {
        lines.push(format!("  {} [{}]", stage.name, stage.kind));
        for action in &stage.actions {
            let detail = match &action.kind {
                ActionKind::Source(src) => format!("{} @ {}", src.repository, src.branch),
                ActionKind::Build(build) => format!(
                    "{} in {}{}",
                    ctx.interpolate(&build.image),
                    build.build_image,
                    if build.privileged { " (privileged)" } else { "" }
                ),
                ActionKind::Deploy(deploy) => {
                    let target = &deploy.target;
                    let namespace = target
                        .namespace
                        .as_deref()
                        .map(|ns| format!(" in {}", ctx.interpolate(ns)))
                        .unwrap_or_default();
                    format!(
                        "{}{}, capacity {}, timeout {}s",
                        ctx.interpolate(&target.service),
                        namespace,
                        target.desired_capacity,
                        deploy.timeout.as_secs()
                    )
                }
            };
            lines.push(format!("    {}: {}", action.name, detail));

            if let ActionKind::Build(build) = &action.kind {
                for command in &build.commands {
                    lines.push(format!("      $ {}", ctx.interpolate(command)));
                }
            }
            if !action.inputs.is_empty() {
                lines.push(format!("      consumes: {}", action.inputs.join(", ")));
            }
            if !action.outputs.is_empty() {
                lines.push(format!("      produces: {}", action.outputs.join(", ")));
            }
        }
    }

    Ok(lines)
}

pub async fn health(url: &str) -> Result<()> {
    let endpoint = format!("{}/health", url.trim_end_matches('/'));
    let response = reqwest::get(&endpoint)
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("Health endpoint did not return JSON")?;

    if status.is_success() && body.get("status").and_then(|s| s.as_str()) == Some("UP") {
        println!("{} is UP", url);
        Ok(())
    } else {
        anyhow::bail!("{} is not healthy ({}): {}", url, status, body);
    }
}
