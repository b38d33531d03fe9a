//! Convoy webhook server

use anyhow::Context;
use clap::Parser;
use convoy_api::{AppState, routes};
use convoy_deployer::KubernetesDeployer;
use convoy_executor::{DockerBuilder, GitSource};
use convoy_provisioner::TerraformProvider;
use convoy_scheduler::{Orchestrator, PipelineEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoy-server")]
#[command(about = "Runs the Convoy pipeline when its source branch is pushed")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(long, env = "CONVOY_CONFIG", default_value = "convoy.kdl")]
    config: PathBuf,

    /// Address to listen on
    #[arg(long, env = "CONVOY_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Secret used to verify webhook signatures
    #[arg(long, env = "CONVOY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Directory for source checkouts
    #[arg(long, env = "CONVOY_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Namespace of deployments that do not name one
    #[arg(long, env = "CONVOY_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Terraform binary
    #[arg(long, env = "TERRAFORM_BIN", default_value = "terraform")]
    terraform_bin: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let orchestration = convoy_config::load_orchestration(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        pipeline = %orchestration.pipeline.name,
        units = orchestration.graph.len(),
        "Configuration loaded"
    );

    // Unit sources are relative to the configuration file
    let root = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let provider = TerraformProvider::new(&args.terraform_bin, root);

    let source = match &args.work_dir {
        Some(dir) => GitSource::new(dir),
        None => GitSource::default(),
    };
    let builder = DockerBuilder::new().context("connecting to Docker")?;
    let deployer = KubernetesDeployer::new(&args.namespace)
        .await
        .context("connecting to Kubernetes")?;

    let engine = PipelineEngine::new(Arc::new(source), Arc::new(builder), Arc::new(deployer));
    let orchestrator = Orchestrator::new(Arc::new(provider), engine).with_process_env();

    let state = AppState::new(orchestration, orchestrator).with_webhook_secret(args.webhook_secret);
    if state.webhook_secret.is_none() {
        info!("No webhook secret configured, signatures are not checked");
    }

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    info!("Starting server on {}", args.listen);
    let listener = TcpListener::bind(args.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
