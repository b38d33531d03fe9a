//! Pipeline engine - runs Source, Build and Deploy in order.

use convoy_config::{VariableContext, VariableContextBuilder};
use convoy_core::RunId;
use convoy_core::artifact::{Artifact, ArtifactChannel, ArtifactPayload};
use convoy_core::builder::{
    BuildRequest, Builder, ImageRef, SourceProvider, SourceRequest, SourceSnapshot,
};
use convoy_core::deployer::{DeployOutcome, Deployer, DeploymentTarget};
use convoy_core::pipeline::{
    Action, ActionKind, BuildAction, DeployAction, Pipeline, PipelinePhase, SourceAction, Stage,
    StageState,
};
use convoy_core::repository::PushEvent;
use convoy_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::monitor::DeploymentMonitor;
use crate::resolver::StackOutputs;

/// Per-run state handed to the engine. A fresh one is built for every run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    /// The push that triggered this run.
    pub push: PushEvent,
    pub variables: VariableContext,
}

impl RunContext {
    pub fn new(push: PushEvent) -> Self {
        let run_id = RunId::new();
        let variables = VariableContextBuilder::new()
            .with_push(&push)
            .with_run(run_id.to_string())
            .build();
        Self {
            run_id,
            push,
            variables,
        }
    }

    /// Make provisioned unit outputs available as `${units.U.k}`.
    pub fn with_stack_outputs(mut self, stack: &StackOutputs) -> Self {
        for unit in stack.units() {
            self.variables
                .units
                .insert(unit.name.clone(), unit.outputs.clone());
        }
        self
    }

    pub fn with_process_env(mut self) -> Self {
        self.variables.populate_env();
        self
    }
}

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PhaseChanged {
        phase: PipelinePhase,
    },
    ActionStarted {
        stage: String,
        action: String,
    },
    ArtifactProduced {
        stage: String,
        artifact: String,
    },
    ActionCompleted {
        stage: String,
        action: String,
    },
    PipelineCompleted {
        phase: PipelinePhase,
    },
}

/// Where and why a run stopped.
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// `None` when the pipeline was rejected before any stage ran.
    pub stage: Option<String>,
    pub action: Option<String>,
    pub error: Error,
}

/// Result of a pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub phase: PipelinePhase,
    /// Every phase the run went through, starting with `Pending`.
    pub history: Vec<PipelinePhase>,
    /// Artifacts produced during the run, in production order.
    pub artifacts: Vec<Arc<Artifact>>,
    /// Outcome of the deploy action, if it ran.
    pub deployment: Option<DeployOutcome>,
    pub failure: Option<StageFailure>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.phase.is_success()
    }

    /// Whether the run ever reached `phase`.
    pub fn reached(&self, phase: PipelinePhase) -> bool {
        self.history.contains(&phase)
    }
}

/// How an action stopped the run.
struct ActionFailure {
    state: StageState,
    error: Error,
}

impl From<Error> for ActionFailure {
    fn from(error: Error) -> Self {
        ActionFailure {
            state: StageState::Failed,
            error,
        }
    }
}

/// Event sink; runs without a listener emit nothing.
struct Events(Option<mpsc::Sender<PipelineEvent>>);

impl Events {
    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event).await;
        }
    }
}

/// Mutable bookkeeping of one run.
struct RunState {
    result: PipelineResult,
    events: Events,
}

impl RunState {
    async fn transition(&mut self, phase: PipelinePhase) {
        info!(run_id = %self.result.run_id, %phase, "Pipeline phase changed");
        self.result.phase = phase;
        self.result.history.push(phase);
        self.events.emit(PipelineEvent::PhaseChanged { phase }).await;
    }

    async fn finish(self) -> PipelineResult {
        let RunState { result, events } = self;
        events
            .emit(PipelineEvent::PipelineCompleted {
                phase: result.phase,
            })
            .await;
        result
    }
}

/// Executes pipelines. Holds no per-run state.
#[derive(Clone)]
pub struct PipelineEngine {
    source: Arc<dyn SourceProvider>,
    builder: Arc<dyn Builder>,
    deployer: Arc<dyn Deployer>,
    monitor: DeploymentMonitor,
}

impl PipelineEngine {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        builder: Arc<dyn Builder>,
        deployer: Arc<dyn Deployer>,
    ) -> Self {
        Self {
            source,
            builder,
            deployer,
            monitor: DeploymentMonitor::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: DeploymentMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Execute a pipeline on a background task, returning a channel of events
    /// and a handle to get the final result.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        ctx: RunContext,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let engine = self.clone();
        let pipeline = pipeline.clone();

        let handle = tokio::spawn(async move { engine.run_with_events(&pipeline, ctx, tx).await });

        (rx, handle)
    }

    /// Run a pipeline to completion.
    pub async fn run(&self, pipeline: &Pipeline, ctx: RunContext) -> PipelineResult {
        self.run_inner(pipeline, ctx, Events(None)).await
    }

    /// Run a pipeline to completion, reporting progress on `tx`.
    pub async fn run_with_events(
        &self,
        pipeline: &Pipeline,
        ctx: RunContext,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        self.run_inner(pipeline, ctx, Events(Some(tx))).await
    }

    async fn run_inner(&self, pipeline: &Pipeline, ctx: RunContext, events: Events) -> PipelineResult {
        let result = self.run_stages(pipeline, ctx, events).await;
        self.release_sources(&result).await;
        result
    }

    /// Checkouts are only needed while the run is in flight.
    async fn release_sources(&self, result: &PipelineResult) {
        for snapshot in result.artifacts.iter().filter_map(|a| a.as_source()) {
            if let Err(e) = self.source.release(snapshot).await {
                warn!(run_id = %result.run_id, path = %snapshot.path.display(), error = %e, "Failed to release source snapshot");
            }
        }
    }

    async fn run_stages(
        &self,
        pipeline: &Pipeline,
        mut ctx: RunContext,
        events: Events,
    ) -> PipelineResult {
        ctx.variables.pipeline_name = pipeline.name.clone();

        let mut run = RunState {
            result: PipelineResult {
                run_id: ctx.run_id,
                phase: PipelinePhase::Pending,
                history: vec![PipelinePhase::Pending],
                artifacts: Vec::new(),
                deployment: None,
                failure: None,
            },
            events,
        };

        info!(run_id = %ctx.run_id, pipeline = %pipeline.name, commit = %ctx.push.after, "Starting pipeline run");

        let channel = pipeline
            .validate()
            .and_then(|()| ArtifactChannel::for_pipeline(pipeline));
        let mut channel = match channel {
            Ok(channel) => channel,
            Err(e) => {
                error!(run_id = %ctx.run_id, pipeline = %pipeline.name, error = %e, "Pipeline rejected");
                run.result.failure = Some(StageFailure {
                    stage: None,
                    action: None,
                    error: e,
                });
                return run.finish().await;
            }
        };

        for stage in &pipeline.stages {
            run.transition(PipelinePhase::stage(stage.kind, StageState::Running))
                .await;

            for action in &stage.actions {
                run.events
                    .emit(PipelineEvent::ActionStarted {
                        stage: stage.name.clone(),
                        action: action.name.clone(),
                    })
                    .await;
                info!(stage = %stage.name, action = %action.name, "Running action");

                match self
                    .run_action(stage, action, &mut channel, &mut ctx, &mut run)
                    .await
                {
                    Ok(()) => {
                        run.events
                            .emit(PipelineEvent::ActionCompleted {
                                stage: stage.name.clone(),
                                action: action.name.clone(),
                            })
                            .await;
                    }
                    Err(failure) => {
                        error!(stage = %stage.name, action = %action.name, error = %failure.error, "Action failed");
                        run.result.failure = Some(StageFailure {
                            stage: Some(stage.name.clone()),
                            action: Some(action.name.clone()),
                            error: failure.error,
                        });
                        run.transition(PipelinePhase::stage(stage.kind, failure.state))
                            .await;
                        return run.finish().await;
                    }
                }
            }

            if let Err(e) = channel.complete_stage(&stage.name) {
                run.result.failure = Some(StageFailure {
                    stage: Some(stage.name.clone()),
                    action: None,
                    error: e,
                });
                run.transition(PipelinePhase::stage(stage.kind, StageState::Failed))
                    .await;
                return run.finish().await;
            }
            let dropped = channel.prune();
            if !dropped.is_empty() {
                debug!(stage = %stage.name, ?dropped, "Dropped consumed artifacts");
            }

            run.transition(PipelinePhase::stage(stage.kind, StageState::Done))
                .await;
        }

        info!(run_id = %ctx.run_id, pipeline = %pipeline.name, "Pipeline run succeeded");
        run.finish().await
    }

    async fn run_action(
        &self,
        stage: &Stage,
        action: &Action,
        channel: &mut ArtifactChannel,
        ctx: &mut RunContext,
        run: &mut RunState,
    ) -> std::result::Result<(), ActionFailure> {
        match &action.kind {
            ActionKind::Source(source) => {
                let snapshot = self.fetch_source(source, ctx).await?;
                // A push without a commit builds whatever the branch head was.
                let git = &mut ctx.variables.git;
                if git.sha.is_empty() {
                    git.sha = snapshot.commit.clone();
                    git.short_sha = snapshot.short_commit().to_string();
                }
                if git.branch.is_empty() {
                    git.branch = snapshot.branch.clone();
                }
                let output = single(&action.outputs, action)?;
                let artifact = channel.produce(&stage.name, output, ArtifactPayload::Source(snapshot))?;
                record(run, stage, artifact).await;
                Ok(())
            }
            ActionKind::Build(build) => {
                let input = channel.consume(&stage.name, single(&action.inputs, action)?)?;
                let image = self.build_image(build, &input, ctx).await?;
                let output = single(&action.outputs, action)?;
                let artifact = channel.produce(&stage.name, output, ArtifactPayload::Image(image))?;
                record(run, stage, artifact).await;
                Ok(())
            }
            ActionKind::Deploy(deploy) => {
                let input = channel.consume(&stage.name, single(&action.inputs, action)?)?;
                self.deploy(deploy, &input, ctx, run).await
            }
        }
    }

    async fn fetch_source(&self, source: &SourceAction, ctx: &RunContext) -> Result<SourceSnapshot> {
        // Pin the pushed commit when the push was to this branch.
        let commit = (ctx.push.branch.as_deref() == Some(source.branch.as_str())
            && !ctx.push.after.is_empty())
        .then(|| ctx.push.after.clone());

        let request = SourceRequest {
            run_id: ctx.run_id,
            repository: source.repository.clone(),
            branch: source.branch.clone(),
            commit,
        };

        info!(provider = self.source.name(), repository = %request.repository, branch = %request.branch, "Fetching source");
        self.source.fetch(&request).await
    }

    async fn build_image(
        &self,
        build: &BuildAction,
        input: &Artifact,
        ctx: &RunContext,
    ) -> Result<ImageRef> {
        let source = input.as_source().cloned().ok_or_else(|| {
            Error::InvalidInput(format!("artifact '{}' is not a source snapshot", input.name()))
        })?;

        let vars = &ctx.variables;
        let output: ImageRef = interpolate(vars, &build.image)?.parse()?;
        let commands = build
            .commands
            .iter()
            .map(|c| interpolate(vars, c))
            .collect::<Result<Vec<_>>>()?;
        let env = vars
            .try_interpolate_map(&build.env)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let request = BuildRequest {
            run_id: ctx.run_id,
            source,
            build_image: build.build_image.clone(),
            commands,
            env,
            privileged: build.privileged,
            output,
        };

        info!(builder = self.builder.name(), image = %request.output, commit = %request.source.short_commit(), "Building image");
        self.builder.build(request).await.map_err(|e| match e {
            Error::Build(_) => e,
            other => Error::Build(other.to_string()),
        })
    }

    async fn deploy(
        &self,
        deploy: &DeployAction,
        input: &Artifact,
        ctx: &RunContext,
        run: &mut RunState,
    ) -> std::result::Result<(), ActionFailure> {
        let target = interpolate_target(&ctx.variables, &deploy.target)?;

        let outcome = self
            .monitor
            .deploy(self.deployer.as_ref(), &target, input, deploy.timeout)
            .await;
        run.result.deployment = Some(outcome.clone());

        match outcome {
            DeployOutcome::Done { .. } => Ok(()),
            DeployOutcome::Failed { message } => Err(ActionFailure {
                state: StageState::Failed,
                error: Error::DeployFailed {
                    service: target.service,
                    message,
                },
            }),
            DeployOutcome::TimedOut { budget, .. } => Err(ActionFailure {
                state: StageState::TimedOut,
                error: Error::DeployTimedOut {
                    service: target.service,
                    budget,
                },
            }),
        }
    }
}

async fn record(run: &mut RunState, stage: &Stage, artifact: Arc<Artifact>) {
    info!(stage = %stage.name, artifact = %artifact.name(), "Artifact produced");
    run.events
        .emit(PipelineEvent::ArtifactProduced {
            stage: stage.name.clone(),
            artifact: artifact.name().to_string(),
        })
        .await;
    run.result.artifacts.push(artifact);
}

/// The one declared input or output of an action.
fn single<'a>(names: &'a [String], action: &Action) -> Result<&'a str> {
    match names {
        [name] => Ok(name),
        _ => Err(Error::InvalidInput(format!(
            "action '{}' must declare exactly one artifact here, found {}",
            action.name,
            names.len()
        ))),
    }
}

fn interpolate(vars: &VariableContext, input: &str) -> Result<String> {
    vars.try_interpolate(input)
        .map_err(|e| Error::InvalidInput(e.to_string()))
}

fn interpolate_target(vars: &VariableContext, target: &DeploymentTarget) -> Result<DeploymentTarget> {
    let mut target = target.clone();
    target.service = interpolate(vars, &target.service)?;
    target.namespace = target
        .namespace
        .map(|ns| interpolate(vars, &ns))
        .transpose()?;
    target.container = target
        .container
        .map(|c| interpolate(vars, &c))
        .transpose()?;
    Ok(target)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::monitor::tests::MockDeployer;
    use convoy_core::pipeline::{StageKind, Trigger};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct MockSource {
        pub requests: Mutex<Vec<SourceRequest>>,
        pub released: Mutex<Vec<SourceSnapshot>>,
    }

    #[async_trait::async_trait]
    impl SourceProvider for MockSource {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn fetch(&self, request: &SourceRequest) -> Result<SourceSnapshot> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(SourceSnapshot {
                repository: request.repository.clone(),
                branch: request.branch.clone(),
                commit: request
                    .commit
                    .clone()
                    .unwrap_or_else(|| "0000000000000000".to_string()),
                path: PathBuf::from("/tmp/convoy/src"),
            })
        }

        async fn release(&self, snapshot: &SourceSnapshot) -> Result<()> {
            self.released.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct MockBuilder {
        pub fail: bool,
        pub requests: Mutex<Vec<BuildRequest>>,
    }

    #[async_trait::async_trait]
    impl Builder for MockBuilder {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn build(&self, request: BuildRequest) -> Result<ImageRef> {
            let output = request.output.clone();
            self.requests.lock().unwrap().push(request);
            if self.fail {
                return Err(Error::ExecutionFailed("exit code 2".into()));
            }
            Ok(output)
        }
    }

    fn action(name: &str, kind: ActionKind, inputs: &[&str], outputs: &[&str]) -> Action {
        Action {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            kind,
        }
    }

    pub(crate) fn sdlc_pipeline(timeout: Duration) -> Pipeline {
        let mut target = DeploymentTarget::new("sdlc-automation");
        target.desired_capacity = 1;
        target.namespace = Some("${units.Cluster.cluster_name}".into());
        let mut deploy = DeployAction::new(target);
        deploy.timeout = timeout;

        let mut env = HashMap::new();
        env.insert("COMMIT".to_string(), "${git.sha}".to_string());

        Pipeline {
            name: "sdlc-automation".into(),
            stages: vec![
                Stage {
                    name: "Source".into(),
                    kind: StageKind::Source,
                    actions: vec![action(
                        "Checkout",
                        ActionKind::Source(SourceAction {
                            repository: "https://git.example.com/sdlc-automation.git".into(),
                            branch: "main".into(),
                        }),
                        &[],
                        &["SourceArtifact"],
                    )],
                },
                Stage {
                    name: "Build".into(),
                    kind: StageKind::Build,
                    actions: vec![action(
                        "Image",
                        ActionKind::Build(BuildAction {
                            build_image: "docker:27-cli".into(),
                            commands: vec!["docker build -t ${git.short_sha} .".into()],
                            env,
                            privileged: true,
                            image: "sdlc-automation:${git.short_sha}".into(),
                        }),
                        &["SourceArtifact"],
                        &["BuildArtifact"],
                    )],
                },
                Stage {
                    name: "Deploy".into(),
                    kind: StageKind::Deploy,
                    actions: vec![action(
                        "Rollout",
                        ActionKind::Deploy(Box::new(deploy)),
                        &["BuildArtifact"],
                        &[],
                    )],
                },
            ],
        }
    }

    pub(crate) fn context() -> RunContext {
        let mut outputs = convoy_core::stack::Outputs::new();
        outputs.insert("cluster_name".into(), "prod".into());
        let mut stack = StackOutputs::new();
        stack.push_unit("Cluster", outputs);
        RunContext::new(PushEvent::for_branch(
            "acme/sdlc-automation",
            "main",
            "9f1c2e7d8a4b3c6e",
        ))
        .with_stack_outputs(&stack)
    }

    struct Fixture {
        source: Arc<MockSource>,
        builder: Arc<MockBuilder>,
        deployer: Arc<MockDeployer>,
        engine: PipelineEngine,
    }

    fn fixture(builder: MockBuilder, deployer: MockDeployer) -> Fixture {
        let source = Arc::new(MockSource::default());
        let builder = Arc::new(builder);
        let deployer = Arc::new(deployer);
        let engine = PipelineEngine::new(source.clone(), builder.clone(), deployer.clone());
        Fixture {
            source,
            builder,
            deployer,
            engine,
        }
    }

    fn phase(kind: StageKind, state: StageState) -> PipelinePhase {
        PipelinePhase::stage(kind, state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run() {
        let f = fixture(
            MockBuilder::default(),
            MockDeployer::ready_after(Duration::from_secs(60)),
        );
        let result = f
            .engine
            .run(&sdlc_pipeline(Duration::from_secs(600)), context())
            .await;

        assert!(result.is_success(), "failure: {:?}", result.failure);
        assert_eq!(
            result.history,
            vec![
                PipelinePhase::Pending,
                phase(StageKind::Source, StageState::Running),
                phase(StageKind::Source, StageState::Done),
                phase(StageKind::Build, StageState::Running),
                phase(StageKind::Build, StageState::Done),
                phase(StageKind::Deploy, StageState::Running),
                phase(StageKind::Deploy, StageState::Done),
            ]
        );
        let names: Vec<&str> = result.artifacts.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["SourceArtifact", "BuildArtifact"]);

        // The pushed commit is pinned and variables are interpolated.
        let fetched = f.source.requests.lock().unwrap();
        assert_eq!(fetched[0].commit.as_deref(), Some("9f1c2e7d8a4b3c6e"));
        let built = f.builder.requests.lock().unwrap();
        assert_eq!(built[0].output, ImageRef::new("sdlc-automation", "9f1c2e7"));
        assert_eq!(built[0].env["COMMIT"], "9f1c2e7d8a4b3c6e");
        assert_eq!(built[0].commands[0], "docker build -t 9f1c2e7 .");
        assert_eq!(
            *f.deployer.images.lock().unwrap(),
            vec!["sdlc-automation:9f1c2e7"]
        );
        assert_eq!(f.source.released.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_without_commit_builds_branch_head() {
        let f = fixture(MockBuilder::default(), MockDeployer::ready_after(Duration::ZERO));
        let ctx = RunContext::new(PushEvent::for_branch("acme/sdlc-automation", "main", ""));
        let mut pipeline = sdlc_pipeline(Duration::from_secs(600));
        pipeline.stages[2].actions[0].kind = ActionKind::Deploy(Box::new(DeployAction::new(
            DeploymentTarget::new("sdlc-automation"),
        )));

        let result = f.engine.run(&pipeline, ctx).await;

        assert!(result.is_success(), "failure: {:?}", result.failure);
        assert_eq!(f.source.requests.lock().unwrap()[0].commit, None);
        let built = f.builder.requests.lock().unwrap();
        assert_eq!(built[0].output, ImageRef::new("sdlc-automation", "0000000"));
        assert_eq!(built[0].env["COMMIT"], "0000000000000000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_never_starts_deploy() {
        let f = fixture(
            MockBuilder {
                fail: true,
                ..Default::default()
            },
            MockDeployer::ready_after(Duration::ZERO),
        );
        let result = f
            .engine
            .run(&sdlc_pipeline(Duration::from_secs(600)), context())
            .await;

        assert_eq!(result.phase, phase(StageKind::Build, StageState::Failed));
        assert!(!result.reached(phase(StageKind::Deploy, StageState::Running)));
        assert!(f.deployer.images.lock().unwrap().is_empty());

        let failure = result.failure.unwrap();
        assert_eq!(failure.stage.as_deref(), Some("Build"));
        assert_eq!(failure.action.as_deref(), Some("Image"));
        assert!(matches!(failure.error, Error::Build(_)));

        // The checkout is discarded even though the run failed
        let released = f.source.released.lock().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].commit, "9f1c2e7d8a4b3c6e");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_rollout_times_out() {
        let f = fixture(
            MockBuilder::default(),
            MockDeployer::ready_after(Duration::from_secs(11 * 60)),
        );
        let result = f
            .engine
            .run(&sdlc_pipeline(Duration::from_secs(10 * 60)), context())
            .await;

        assert_eq!(result.phase, phase(StageKind::Deploy, StageState::TimedOut));
        assert!(!result.reached(phase(StageKind::Deploy, StageState::Failed)));
        assert!(matches!(
            result.failure.unwrap().error,
            Error::DeployTimedOut { .. }
        ));
        assert!(matches!(
            result.deployment,
            Some(DeployOutcome::TimedOut { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_plane_failure_is_failed() {
        let mut deployer = MockDeployer::ready_after(Duration::ZERO);
        deployer.fail_with = Some("ProgressDeadlineExceeded".into());
        let f = fixture(MockBuilder::default(), deployer);
        let result = f
            .engine
            .run(&sdlc_pipeline(Duration::from_secs(600)), context())
            .await;

        assert_eq!(result.phase, phase(StageKind::Deploy, StageState::Failed));
        assert!(matches!(
            result.failure.unwrap().error,
            Error::DeployFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_pipeline_stays_pending() {
        let f = fixture(MockBuilder::default(), MockDeployer::ready_after(Duration::ZERO));
        let mut pipeline = sdlc_pipeline(Duration::from_secs(600));
        pipeline.stages[2].actions[0].inputs = vec!["Nope".into()];

        let result = f.engine.run(&pipeline, context()).await;
        assert_eq!(result.phase, PipelinePhase::Pending);
        assert_eq!(result.history, vec![PipelinePhase::Pending]);
        let failure = result.failure.unwrap();
        assert!(failure.stage.is_none());
        assert!(matches!(failure.error, Error::ArtifactNotFound { .. }));
        assert!(f.source.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_variable_fails_build() {
        let f = fixture(MockBuilder::default(), MockDeployer::ready_after(Duration::ZERO));
        let mut pipeline = sdlc_pipeline(Duration::from_secs(600));
        if let ActionKind::Build(build) = &mut pipeline.stages[1].actions[0].kind {
            build.image = "app:${env.CONVOY_TEST_UNSET_TAG}".into();
        }

        let result = f.engine.run(&pipeline, context()).await;
        assert_eq!(result.phase, phase(StageKind::Build, StageState::Failed));
        assert!(f.builder.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_streams_events() {
        let f = fixture(MockBuilder::default(), MockDeployer::ready_after(Duration::ZERO));
        let (mut rx, handle) = f
            .engine
            .execute(&sdlc_pipeline(Duration::from_secs(600)), context());

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let result = handle.await.unwrap();
        assert!(result.is_success());

        assert!(matches!(
            events.first(),
            Some(PipelineEvent::PhaseChanged { .. })
        ));
        match events.last() {
            Some(PipelineEvent::PipelineCompleted { phase }) => assert!(phase.is_success()),
            other => panic!("expected PipelineCompleted, got {:?}", other),
        }
        let produced = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::ArtifactProduced { .. }))
            .count();
        assert_eq!(produced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_are_independent() {
        let f = fixture(MockBuilder::default(), MockDeployer::ready_after(Duration::ZERO));
        let pipeline = sdlc_pipeline(Duration::from_secs(600));

        let first = f.engine.run(&pipeline, context()).await;
        let second = f.engine.run(&pipeline, context()).await;
        assert!(first.is_success());
        assert!(second.is_success());
        assert_ne!(first.run_id, second.run_id);
    }

    #[test]
    fn test_trigger_from_pipeline() {
        let pipeline = sdlc_pipeline(Duration::from_secs(600));
        assert_eq!(
            pipeline.trigger(),
            Some(Trigger {
                repository: "https://git.example.com/sdlc-automation.git".into(),
                branch: "main".into(),
            })
        );
    }
}
