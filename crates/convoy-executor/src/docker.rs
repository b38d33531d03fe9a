//! Docker builder: runs a build inside a container with the checkout mounted.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use convoy_core::RunId;
use convoy_core::builder::{BuildRequest, Builder, ImageRef};
use convoy_core::{Error, Result};
use futures::StreamExt;
use tracing::{debug, info, warn};

/// Where the source snapshot is mounted inside the build container.
pub const WORKSPACE_DIR: &str = "/workspace";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Builds images by running commands in a local Docker container.
pub struct DockerBuilder {
    docker: Docker,
}

impl DockerBuilder {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(run_id: &RunId) -> String {
        format!("convoy-build-{}", run_id)
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| Error::Build(format!("pulling {} failed: {}", image, e)))?;
        }
        Ok(())
    }

    async fn stream_logs(&self, container: &str) {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(container, Some(options));
        while let Some(line) = logs.next().await {
            match line {
                Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                    debug!(container, "{}", String::from_utf8_lossy(&message).trim_end());
                }
                Ok(LogOutput::StdErr { message }) => {
                    debug!(container, stream = "stderr", "{}", String::from_utf8_lossy(&message).trim_end());
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!(container, error = %e, "Log stream ended");
                    break;
                }
            }
        }
    }

    async fn wait(&self, container: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard surfaces non-zero exits as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Build(format!("waiting for build failed: {}", e))),
            None => Err(Error::Build("build container vanished".to_string())),
        }
    }

    async fn remove(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container, Some(options)).await {
            warn!(container, error = %e, "Failed to remove build container");
        }
    }

    async fn run_build(&self, container: &str, request: &BuildRequest) -> Result<i64> {
        let config = Config {
            image: Some(request.build_image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                build_script(&request.commands),
            ]),
            env: Some(build_env(request)),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(binds(request)),
                privileged: Some(request.privileged),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container,
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Build(format!("creating build container failed: {}", e)))?;

        self.docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Build(format!("starting build container failed: {}", e)))?;

        self.stream_logs(container).await;
        self.wait(container).await
    }
}

#[async_trait]
impl Builder for DockerBuilder {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, request: BuildRequest) -> Result<ImageRef> {
        let container = Self::container_name(&request.run_id);
        info!(
            run_id = %request.run_id,
            build_image = %request.build_image,
            commit = request.source.short_commit(),
            output = %request.output,
            "Starting build"
        );

        self.pull(&request.build_image).await?;

        let result = self.run_build(&container, &request).await;
        self.remove(&container).await;

        match result? {
            0 => {
                info!(run_id = %request.run_id, image = %request.output, "Build succeeded");
                Ok(request.output)
            }
            code => Err(Error::Build(format!("build commands exited with {}", code))),
        }
    }
}

/// Commands run by default: build the output image from the checkout and push it.
fn default_commands() -> Vec<String> {
    vec![
        "docker build -t \"$IMAGE_REPO_NAME:$IMAGE_TAG\" .".to_string(),
        "docker push \"$IMAGE_REPO_NAME:$IMAGE_TAG\"".to_string(),
    ]
}

fn build_script(commands: &[String]) -> String {
    if commands.is_empty() {
        default_commands().join(" && ")
    } else {
        commands.join(" && ")
    }
}

/// Container environment: the image coordinates and commit, then the
/// request's own variables, which win on conflict.
fn build_env(request: &BuildRequest) -> Vec<String> {
    let mut env = std::collections::BTreeMap::new();
    env.insert("IMAGE_REPO_NAME", request.output.repository.clone());
    let tag = if request.output.tag.is_empty() {
        "latest".to_string()
    } else {
        request.output.tag.clone()
    };
    env.insert("IMAGE_TAG", tag);
    env.insert("CONVOY_COMMIT_SHA", request.source.commit.clone());
    for (key, value) in &request.env {
        env.insert(key.as_str(), value.clone());
    }
    env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn binds(request: &BuildRequest) -> Vec<String> {
    let mut binds = vec![format!(
        "{}:{}",
        request.source.path.display(),
        WORKSPACE_DIR
    )];
    if request.privileged {
        binds.push(format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET));
    }
    binds
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::builder::SourceSnapshot;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn request(privileged: bool) -> BuildRequest {
        BuildRequest {
            run_id: RunId::new(),
            source: SourceSnapshot {
                repository: "https://git.example.com/sdlc-automation.git".into(),
                branch: "main".into(),
                commit: "9f1c2e7d8a4b".into(),
                path: PathBuf::from("/var/lib/convoy/src"),
            },
            build_image: "docker:27-cli".into(),
            commands: vec!["make test".into(), "make image".into()],
            env: HashMap::new(),
            privileged,
            output: ImageRef::new("sdlc-automation", "9f1c2e7"),
        }
    }

    #[test]
    fn test_env_defaults() {
        let env = build_env(&request(false));
        assert_eq!(
            env,
            vec![
                "CONVOY_COMMIT_SHA=9f1c2e7d8a4b",
                "IMAGE_REPO_NAME=sdlc-automation",
                "IMAGE_TAG=9f1c2e7",
            ]
        );
    }

    #[test]
    fn test_request_env_overrides_defaults() {
        let mut req = request(false);
        req.env.insert("IMAGE_TAG".into(), "latest".into());
        req.env.insert("STAGE".into(), "prod".into());
        let env = build_env(&req);
        assert!(env.contains(&"IMAGE_TAG=latest".to_string()));
        assert!(env.contains(&"STAGE=prod".to_string()));
        assert_eq!(env.iter().filter(|e| e.starts_with("IMAGE_TAG=")).count(), 1);
    }

    #[test]
    fn test_privileged_mounts_docker_socket() {
        assert_eq!(binds(&request(false)), vec!["/var/lib/convoy/src:/workspace"]);
        let privileged = binds(&request(true));
        assert_eq!(privileged.len(), 2);
        assert_eq!(privileged[1], "/var/run/docker.sock:/var/run/docker.sock");
    }

    #[test]
    fn test_build_script() {
        assert_eq!(build_script(&request(false).commands), "make test && make image");
        assert!(build_script(&[]).starts_with("docker build"));
    }

    #[test]
    fn test_container_name() {
        let run_id = RunId::new();
        assert_eq!(
            DockerBuilder::container_name(&run_id),
            format!("convoy-build-{}", run_id)
        );
    }

    mod integration_tests {
        use super::*;

        #[tokio::test]
        #[ignore] // Requires Docker
        async fn test_failing_build_reports_exit_code() {
            let dir = std::env::temp_dir().join("convoy-docker-test");
            std::fs::create_dir_all(&dir).unwrap();

            let builder = DockerBuilder::new().unwrap();
            let mut req = request(false);
            req.source.path = dir;
            req.build_image = "alpine:latest".into();
            req.commands = vec!["echo building".into(), "exit 3".into()];

            match builder.build(req).await {
                Err(Error::Build(message)) => assert!(message.contains('3')),
                other => panic!("expected Build error, got {:?}", other),
            }
        }

        #[tokio::test]
        #[ignore] // Requires Docker
        async fn test_successful_build_returns_output() {
            let dir = std::env::temp_dir().join("convoy-docker-ok");
            std::fs::create_dir_all(&dir).unwrap();

            let builder = DockerBuilder::new().unwrap();
            let mut req = request(false);
            req.source.path = dir;
            req.build_image = "alpine:latest".into();
            req.commands = vec!["test \"$IMAGE_REPO_NAME\" = sdlc-automation".into()];

            let image = builder.build(req).await.unwrap();
            assert_eq!(image.to_string(), "sdlc-automation:9f1c2e7");
        }
    }
}
