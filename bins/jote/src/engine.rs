/// Execution Engine - Container Backend
///
/// **Core Responsibility:**
/// Run the container described by a test environment's descriptor and
/// return its exit code and captured output.
///
/// **Boundary:**
/// - Engine knows HOW to run a container (Docker Engine API via bollard)
/// - Engine does NOT know about job definitions, variables or checks
/// - Engine does NOT decide whether a test passed
///
/// Every run, image pull and container creation included, is bounded by the
/// run timeout. Whatever happens, the container is then removed under its
/// own, shorter bound, and a failed removal never replaces the run's result.

use crate::descriptor::{ExecutionDescriptor, Service};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use jote_common::config::Timeouts;
use std::path::{Path, PathBuf};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container run timed out after {}s", .after.as_secs())]
    Timeout {
        after: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("invalid execution descriptor \"{}\": {message}", .path.display())]
    Descriptor { path: PathBuf, message: String },

    #[error("container did not report an exit code")]
    NoExitCode,
}

/// Raw output of one container run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

/// Runs the container persisted in a test environment.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Version string of the backend, resolved once per invocation.
    async fn version(&self) -> Result<String, BackendError>;

    /// Run the environment's container to completion (or timeout).
    async fn run(&self, environment: &Path) -> Result<ContainerOutput, BackendError>;
}

/// Docker-based backend
///
/// 1. Loads the descriptor written by the environment
/// 2. Pulls the image if it is not present
/// 3. Creates the container with the bind mount, environment and limits
/// 4. Collects stdout/stderr and the exit code under the run timeout
/// 5. Removes the container under the teardown timeout
pub struct DockerEngine {
    docker: Docker,
    timeouts: Timeouts,
}

impl DockerEngine {
    pub fn connect(timeouts: Timeouts) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, timeouts })
    }

    /// Ensure the image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss (pulling now)");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(service: &Service) -> Config<String> {
        Config {
            image: Some(service.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                service.command.clone(),
            ]),
            env: Some(service.environment.clone()),
            working_dir: Some(service.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(service.volumes.clone()),
                memory: service.memory_bytes(),
                nano_cpus: service.nano_cpus(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Stream a container's logs until it stops (or, without `follow`,
    /// return what has been written so far).
    async fn collect_logs(&self, container_id: &str, follow: bool) -> (String, String) {
        let mut stdout = String::new();
        let mut stderr = String::new();

        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            ..Default::default()
        });

        let mut logs = self.docker.logs(container_id, options);
        while let Some(output) = logs.next().await {
            match output {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        (stdout, stderr)
    }

    async fn wait_exit_code(&self, container_id: &str) -> Result<i64, BackendError> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut wait = self.docker.wait_container(container_id, options);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(BackendError::NoExitCode),
        }
    }

    /// Start the container and collect its output, all before `deadline`.
    async fn run_container(
        &self,
        container_id: &str,
        deadline: Instant,
    ) -> Result<ContainerOutput, BackendError> {
        let start = Instant::now();

        let execution = async {
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>)
                .await?;
            let (stdout, stderr) = self.collect_logs(container_id, true).await;
            let exit_code = self.wait_exit_code(container_id).await?;
            Ok::<_, BackendError>((exit_code, stdout, stderr))
        };

        match tokio::time::timeout_at(deadline, execution).await {
            Ok(result) => {
                let (exit_code, stdout, stderr) = result?;
                let execution_time_ms = start.elapsed().as_millis() as u64;
                debug!(container_id, exit_code, execution_time_ms, "Container exited");
                Ok(ContainerOutput {
                    exit_code,
                    stdout,
                    stderr,
                    execution_time_ms,
                })
            }
            Err(_) => {
                warn!(
                    container_id,
                    timeout_secs = self.timeouts.run.as_secs(),
                    "Container run timed out - killing container"
                );
                let (stdout, stderr) = self.collect_logs(container_id, false).await;
                if let Err(e) = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id, error = %e, "Failed to kill timed-out container");
                }
                Err(BackendError::Timeout {
                    after: self.timeouts.run,
                    stdout,
                    stderr,
                })
            }
        }
    }

    /// Best-effort forced removal, bounded by the teardown timeout.
    async fn teardown(&self, container_id: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        let removal = self.docker.remove_container(container_id, options);
        match tokio::time::timeout(self.timeouts.teardown, removal).await {
            Ok(Ok(())) => debug!(container_id, "Container removed"),
            Ok(Err(e)) => warn!(container_id, error = %e, "Failed to remove container"),
            Err(_) => warn!(
                container_id,
                timeout_secs = self.timeouts.teardown.as_secs(),
                "Timed out removing container"
            ),
        }
    }
}

/// Bound `work` by `deadline`. Running out of time is a run timeout with
/// nothing captured yet.
async fn within<T>(
    deadline: Instant,
    after: Duration,
    work: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_secs = after.as_secs(), "Timed out preparing container");
            Err(BackendError::Timeout {
                after,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerEngine {
    async fn version(&self) -> Result<String, BackendError> {
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    #[instrument(skip(self, environment), fields(environment = %environment.display()))]
    async fn run(&self, environment: &Path) -> Result<ContainerOutput, BackendError> {
        let descriptor = ExecutionDescriptor::load(environment)?;
        let service = descriptor.job().ok_or_else(|| BackendError::Descriptor {
            path: ExecutionDescriptor::path(environment),
            message: "no job service".to_string(),
        })?;

        // Pulling, creating and running share one deadline
        let deadline = Instant::now() + self.timeouts.run;
        let name = format!("jote-{}", uuid::Uuid::new_v4());

        let prepare = async {
            self.ensure_image(&service.image).await?;
            let create_options = CreateContainerOptions {
                name: name.as_str(),
                platform: None,
            };
            let container = self
                .docker
                .create_container(Some(create_options), Self::container_config(service))
                .await?;
            Ok::<_, BackendError>(container.id)
        };

        let result = match within(deadline, self.timeouts.run, prepare).await {
            Ok(container_id) => self.run_container(&container_id, deadline).await,
            Err(e) => Err(e),
        };
        // The name reaches a container created just before the deadline too
        self.teardown(&name).await;
        result
    }
}
