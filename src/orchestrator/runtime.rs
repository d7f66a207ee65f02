//! Container runtime seam.
//!
//! The lifecycle coordinator only needs a handful of container operations;
//! [`DockerRuntime`] provides them over the local Docker daemon.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;

use crate::error::LifecycleError;

/// What to create.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    /// Non-secret environment only; credentials go through the control plane.
    pub env: Vec<String>,
    pub user: Option<String>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

/// The parts of an inspect result the coordinator uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub status: String,
    /// Network name to IP address.
    pub ips: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Address on `network`, or on the first attached network.
    pub fn ip(&self, network: Option<&str>) -> Option<&str> {
        match network {
            Some(name) => self.ips.get(name).map(String::as_str),
            None => self.ips.values().next().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// `user`, `uid`, or `uid:gid`.
    pub user: Option<String>,
    pub env: Vec<String>,
    /// Written to the process's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
}

impl ExecSpec {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Default::default()
        }
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, LifecycleError>;
    async fn start(&self, id: &str) -> Result<(), LifecycleError>;
    async fn stop(&self, id: &str) -> Result<(), LifecycleError>;
    async fn restart(&self, id: &str) -> Result<(), LifecycleError>;
    async fn inspect(&self, id: &str) -> Result<ContainerInfo, LifecycleError>;
    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecOutput, LifecycleError>;
}

/// Connect to the local Docker daemon and verify it answers.
pub async fn connect_docker() -> Result<Docker, LifecycleError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| LifecycleError::Runtime {
        reason: format!("failed to connect to Docker: {e}"),
    })?;
    docker.ping().await.map_err(|e| LifecycleError::Runtime {
        reason: format!("Docker daemon not responding: {e}"),
    })?;
    Ok(docker)
}

/// [`ContainerRuntime`] over bollard. The connection is opened on first use.
#[derive(Clone, Default)]
pub struct DockerRuntime {
    docker: Arc<OnceCell<Docker>>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker: Arc::new(OnceCell::new_with(Some(docker))),
        }
    }

    async fn docker(&self) -> Result<&Docker, LifecycleError> {
        self.docker.get_or_try_init(connect_docker).await
    }
}

fn map_docker_err(id: &str, e: bollard::errors::Error) -> LifecycleError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => LifecycleError::ContainerNotFound {
            container_id: id.to_string(),
        },
        other => LifecycleError::Runtime {
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, LifecycleError> {
        use bollard::models::HostConfig;

        let docker = self.docker().await?;
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            user: spec.user.clone(),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            host_config: Some(HostConfig {
                network_mode: spec.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| LifecycleError::Runtime {
                reason: format!("failed to create container {}: {e}", spec.name),
            })?;
        tracing::info!(container_id = %response.id, name = %spec.name, "Created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), LifecycleError> {
        self.docker()
            .await?
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_err(id, e))
    }

    async fn stop(&self, id: &str) -> Result<(), LifecycleError> {
        self.docker()
            .await?
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| map_docker_err(id, e))
    }

    async fn restart(&self, id: &str) -> Result<(), LifecycleError> {
        self.docker()
            .await?
            .restart_container(id, Some(RestartContainerOptions { t: 10 }))
            .await
            .map_err(|e| map_docker_err(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, LifecycleError> {
        let inspect = self
            .docker()
            .await?
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_err(id, e))?;

        let state = inspect.state.unwrap_or_default();
        let ips = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| {
                networks
                    .into_iter()
                    .filter_map(|(name, endpoint)| {
                        endpoint
                            .ip_address
                            .filter(|ip| !ip.is_empty())
                            .map(|ip| (name, ip))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            ips,
        })
    }

    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecOutput, LifecycleError> {
        let docker = self.docker().await?;
        let exec = docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(spec.stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(spec.cmd.clone()),
                    user: spec.user.clone(),
                    env: (!spec.env.is_empty()).then(|| spec.env.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_docker_err(id, e))?;

        let started = docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_err(id, e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, mut input } = started {
            if let Some(data) = spec.stdin {
                input
                    .write_all(&data)
                    .await
                    .map_err(|e| LifecycleError::Runtime {
                        reason: format!("failed to write exec stdin: {e}"),
                    })?;
                let _ = input.shutdown().await;
            }
            drop(input);

            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(LifecycleError::Runtime {
                            reason: format!("exec output stream failed: {e}"),
                        });
                    }
                }
            }
        }

        let inspect = docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| LifecycleError::Runtime {
                reason: format!("failed to inspect exec: {e}"),
            })?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }
}
