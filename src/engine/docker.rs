//! Docker API wrapper using the bollard crate.
//!
//! This module is the only place that talks to the daemon. It exposes the
//! handful of operations the engine needs: container lifecycle, image
//! pulls, exec sessions, log streams, networks, volumes, and tar uploads
//! into running containers.

use std::collections::HashMap;

use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::DockerError;

/// Configuration for creating a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Bind mounts in docker `host:container[:mode]` syntax.
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    pub memory_mb: Option<u64>,
    /// `(period, quota)` in microseconds; only set when CPU limits are
    /// enforced.
    pub cpu: Option<(i64, i64)>,
    pub privileged: bool,
    pub labels: HashMap<String, String>,
    pub platform: Option<String>,
    pub tty: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            entrypoint: None,
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            user: None,
            binds: Vec::new(),
            network_mode: None,
            memory_mb: None,
            cpu: None,
            privileged: false,
            labels: HashMap::new(),
            platform: None,
            tty: false,
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_cpu(mut self, period: i64, quota: i64) -> Self {
        self.cpu = Some((period, quota));
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_tty(mut self) -> Self {
        self.tty = true;
        self
    }
}

/// Observed state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited { exit_code: i64 },
    Dead,
    Other(String),
}

/// Result of a finished exec session.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}

/// A started exec session whose output is still streaming.
pub struct ExecStream {
    pub id: String,
    pub output: std::pin::Pin<
        Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>,
    >,
}

/// Docker client wrapper for engine operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

fn api_err(e: bollard::errors::Error) -> DockerError {
    DockerError::Api(e.to_string())
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;

        Ok(Self { docker })
    }

    /// Creates a container and returns its id.
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            network_mode: spec.network_mode.clone(),
            memory: spec.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            cpu_period: spec.cpu.map(|(period, _)| period),
            cpu_quota: spec.cpu.map(|(_, quota)| quota),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            tty: Some(spec.tty),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: spec.platform.clone(),
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerError::CreateFailed(e.to_string()))?;

        debug!(container = %spec.name, id = %response.id, "created container");

        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::StartFailed(e.to_string()))
    }

    /// Sends SIGTERM and waits up to `grace_secs` before SIGKILL.
    pub async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
            .map_err(api_err)
    }

    pub async fn kill_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(api_err)
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(api_err)
    }

    /// Waits until the container stops and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            // A nonzero exit arrives as an "error" carrying the code.
            return match result {
                Ok(response) => Ok(response.status_code),
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(code),
                Err(e) => Err(api_err(e)),
            };
        }

        match self.container_state(id).await? {
            ContainerState::Exited { exit_code } => Ok(exit_code),
            other => Err(DockerError::Api(format!(
                "container did not exit normally: {other:?}"
            ))),
        }
    }

    pub async fn container_state(&self, id: &str) -> Result<ContainerState, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => DockerError::ContainerNotFound { id: id.to_string() },
                other => api_err(other),
            })?;

        let state = info
            .state
            .ok_or_else(|| DockerError::Api("container has no state".to_string()))?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        Ok(match status.as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            },
            "dead" => ContainerState::Dead,
            other => ContainerState::Other(other.to_string()),
        })
    }

    /// Follows a container's output stream.
    pub fn log_stream(
        &self,
        id: &str,
    ) -> impl Stream<Item = Result<LogOutput, bollard::errors::Error>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker.logs(id, Some(options))
    }

    /// Collects a container's output so far into a single string.
    pub async fn logs_tail(&self, id: &str) -> String {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: "20".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut collected = String::new();

        while let Some(Ok(chunk)) = stream.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }

        collected
    }

    /// Starts an exec session and returns its output stream.
    pub async fn exec_stream(
        &self,
        container: &str,
        cmd: Vec<String>,
        user: Option<String>,
        env: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<ExecStream, DockerError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            user,
            env: if env.is_empty() { None } else { Some(env) },
            working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(api_err)?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(api_err)?;

        match started {
            StartExecResults::Attached { output, .. } => Ok(ExecStream {
                id: exec.id,
                output: Box::pin(output),
            }),
            StartExecResults::Detached => Err(DockerError::Api(
                "exec session unexpectedly detached".to_string(),
            )),
        }
    }

    /// Exit code of a finished exec session.
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, DockerError> {
        let info = self.docker.inspect_exec(exec_id).await.map_err(api_err)?;
        Ok(info.exit_code.unwrap_or(-1))
    }

    /// Runs a command to completion inside a running container.
    pub async fn exec(
        &self,
        container: &str,
        cmd: Vec<String>,
        user: Option<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput, DockerError> {
        let mut stream = self
            .exec_stream(container, cmd, user, env, None)
            .await?;

        let mut output = Vec::new();
        while let Some(chunk) = stream.output.next().await {
            let chunk = chunk.map_err(api_err)?;
            output.extend_from_slice(&chunk.into_bytes());
        }

        let exit_code = self.exec_exit_code(&stream.id).await?;

        Ok(ExecOutput { exit_code, output })
    }

    /// Pulls an image, optionally with credentials and a platform.
    pub async fn pull_image(
        &self,
        reference: &str,
        platform: Option<&str>,
        credentials: Option<(String, String)>,
    ) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: reference,
            platform: platform.unwrap_or_default(),
            ..Default::default()
        };

        let credentials = credentials.map(|(username, password)| DockerCredentials {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            result.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => DockerError::ImageNotFound(message),
                other => api_err(other),
            })?;
        }

        Ok(())
    }

    pub async fn image_exists(&self, reference: &str) -> bool {
        self.docker.inspect_image(reference).await.is_ok()
    }

    pub async fn create_network(&self, name: &str) -> Result<(), DockerError> {
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            ..Default::default()
        };

        self.docker
            .create_network(options)
            .await
            .map(|_| ())
            .map_err(api_err)
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), DockerError> {
        self.docker.remove_network(name).await.map_err(api_err)
    }

    pub async fn create_volume(&self, name: &str) -> Result<(), DockerError> {
        let options = CreateVolumeOptions {
            name,
            ..Default::default()
        };

        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(api_err)
    }

    pub async fn remove_volume(&self, name: &str) -> Result<(), DockerError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(api_err)
    }

    /// Uploads in-memory files as a tar archive into a container directory.
    pub async fn upload_files(
        &self,
        container: &str,
        path: &str,
        files: &[(String, String, u32)],
    ) -> Result<(), DockerError> {
        let mut builder = tar::Builder::new(Vec::new());

        for (name, content, mode) in files {
            let data = content.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data)
                .map_err(DockerError::Io)?;
        }

        let archive = builder.into_inner().map_err(DockerError::Io)?;

        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(container, Some(options), archive.into())
            .await
            .map_err(api_err)
    }
}
