//! Sidecar service containers for steps.
//!
//! Services join the step container's network namespace, so they are
//! reachable from the script on `localhost` only; service names are not
//! resolvable hostnames. Readiness is a settle window: a service that is
//! still running one second after start is considered ready, and scripts
//! are expected to retry until the service actually answers.
//!
//! The service named `docker` is special: it runs a privileged
//! Docker-in-Docker daemon whose socket is shared with the step through
//! a named volume.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RunnerConfig, DEFAULT_DOCKER_SERVICE_IMAGE, DOCKER_SOCKET_DIR};
use crate::context::StepContext;
use crate::engine::docker::{ContainerSpec, ContainerState, DockerClient};
use crate::engine::image::ImageProvider;
use crate::engine::logs::LogSink;
use crate::error::ServiceError;
use crate::model::{ImageSpec, ServiceSpec};
use crate::utils::slugify;

/// How long a service must stay up before it counts as ready.
const SETTLE_WINDOW: Duration = Duration::from_secs(1);

/// Grace period when stopping a service container.
const STOP_GRACE_SECS: i64 = 10;

/// A started service container.
#[derive(Debug, Clone)]
pub struct RunningService {
    pub name: String,
    pub container_id: String,
    pub container_name: String,
    pub is_docker: bool,
}

/// All services of one step plus their log capture tasks.
pub struct ServiceHandles {
    pub services: Vec<RunningService>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandles {
    pub fn empty() -> Self {
        Self {
            services: Vec::new(),
            log_tasks: Vec::new(),
        }
    }
}

/// Extra mounts for the `docker` service.
#[derive(Debug, Clone, Default)]
pub struct DockerServiceMounts {
    /// Named volume carrying the daemon socket, mounted at `/var/run`.
    pub socket_volume: Option<String>,
    /// Named volume for the daemon's graph root (`docker` cache).
    pub cache_volume: Option<String>,
}

/// Starts, health-gates, log-captures, and tears down service containers.
pub struct ServiceRuntime {
    docker: Arc<DockerClient>,
    images: Arc<ImageProvider>,
    config: RunnerConfig,
}

impl ServiceRuntime {
    pub fn new(docker: Arc<DockerClient>, images: Arc<ImageProvider>, config: RunnerConfig) -> Self {
        Self {
            docker,
            images,
            config,
        }
    }

    /// Verifies the requested services fit in the step's memory budget.
    pub fn ensure_memory(
        &self,
        services: &[(String, ServiceSpec)],
        size_multiplier: u64,
    ) -> Result<(), ServiceError> {
        let requested: u64 = services.iter().map(|(_, s)| s.memory).sum();
        let available = (self.config.total_memory_limit_mb * size_multiplier)
            .saturating_sub(self.config.build_container_minimum_memory_mb);

        if requested > available {
            return Err(ServiceError::NotEnoughMemory {
                requested,
                available,
            });
        }

        Ok(())
    }

    /// Starts every requested service inside the step container's network
    /// namespace and returns once each has settled.
    pub async fn start(
        &self,
        ctx: &StepContext,
        services: &[(String, ServiceSpec)],
        step_container: &str,
        docker_mounts: &DockerServiceMounts,
        secrets: &[String],
    ) -> Result<ServiceHandles, ServiceError> {
        let mut handles = ServiceHandles::empty();

        for (name, spec) in services {
            match self
                .start_one(ctx, name, spec, step_container, docker_mounts, secrets)
                .await
            {
                Ok((service, log_task)) => {
                    handles.services.push(service);
                    handles.log_tasks.push(log_task);
                }
                Err(e) => {
                    // Partial starts must not leak containers.
                    self.stop(handles).await;
                    return Err(e);
                }
            }
        }

        Ok(handles)
    }

    async fn start_one(
        &self,
        ctx: &StepContext,
        name: &str,
        spec: &ServiceSpec,
        step_container: &str,
        docker_mounts: &DockerServiceMounts,
        secrets: &[String],
    ) -> Result<(RunningService, JoinHandle<()>), ServiceError> {
        let is_docker = name == "docker";
        let slug = slugify(name);

        info!(service = name, "starting service");

        let image = self.effective_image(name, spec);
        self.images.ensure(&image, false).await?;

        let container_name = format!("{}-service-{slug}", ctx.container_name);

        let mut env: Vec<String> = spec
            .variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut builder = ContainerSpec::new(&container_name, &image.name)
            .with_network_mode(format!("container:{step_container}"))
            .with_memory_mb(spec.memory)
            .with_label("pipeline-forge.step-id", &ctx.step_id);

        if is_docker {
            env.push("DOCKER_TLS_CERTDIR=".to_string());
            builder = builder.privileged();

            let mut binds = Vec::new();
            if let Some(volume) = &docker_mounts.socket_volume {
                binds.push(format!("{volume}:{DOCKER_SOCKET_DIR}"));
            }
            if let Some(volume) = &docker_mounts.cache_volume {
                binds.push(format!("{volume}:/var/lib/docker"));
            }
            builder = builder.with_binds(binds);
        }

        if let Some(command) = &spec.command {
            builder = builder.with_cmd(command.to_argv());
        }

        builder = builder.with_env(env);

        let container_id = self.docker.create_container(&builder).await?;
        self.docker.start_container(&container_id).await?;

        tokio::time::sleep(SETTLE_WINDOW).await;

        match self.docker.container_state(&container_id).await? {
            ContainerState::Running => {}
            state => {
                let tail = self.docker.logs_tail(&container_id).await;
                let _ = self.docker.remove_container(&container_id, true).await;

                return Err(ServiceError::NotReady {
                    name: name.to_string(),
                    message: format!("container is {state:?}; last output: {}", tail.trim()),
                });
            }
        }

        debug!(service = name, container = %container_name, "service ready");

        let log_task = self
            .spawn_log_capture(ctx, &slug, &container_id, secrets)
            .await;

        Ok((
            RunningService {
                name: name.to_string(),
                container_id,
                container_name,
                is_docker,
            },
            log_task,
        ))
    }

    fn effective_image(&self, name: &str, spec: &ServiceSpec) -> ImageSpec {
        if let Some(image) = &spec.image {
            return image.clone();
        }

        // Only `docker` may omit the image; validation enforces this.
        if name == "docker" {
            ImageSpec::from_name(DEFAULT_DOCKER_SERVICE_IMAGE)
        } else {
            ImageSpec::from_name(name)
        }
    }

    async fn spawn_log_capture(
        &self,
        ctx: &StepContext,
        slug: &str,
        container_id: &str,
        secrets: &[String],
    ) -> JoinHandle<()> {
        let path = ctx.services_log_dir().join(format!("{slug}.log"));
        let docker = self.docker.clone();
        let container_id = container_id.to_string();
        let secrets = secrets.to_vec();
        let slug = slug.to_string();

        tokio::spawn(async move {
            let (sink, guard) = match LogSink::create(path, secrets, false).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(service = %slug, "failed to open service log: {e}");
                    return;
                }
            };

            let mut stream = docker.log_stream(&container_id);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(output) => {
                        sink.out(String::from_utf8_lossy(&output.into_bytes()).to_string())
                    }
                    Err(_) => break,
                }
            }

            crate::engine::logs::close_sink(sink, guard).await;
        })
    }

    /// Captures remaining logs and removes the service containers.
    pub async fn stop(&self, handles: ServiceHandles) {
        for service in &handles.services {
            info!(service = %service.name, "removing service");

            if let Err(e) = self
                .docker
                .stop_container(&service.container_id, STOP_GRACE_SECS)
                .await
            {
                warn!(service = %service.name, "failed to stop service: {e}");
            }

            if let Err(e) = self.docker.remove_container(&service.container_id, true).await {
                warn!(service = %service.name, "failed to remove service: {e}");
            }
        }

        // Removing the containers ends the log streams.
        for task in handles.log_tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("service log capture did not drain in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn runtime() -> ServiceRuntime {
        let docker = Arc::new(DockerClient::new().expect("client construction is lazy"));
        let images = Arc::new(ImageProvider::new(
            docker.clone(),
            Arc::new(crate::engine::image::DefaultAuthProvider),
            None,
        ));

        ServiceRuntime::new(docker, images, RunnerConfig::default())
    }

    fn service(memory: u64) -> ServiceSpec {
        ServiceSpec {
            image: Some(ImageSpec::from_name("postgres:16")),
            variables: BTreeMap::new(),
            memory,
            command: None,
        }
    }

    #[test]
    fn test_memory_guard_accepts_fitting_services() {
        let runtime = runtime();
        let services = vec![("postgres".to_string(), service(1024))];

        assert!(runtime.ensure_memory(&services, 1).is_ok());
    }

    #[test]
    fn test_memory_guard_rejects_oversubscription() {
        let runtime = runtime();
        // 4096 total - 1024 reserved leaves 3072 for services at 1x.
        let services = vec![
            ("postgres".to_string(), service(2048)),
            ("redis".to_string(), service(2048)),
        ];

        let err = runtime.ensure_memory(&services, 1).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::NotEnoughMemory {
                requested: 4096,
                available: 3072,
            }
        ));
    }

    #[test]
    fn test_memory_guard_scales_with_step_size() {
        let runtime = runtime();
        let services = vec![
            ("postgres".to_string(), service(2048)),
            ("redis".to_string(), service(2048)),
        ];

        assert!(runtime.ensure_memory(&services, 2).is_ok());
    }

    #[test]
    fn test_docker_service_gets_default_image() {
        let runtime = runtime();
        let spec = ServiceSpec {
            image: None,
            variables: BTreeMap::new(),
            memory: 1024,
            command: None,
        };

        let image = runtime.effective_image("docker", &spec);
        assert_eq!(image.name, DEFAULT_DOCKER_SERVICE_IMAGE);
    }
}
