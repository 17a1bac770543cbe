//! Step execution.
//!
//! `execute` runs one fully resolved step to completion and always
//! returns a [`StepResult`]; internal failures are captured as the
//! result's failure reason and never cross this boundary as errors.
//!
//! Lifecycle: resolve → prepare the build directory → launch the step
//! container → start services → run the script → run the after-script →
//! collect artifacts → record caches → tear everything down. Teardown
//! happens on every path, including cancellation.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{
    RunnerConfig, BUILD_DIR, DOCKER_HOST_SOCKET, SCRIPTS_DIR, SSH_KEY_DIR, TEMP_DIR,
};
use crate::context::StepContext;
use crate::engine::artifacts;
use crate::engine::docker::{ContainerSpec, DockerClient};
use crate::engine::image::ImageProvider;
use crate::engine::logs::{close_sink, LogSink};
use crate::engine::script::{plan_script, ScriptAction, GROUP_SEPARATOR};
use crate::engine::service::{DockerServiceMounts, ServiceHandles, ServiceRuntime};
use crate::engine::volumes::VolumeManager;
use crate::error::StepFailure;
use crate::model::{ServiceSpec, Step};
use crate::oidc::{OidcClaims, OidcSigner};
use crate::variables::{
    assemble_environment, system_variables, DeploymentVariablesProvider, VarOrigin, Variable,
};

/// Shutdown phases broadcast by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// First Ctrl-C: stop with a grace period, persist what we can.
    Graceful,
    /// Second Ctrl-C: force-kill immediately.
    Force,
}

/// Terminal status of a step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Left out by `--step` selection; the pipeline continues.
    Skipped,
    /// A manual step declined in a non-interactive run; the pipeline
    /// stops successfully.
    NotTriggered,
}

/// The record of one attempted step, persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Relative paths copied into the step's artifact store.
    pub artifacts: Vec<String>,
    /// Cache name → derived key for every cache the step mounted.
    pub caches: BTreeMap<String, String>,
    pub failure: Option<StepFailure>,
}

impl StepResult {
    pub fn ok(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

/// Everything the executor needs, threaded in explicitly.
pub struct ExecutorDeps {
    pub docker: Arc<DockerClient>,
    pub images: Arc<ImageProvider>,
    pub volumes: Arc<VolumeManager>,
    pub services: Arc<ServiceRuntime>,
    pub config: RunnerConfig,
    pub oidc_signer: Option<Arc<dyn OidcSigner>>,
    pub deployment_vars: Option<Arc<dyn DeploymentVariablesProvider>>,
    pub shutdown: broadcast::Sender<Shutdown>,
    /// Latched by the signal listener; receivers that subscribe after
    /// the broadcast still observe the cancellation through this flag.
    pub cancelled: Arc<AtomicBool>,
}

/// Resources held while a step runs; torn down on every exit path.
#[derive(Default)]
struct StepResources {
    network: Option<String>,
    container_id: Option<String>,
    services: Option<ServiceHandles>,
    /// Cache name → (key, host directory).
    cache_dirs: Vec<(String, String, PathBuf)>,
    build_dir_ready: bool,
}

pub struct StepExecutor {
    deps: ExecutorDeps,
}

impl StepExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    /// Runs the step to completion. Never fails across this boundary.
    pub async fn execute(&self, ctx: &StepContext, prior_artifacts: &[PathBuf]) -> StepResult {
        let started_at = Utc::now();
        let step = &ctx.step;

        info!(step = %step.name, id = %ctx.step_id, "running step");

        if step.trigger == crate::model::Trigger::Manual && !self.confirm_manual_trigger(step) {
            info!(step = %step.name, "manual step not confirmed, stopping pipeline");
            return StepResult {
                step_id: ctx.step_id.clone(),
                name: step.name.clone(),
                status: StepStatus::NotTriggered,
                exit_code: None,
                started_at,
                ended_at: Utc::now(),
                artifacts: Vec::new(),
                caches: BTreeMap::new(),
                failure: None,
            };
        }

        let clock = Instant::now();
        let mut resources = StepResources::default();

        let outcome = self.run_inner(ctx, prior_artifacts, &mut resources).await;

        // Artifacts and caches are materialised after the scripts, on a
        // best-effort basis even when the run was cancelled.
        let collect_outputs = matches!(&outcome, Ok(_) | Err(StepFailure::Cancelled));
        let mut collected_artifacts = Vec::new();

        if collect_outputs && resources.build_dir_ready {
            collected_artifacts = self.collect_artifacts(ctx);
        }

        let mut caches = BTreeMap::new();
        for (name, key, dir) in &resources.cache_dirs {
            let empty = std::fs::read_dir(dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true);

            if empty {
                warn!(cache = %name, "cache is empty after step, nothing to cache");
            } else {
                caches.insert(name.clone(), key.clone());
            }
        }

        self.teardown(&mut resources).await;

        let (status, exit_code, failure) = match outcome {
            Ok(0) => (StepStatus::Succeeded, Some(0), None),
            Ok(code) => (
                StepStatus::Failed,
                Some(code),
                Some(StepFailure::ScriptFailed { exit_code: code }),
            ),
            Err(failure) => (StepStatus::Failed, Some(failure.exit_code()), Some(failure)),
        };

        if status == StepStatus::Failed {
            warn!(step = %step.name, "step failed in {:.3}s", clock.elapsed().as_secs_f64());
        } else {
            info!(
                step = %step.name,
                "step finished in {:.3}s",
                clock.elapsed().as_secs_f64()
            );
        }

        let result = StepResult {
            step_id: ctx.step_id.clone(),
            name: step.name.clone(),
            status,
            exit_code,
            started_at,
            ended_at: Utc::now(),
            artifacts: collected_artifacts,
            caches,
            failure,
        };

        self.persist_result(ctx, &result);

        result
    }

    async fn run_inner(
        &self,
        ctx: &StepContext,
        prior_artifacts: &[PathBuf],
        resources: &mut StepResources,
    ) -> Result<i64, StepFailure> {
        let step = &ctx.step;

        // Resolve services before touching the daemon.
        let services = resolve_services(ctx)?;
        let wants_docker = services.iter().any(|(name, _)| name == "docker");

        self.deps
            .services
            .ensure_memory(&services, step.size.multiplier())
            .map_err(|e| StepFailure::Services(e.to_string()))?;

        // Build directory and rehydrated artifacts.
        let build_dir = ctx.build_dir();
        self.deps
            .volumes
            .prepare_build_dir(&build_dir)
            .await
            .map_err(|e| StepFailure::Volumes(e.to_string()))?;
        resources.build_dir_ready = true;

        if step.artifacts.download && !prior_artifacts.is_empty() {
            let restored = artifacts::rehydrate(prior_artifacts, &build_dir)
                .map_err(|e| StepFailure::Volumes(format!("restoring artifacts: {e}")))?;
            debug!(files = restored, "artifacts restored into build directory");
        }

        // Caches become bind mounts at their declared paths.
        let mut binds = vec![format!("{}:{BUILD_DIR}", build_dir.display())];
        let mut docker_mounts = DockerServiceMounts::default();
        let mut cache_definitions = merged_cache_definitions(ctx);

        for name in &step.caches {
            if name == "docker" {
                if !wants_docker {
                    warn!("docker cache requested without the docker service, skipping");
                    continue;
                }

                let volume = self
                    .deps
                    .volumes
                    .docker_cache_volume()
                    .await
                    .map_err(|e| StepFailure::Volumes(e.to_string()))?;
                docker_mounts.cache_volume = Some(volume);
                continue;
            }

            let Some(spec) = cache_definitions.remove(name.as_str()) else {
                warn!(cache = %name, "unknown cache, skipping");
                continue;
            };

            let (dir, key) = self
                .deps
                .volumes
                .cache_dir(name, &spec)
                .await
                .map_err(|e| StepFailure::Volumes(e.to_string()))?;

            let mount = crate::engine::volumes::resolve_cache_mount_path(spec.declared_path());
            binds.push(format!("{}:{mount}", dir.display()));
            resources.cache_dirs.push((name.clone(), key, dir));
        }

        // SSH material and agent forwarding.
        let mut extra_env = Vec::new();
        let mut install_ssh_config = false;

        if let Some(identity) = &self.deps.config.ssh_identity_file {
            let ssh_dir = self
                .deps
                .volumes
                .ssh_material_dir(&ctx.step_dir(), identity)
                .await
                .map_err(|e| StepFailure::Volumes(e.to_string()))?;
            binds.push(format!("{}:{SSH_KEY_DIR}:ro", ssh_dir.display()));
            install_ssh_config = true;
        }

        if self.deps.config.expose_ssh_agent {
            match std::env::var("SSH_AUTH_SOCK") {
                Ok(sock) if !sock.is_empty() => {
                    info!("mounting ssh agent in container");
                    binds.push(format!("{sock}:/ssh-agent"));
                    extra_env.push("SSH_AUTH_SOCK=/ssh-agent".to_string());
                }
                _ => warn!("no running ssh agent available"),
            }
        }

        let user_binds =
            crate::engine::volumes::user_volume_binds(&self.deps.config.volumes)
                .map_err(|e| StepFailure::Volumes(e.to_string()))?;
        binds.extend(user_binds);

        // Docker-in-Docker socket volume, shared with the daemon service.
        if wants_docker {
            let volume = self
                .deps
                .volumes
                .socket_volume(&ctx.container_name)
                .await
                .map_err(|e| StepFailure::Volumes(e.to_string()))?;
            binds.push(format!(
                "{volume}:{}",
                crate::config::DOCKER_SOCKET_DIR
            ));
            docker_mounts.socket_volume = Some(volume);
            extra_env.push(format!("DOCKER_HOST={DOCKER_HOST_SOCKET}"));
        }

        // Environment, in increasing precedence order.
        let system = system_variables(ctx);
        let oidc = self.oidc_variables(ctx).await?;
        let declared = ctx.run.pipeline_variables.clone();
        let deployment = self.deployment_variables(ctx);
        let user = ctx.run.user_variables.clone();
        let step_local: Vec<Variable> = step
            .variables
            .iter()
            .map(|(k, v)| Variable::new(k, v, VarOrigin::StepLocal))
            .collect();

        let mut env: Vec<String> =
            assemble_environment(&[&system, &oidc, &declared, &deployment, &user, &step_local])
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
        env.extend(extra_env);

        // Image, network, container.
        let image = ctx.effective_image();
        self.deps
            .images
            .ensure(&image, true)
            .await
            .map_err(|e| StepFailure::Image(e.to_string()))?;

        let network = ctx.network_name();
        self.deps
            .docker
            .create_network(&network)
            .await
            .map_err(|e| StepFailure::ContainerStart(e.to_string()))?;
        resources.network = Some(network.clone());

        let services_memory: u64 = services.iter().map(|(_, s)| s.memory).sum();
        let memory = self
            .deps
            .config
            .build_container_memory_mb(step.size.multiplier(), services_memory);

        let mut spec = ContainerSpec::new(&ctx.container_name, &image.name)
            .with_entrypoint(vec!["sh".to_string()])
            .with_user(ctx.run_as_user())
            .with_working_dir(BUILD_DIR)
            .with_env(env)
            .with_binds(binds)
            .with_network_mode(&network)
            .with_memory_mb(memory)
            .with_platform(self.deps.config.docker_platform.clone())
            .with_label("pipeline-forge.pipeline-uuid", ctx.run.pipeline_uuid.to_string())
            .with_label("pipeline-forge.step-id", &ctx.step_id)
            .with_tty();

        if self.deps.config.cpu_limits {
            let period = 100_000i64;
            let quota = (period as f64
                * self.deps.config.cpus_per_size
                * step.size.multiplier() as f64) as i64;
            spec = spec.with_cpu(period, quota);
        }

        let container_id = self
            .deps
            .docker
            .create_container(&spec)
            .await
            .map_err(|e| StepFailure::ContainerStart(e.to_string()))?;
        resources.container_id = Some(container_id.clone());

        self.deps
            .docker
            .start_container(&container_id)
            .await
            .map_err(|e| StepFailure::ContainerStart(e.to_string()))?;

        self.prepare_container_directories(ctx, &container_id, install_ssh_config)
            .await?;

        // Container-level output; the task ends when the container is
        // removed.
        let _ = self.spawn_container_log_capture(ctx, &container_id).await;

        // Services join the step container's network namespace.
        let secrets = ctx.run.secret_values();
        let handles = self
            .deps
            .services
            .start(ctx, &services, &ctx.container_name, &docker_mounts, &secrets)
            .await
            .map_err(|e| StepFailure::Services(e.to_string()))?;
        resources.services = Some(handles);

        // The script, optionally under a deadline.
        let (sink, guard) =
            LogSink::create(ctx.script_log_path(), secrets.clone(), true)
                .await
                .map_err(|e| StepFailure::Internal(format!("opening script log: {e}")))?;

        let script_future =
            self.run_program(ctx, &container_id, &step.script, Vec::new(), &sink);

        let outcome = match step.max_time {
            Some(minutes) => {
                let deadline = Duration::from_secs(minutes * 60);
                match tokio::time::timeout(deadline, script_future).await {
                    Ok(result) => result,
                    Err(_) => Err(StepFailure::TimedOut {
                        seconds: minutes * 60,
                    }),
                }
            }
            None => script_future.await,
        };

        close_sink(sink, guard).await;

        // The after-script runs regardless of the script's exit code and
        // can never change the step's outcome.
        if let Ok(exit_code) = &outcome {
            if !step.after_script.is_empty() {
                self.run_after_script(ctx, &container_id, *exit_code, &secrets)
                    .await;
            }
        }

        outcome
    }

    /// Runs a traced program inside the step container, streaming output
    /// into the sink and honouring breakpoints and cancellation.
    async fn run_program(
        &self,
        ctx: &StepContext,
        container_id: &str,
        lines: &[String],
        extra_env: Vec<String>,
        sink: &LogSink,
    ) -> Result<i64, StepFailure> {
        let mut shutdown = self.deps.shutdown.subscribe();

        for action in plan_script(lines) {
            if self.deps.cancelled.load(Ordering::SeqCst) {
                return Err(StepFailure::Cancelled);
            }

            match action {
                ScriptAction::Run(remote) => {
                    let files: Vec<(String, String, u32)> = remote
                        .files
                        .iter()
                        .map(|f| (f.name.clone(), f.content.clone(), 0o644))
                        .collect();

                    self.deps
                        .docker
                        .upload_files(container_id, SCRIPTS_DIR, &files)
                        .await
                        .map_err(|e| {
                            StepFailure::Internal(format!("uploading scripts: {e}"))
                        })?;

                    let mut stream = self
                        .deps
                        .docker
                        .exec_stream(
                            container_id,
                            vec!["/bin/sh".to_string(), remote.entrypoint.clone()],
                            Some(ctx.run_as_user()),
                            extra_env.clone(),
                            Some(BUILD_DIR.to_string()),
                        )
                        .await
                        .map_err(|e| StepFailure::Internal(format!("starting exec: {e}")))?;

                    let mut timing = TimingSplitter::default();

                    loop {
                        tokio::select! {
                            signal = shutdown.recv() => {
                                if matches!(signal, Ok(Shutdown::Force)) {
                                    let _ = self.deps.docker.kill_container(container_id).await;
                                }
                                return Err(StepFailure::Cancelled);
                            }
                            chunk = stream.output.next() => {
                                match chunk {
                                    Some(Ok(output)) => {
                                        use bollard::container::LogOutput;
                                        match output {
                                            LogOutput::StdErr { message } => sink.err(
                                                String::from_utf8_lossy(&message).to_string(),
                                            ),
                                            other => timing.feed(
                                                &String::from_utf8_lossy(&other.into_bytes()),
                                                sink,
                                            ),
                                        }
                                    }
                                    Some(Err(e)) => {
                                        return Err(StepFailure::Internal(format!(
                                            "reading step output: {e}"
                                        )));
                                    }
                                    None => break,
                                }
                            }
                        }
                    }

                    timing.finish(sink);

                    let exit_code = self
                        .read_exit_code(container_id, &remote.exit_code_file)
                        .await?;

                    if exit_code != 0 {
                        return Ok(exit_code);
                    }
                }
                ScriptAction::Breakpoint => self.pause_at_breakpoint(ctx).await,
            }
        }

        Ok(0)
    }

    async fn read_exit_code(
        &self,
        container_id: &str,
        exit_code_file: &str,
    ) -> Result<i64, StepFailure> {
        let output = self
            .deps
            .docker
            .exec(
                container_id,
                vec!["/bin/cat".to_string(), exit_code_file.to_string()],
                None,
                Vec::new(),
            )
            .await
            .map_err(|e| StepFailure::Internal(format!("reading exit code: {e}")))?;

        if output.exit_code != 0 {
            return Err(StepFailure::Internal(format!(
                "exit code file missing: {}",
                output.output_string().trim()
            )));
        }

        output
            .output_string()
            .trim()
            .parse::<i64>()
            .map_err(|_| {
                StepFailure::Internal(format!(
                    "invalid exit code: {}",
                    output.output_string().trim()
                ))
            })
    }

    async fn run_after_script(
        &self,
        ctx: &StepContext,
        container_id: &str,
        script_exit_code: i64,
        secrets: &[String],
    ) {
        let (sink, guard) = match LogSink::create(
            ctx.after_script_log_path(),
            secrets.to_vec(),
            true,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to open after-script log: {e}");
                return;
            }
        };

        let env = vec![format!("BITBUCKET_EXIT_CODE={script_exit_code}")];

        match self
            .run_program(ctx, container_id, &ctx.step.after_script, env, &sink)
            .await
        {
            Ok(0) => {}
            Ok(code) => warn!(exit_code = code, "after-script failed"),
            Err(e) => warn!("after-script aborted: {e}"),
        }

        close_sink(sink, guard).await;
    }

    async fn prepare_container_directories(
        &self,
        ctx: &StepContext,
        container_id: &str,
        install_ssh_config: bool,
    ) -> Result<(), StepFailure> {
        let mkdir = vec![
            "install".to_string(),
            "-dD".to_string(),
            "-o".to_string(),
            ctx.run_as_user(),
            SCRIPTS_DIR.to_string(),
            TEMP_DIR.to_string(),
        ];

        let output = self
            .deps
            .docker
            .exec(container_id, mkdir, Some("0".to_string()), Vec::new())
            .await
            .map_err(|e| StepFailure::ContainerStart(e.to_string()))?;

        if output.exit_code != 0 {
            return Err(StepFailure::ContainerStart(format!(
                "creating pipeline directories: {}",
                output.output_string().trim()
            )));
        }

        if install_ssh_config {
            // The user's ~/.ssh/config must match the mounted canonical
            // config byte for byte.
            let cmd = format!(
                "install -d -m 700 ~/.ssh && cp {SSH_KEY_DIR}/config ~/.ssh/config"
            );
            let output = self
                .deps
                .docker
                .exec(
                    container_id,
                    vec!["sh".to_string(), "-c".to_string(), cmd],
                    Some("0".to_string()),
                    Vec::new(),
                )
                .await
                .map_err(|e| StepFailure::ContainerStart(e.to_string()))?;

            if output.exit_code != 0 {
                return Err(StepFailure::ContainerStart(format!(
                    "installing ssh config: {}",
                    output.output_string().trim()
                )));
            }
        }

        Ok(())
    }

    async fn spawn_container_log_capture(
        &self,
        ctx: &StepContext,
        container_id: &str,
    ) -> tokio::task::JoinHandle<()> {
        let docker = self.deps.docker.clone();
        let container_id = container_id.to_string();
        let path = ctx.container_log_path();
        let secrets = ctx.run.secret_values();

        tokio::spawn(async move {
            let (sink, guard) = match LogSink::create(path, secrets, false).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("failed to open container log: {e}");
                    return;
                }
            };

            let mut stream = docker.log_stream(&container_id);
            while let Some(Ok(output)) = stream.next().await {
                sink.out(String::from_utf8_lossy(&output.into_bytes()).to_string());
            }

            close_sink(sink, guard).await;
        })
    }

    async fn oidc_variables(&self, ctx: &StepContext) -> Result<Vec<Variable>, StepFailure> {
        if !ctx.step.oidc {
            return Ok(Vec::new());
        }

        if !self.deps.config.oidc.enabled {
            warn!(step = %ctx.step.name, "ignoring oidc flag, oidc is not enabled");
            return Ok(Vec::new());
        }

        let Some(signer) = &self.deps.oidc_signer else {
            warn!(step = %ctx.step.name, "ignoring oidc flag, no signer configured");
            return Ok(Vec::new());
        };

        let claims = OidcClaims::for_step(&self.deps.config.oidc, ctx);
        let token = signer
            .sign(&claims)
            .await
            .map_err(|e| StepFailure::Internal(format!("signing oidc token: {e}")))?;

        Ok(vec![Variable::new(
            "BITBUCKET_STEP_OIDC_TOKEN",
            token,
            VarOrigin::Oidc,
        )
        .secret()])
    }

    fn deployment_variables(&self, ctx: &StepContext) -> Vec<Variable> {
        let Some(environment) = &ctx.step.deployment else {
            return Vec::new();
        };

        let Some(provider) = &self.deps.deployment_vars else {
            return Vec::new();
        };

        provider
            .variables_for(environment)
            .into_iter()
            .map(|(name, value)| Variable::new(name, value, VarOrigin::Deployment))
            .collect()
    }

    fn collect_artifacts(&self, ctx: &StepContext) -> Vec<String> {
        if ctx.step.artifacts.paths.is_empty() {
            return Vec::new();
        }

        match artifacts::collect(
            &ctx.build_dir(),
            &ctx.step.artifacts.paths,
            &ctx.artifacts_dir(),
        ) {
            Ok(collected) => {
                info!(files = collected.files.len(), "artifacts collected");
                collected.files
            }
            Err(e) => {
                warn!("artifact collection failed: {e}");
                Vec::new()
            }
        }
    }

    fn confirm_manual_trigger(&self, step: &Step) -> bool {
        if !std::io::stdin().is_terminal() {
            return false;
        }

        println!("Step '{}' requires a manual trigger.", step.name);
        print!("Press enter to run step ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let mut line = String::new();
        std::io::BufRead::read_line(&mut std::io::stdin().lock(), &mut line).is_ok()
    }

    async fn pause_at_breakpoint(&self, ctx: &StepContext) {
        if !std::io::stdin().is_terminal() {
            debug!("breakpoint reached without a terminal, continuing");
            return;
        }

        info!("breakpoint");
        println!(
            "You can run a shell on the container with: docker exec -it {} sh",
            ctx.container_name
        );
        print!("Press enter to continue ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let _ = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let _ = std::io::BufRead::read_line(&mut std::io::stdin().lock(), &mut line);
        })
        .await;
    }

    async fn teardown(&self, resources: &mut StepResources) {
        // Services joined the step container's network namespace, so
        // they must go first.
        if let Some(handles) = resources.services.take() {
            self.deps.services.stop(handles).await;
        }

        if let Some(container_id) = resources.container_id.take() {
            info!("removing step container");
            if let Err(e) = self.deps.docker.remove_container(&container_id, true).await {
                warn!("failed to remove step container: {e}");
            }
        }

        if let Some(network) = resources.network.take() {
            if let Err(e) = self.deps.docker.remove_network(&network).await {
                warn!(network = %network, "failed to remove network: {e}");
            }
        }
    }

    fn persist_result(&self, ctx: &StepContext, result: &StepResult) {
        let path = ctx.meta_path();

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match serde_json::to_string_pretty(result) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&path, raw) {
                    warn!(path = %path.display(), "failed to persist step result: {e}");
                }
            }
            Err(e) => warn!("failed to serialise step result: {e}"),
        }
    }
}

/// Splits the output stream at group separators and injects per-command
/// timing lines, mirroring the traces the generated script emits.
#[derive(Default)]
struct TimingSplitter {
    last: Option<Instant>,
}

impl TimingSplitter {
    fn feed(&mut self, text: &str, sink: &LogSink) {
        let mut parts = text.split(GROUP_SEPARATOR);

        if let Some(first) = parts.next() {
            if !first.is_empty() {
                sink.out(first.to_string());
            }
        }

        for part in parts {
            self.emit_timing(sink);
            sink.out(part.to_string());
        }
    }

    fn finish(&mut self, sink: &LogSink) {
        self.emit_timing(sink);
    }

    fn emit_timing(&mut self, sink: &LogSink) {
        let now = Instant::now();

        if let Some(last) = self.last {
            sink.out(format!(
                "\n>>> Execution time: {:.3}s\n\n",
                (now - last).as_secs_f64()
            ));
        }

        self.last = Some(now);
    }
}

/// Resolves a step's service names against the pipeline definitions.
pub fn resolve_services(ctx: &StepContext) -> Result<Vec<(String, ServiceSpec)>, StepFailure> {
    let definitions = &ctx.run.spec.definitions.services;
    let mut resolved = Vec::with_capacity(ctx.step.services.len());

    for name in &ctx.step.services {
        match definitions.get(name) {
            Some(spec) => resolved.push((name.clone(), spec.clone())),
            None if name == "docker" => {
                // The docker service has a built-in definition.
                resolved.push((
                    name.clone(),
                    ServiceSpec {
                        image: None,
                        variables: BTreeMap::new(),
                        memory: 1024,
                        command: None,
                    },
                ));
            }
            None => {
                return Err(StepFailure::Services(format!("Invalid service: {name}")));
            }
        }
    }

    Ok(resolved)
}

/// The pipeline's cache definitions merged over the built-in defaults.
pub fn merged_cache_definitions(
    ctx: &StepContext,
) -> BTreeMap<String, crate::model::CacheSpec> {
    let mut merged: BTreeMap<String, crate::model::CacheSpec> =
        crate::config::default_cache_paths()
            .into_iter()
            .map(|(name, path)| {
                (
                    name.to_string(),
                    crate::model::CacheSpec::Path(path.to_string()),
                )
            })
            .collect();

    for (name, spec) in &ctx.run.spec.definitions.caches {
        merged.insert(name.clone(), spec.clone());
    }

    merged
}
