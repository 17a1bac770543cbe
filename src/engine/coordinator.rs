//! Pipeline coordination: walking step groups, threading artifacts
//! forward, and handling cancellation.
//!
//! Sequential steps stop the pipeline on failure. Parallel groups are
//! serialised in declared order (a documented limitation): every sibling
//! runs, the group reports the last nonzero exit code, and
//! `BITBUCKET_PARALLEL_STEP` / `BITBUCKET_PARALLEL_STEP_COUNT` are still
//! set per step. Artifacts from any step are visible to all subsequent
//! steps.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::{ParallelInfo, RunContext, StepContext};
use crate::engine::docker::DockerClient;
use crate::engine::image::{ImageProvider, RegistryAuthProvider};
use crate::engine::service::ServiceRuntime;
use crate::engine::step::{
    resolve_services, ExecutorDeps, Shutdown, StepExecutor, StepResult, StepStatus,
};
use crate::engine::volumes::VolumeManager;
use crate::error::RunError;
use crate::model::{GroupMode, StepGroup};
use crate::oidc::OidcSigner;
use crate::utils::ensure_directory;
use crate::variables::DeploymentVariablesProvider;

/// The outcome of a whole pipeline run.
#[derive(Debug, Serialize)]
pub struct RunResult {
    pub exit_code: i64,
    pub build_number: u64,
    pub pipeline_uuid: Uuid,
    pub steps: Vec<StepResult>,
}

impl RunResult {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Appends run-level lines to `pipeline.log` and the terminal.
struct RunLog {
    file: std::fs::File,
}

impl RunLog {
    fn create(path: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self {
            file: std::fs::File::create(path)?,
        })
    }

    fn line(&mut self, message: &str) {
        use std::io::Write;

        println!("{message}");
        let _ = writeln!(self.file, "{message}");
    }
}

/// Walks the ordered step groups of one pipeline.
pub struct PipelineCoordinator {
    ctx: Arc<RunContext>,
    executor: StepExecutor,
    volumes: Arc<VolumeManager>,
    shutdown: broadcast::Sender<Shutdown>,
    cancelled: Arc<AtomicBool>,
}

impl PipelineCoordinator {
    pub fn new(
        ctx: Arc<RunContext>,
        auth: Arc<dyn RegistryAuthProvider>,
        oidc_signer: Option<Arc<dyn OidcSigner>>,
        deployment_vars: Option<Arc<dyn DeploymentVariablesProvider>>,
    ) -> Result<Self, RunError> {
        let docker = Arc::new(DockerClient::new()?);
        let images = Arc::new(ImageProvider::new(
            docker.clone(),
            auth,
            ctx.config.docker_platform.clone(),
        ));
        let volumes = Arc::new(VolumeManager::new(
            docker.clone(),
            ctx.cache_dir(),
            ctx.project.slug.clone(),
            ctx.repository_path.clone(),
        ));
        let services = Arc::new(ServiceRuntime::new(
            docker.clone(),
            images.clone(),
            ctx.config.clone(),
        ));

        let (shutdown, _) = broadcast::channel(4);
        let cancelled = Arc::new(AtomicBool::new(false));

        let executor = StepExecutor::new(ExecutorDeps {
            docker,
            images,
            volumes: volumes.clone(),
            services,
            config: ctx.config.clone(),
            oidc_signer,
            deployment_vars,
            shutdown: shutdown.clone(),
            cancelled: cancelled.clone(),
        });

        Ok(Self {
            ctx,
            executor,
            volumes,
            shutdown,
            cancelled,
        })
    }

    /// Runs the pipeline to completion. Volume allocations are released
    /// on every exit path.
    pub async fn run(self) -> Result<RunResult, RunError> {
        let groups = self.ctx.pipeline.step_groups();
        self.validate_groups(&groups)?;

        ensure_directory(&self.ctx.run_dir())?;
        let mut log = RunLog::create(&self.ctx.pipeline_log_path())?;

        info!(
            pipeline = %self.ctx.pipeline_name,
            uuid = %self.ctx.pipeline_uuid,
            build = self.ctx.project.build_number,
            "running pipeline"
        );

        self.spawn_signal_listener();

        let started = std::time::Instant::now();
        let outcome = self.run_groups(&groups, &mut log).await;

        // Allocations release in LIFO order whatever happened above.
        self.volumes.release_all().await;

        let (exit_code, steps) = outcome?;

        let elapsed = started.elapsed().as_secs_f64();
        if exit_code == 0 {
            log.line(&format!(
                "Pipeline '{}': Successful in {elapsed:.3}s",
                self.ctx.pipeline_name
            ));
        } else {
            log.line(&format!(
                "Pipeline '{}': Failed in {elapsed:.3}s",
                self.ctx.pipeline_name
            ));
        }

        Ok(RunResult {
            exit_code,
            build_number: self.ctx.project.build_number,
            pipeline_uuid: self.ctx.pipeline_uuid,
            steps,
        })
    }

    /// References to undefined services abort the run before any
    /// container starts.
    fn validate_groups(&self, groups: &[StepGroup]) -> Result<(), RunError> {
        for group in groups {
            for (step_index, step) in group.steps.iter().enumerate() {
                let probe = StepContext::new(
                    self.ctx.clone(),
                    step.clone(),
                    group.index,
                    step_index,
                    None,
                );

                resolve_services(&probe).map_err(|e| RunError::InvalidStep {
                    step: step.name.clone(),
                    message: e.to_string(),
                })?;
            }
        }

        Ok(())
    }

    fn spawn_signal_listener(&self) {
        let shutdown = self.shutdown.clone();
        let cancelled = self.cancelled.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }

            warn!("cancellation requested, stopping containers with a grace period");
            cancelled.store(true, Ordering::SeqCst);
            let _ = shutdown.send(Shutdown::Graceful);

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("force cancellation requested");
                let _ = shutdown.send(Shutdown::Force);
            }
        });
    }

    async fn run_groups(
        &self,
        groups: &[StepGroup],
        log: &mut RunLog,
    ) -> Result<(i64, Vec<StepResult>), RunError> {
        let mut results: Vec<StepResult> = Vec::new();
        let mut artifact_stores: Vec<PathBuf> = Vec::new();
        let mut exit_code = 0i64;

        'groups: for group in groups {
            let parallel_count = group.steps.len();

            for (step_index, step) in group.steps.iter().enumerate() {
                if self.cancelled.load(Ordering::SeqCst) {
                    log.line("Run cancelled");
                    exit_code = 1;
                    break 'groups;
                }

                let parallel = match group.mode {
                    GroupMode::Parallel => Some(ParallelInfo {
                        index: step_index,
                        count: parallel_count,
                    }),
                    GroupMode::Sequential => None,
                };

                let ctx = StepContext::new(
                    self.ctx.clone(),
                    step.clone(),
                    group.index,
                    step_index,
                    parallel,
                );

                if !self.step_selected(&step.name) {
                    info!(step = %step.name, "skipping step");
                    let now = chrono::Utc::now();
                    results.push(StepResult {
                        step_id: ctx.step_id.clone(),
                        name: step.name.clone(),
                        status: StepStatus::Skipped,
                        exit_code: None,
                        started_at: now,
                        ended_at: now,
                        artifacts: Vec::new(),
                        caches: std::collections::BTreeMap::new(),
                        failure: None,
                    });
                    continue;
                }

                let result = self.executor.execute(&ctx, &artifact_stores).await;

                match result.status {
                    StepStatus::NotTriggered => {
                        log.line(&format!(
                            "Step '{}' skipped: waiting for a manual trigger",
                            result.name
                        ));
                        results.push(result);
                        break 'groups;
                    }
                    StepStatus::Succeeded => {
                        log.line(&format!("Step '{}': Successful", result.name));

                        if !result.artifacts.is_empty() {
                            artifact_stores.push(ctx.artifacts_dir());
                        }
                        results.push(result);
                    }
                    StepStatus::Failed => {
                        let reason = result
                            .failure
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "unknown".to_string());
                        log.line(&format!("Step '{}' failed: {reason}", result.name));
                        error!(step = %result.name, "step failed");

                        exit_code = result.exit_code.unwrap_or(1);

                        let cancelled = matches!(
                            result.failure,
                            Some(crate::error::StepFailure::Cancelled)
                        );
                        results.push(result);

                        if cancelled {
                            break 'groups;
                        }

                        match group.mode {
                            // A failed sequential step stops the pipeline.
                            GroupMode::Sequential => break 'groups,
                            // Parallel siblings still run; the pipeline
                            // stops after the group.
                            GroupMode::Parallel => continue,
                        }
                    }
                    StepStatus::Skipped => {
                        results.push(result);
                    }
                }
            }

            if exit_code != 0 {
                break;
            }
        }

        Ok((exit_code, results))
    }

    fn step_selected(&self, name: &str) -> bool {
        self.ctx.selected_steps.is_empty()
            || self.ctx.selected_steps.iter().any(|s| s == name)
    }
}
