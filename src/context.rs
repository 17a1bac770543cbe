//! Per-invocation identity and directory layout.
//!
//! A [`RunContext`] is built once per invocation and threaded explicitly
//! through every engine operation: project and workspace metadata, git
//! state, the selected pipeline, resolved variables, and the directory
//! tree all derive from it. There is no ambient state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::RunError;
use crate::model::{ImageSpec, Pipeline, PipelineSpec, Step};
use crate::utils::{ensure_directory, hashify_path, slugify};
use crate::variables::Variable;

/// Persistent per-project metadata, kept under the data root.
///
/// The build number increases monotonically on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    pub path_slug: String,
    pub slug: String,
    pub key: String,
    pub project_uuid: Uuid,
    pub repo_uuid: Uuid,
    pub build_number: u64,
}

impl ProjectMetadata {
    /// Loads metadata for `project_path`, creating it on first run, and
    /// bumps the build number.
    pub fn load_and_bump(data_root: &Path, project_path: &Path) -> Result<Self, RunError> {
        let path_slug = hashify_path(project_path);
        let project_dir = data_root.join(&path_slug);
        ensure_directory(&project_dir)?;

        let meta_file = project_dir.join("meta.json");

        let mut meta = if meta_file.exists() {
            let raw = std::fs::read_to_string(&meta_file)?;
            serde_json::from_str(&raw)
                .map_err(|e| RunError::Internal(format!("corrupt project metadata: {e}")))?
        } else {
            let name = project_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string());
            let slug = slugify(&name);
            let key: String = slug
                .split('-')
                .filter_map(|part| part.chars().next())
                .map(|c| c.to_ascii_uppercase())
                .collect();

            Self {
                name,
                path_slug: path_slug.clone(),
                slug,
                key,
                project_uuid: Uuid::new_v4(),
                repo_uuid: Uuid::new_v4(),
                build_number: 0,
            }
        };

        meta.build_number += 1;

        let raw = serde_json::to_string_pretty(&meta)
            .map_err(|e| RunError::Internal(format!("serialising project metadata: {e}")))?;
        std::fs::write(&meta_file, raw)?;

        Ok(meta)
    }
}

/// Workspace-level metadata shared by all projects under the data root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    pub workspace_uuid: Uuid,
    pub owner_uuid: Uuid,
}

impl WorkspaceMetadata {
    pub fn load(data_root: &Path) -> Result<Self, RunError> {
        ensure_directory(data_root)?;
        let meta_file = data_root.join("workspace.json");

        if meta_file.exists() {
            let raw = std::fs::read_to_string(&meta_file)?;
            return serde_json::from_str(&raw)
                .map_err(|e| RunError::Internal(format!("corrupt workspace metadata: {e}")));
        }

        let meta = Self {
            workspace_uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
        };

        let raw = serde_json::to_string_pretty(&meta)
            .map_err(|e| RunError::Internal(format!("serialising workspace metadata: {e}")))?;
        std::fs::write(&meta_file, raw)?;

        Ok(meta)
    }
}

/// Git state of the project at run start.
#[derive(Debug, Clone)]
pub struct GitInfo {
    pub branch: String,
    pub commit: String,
}

impl GitInfo {
    /// Reads the current branch and commit from the repository.
    pub async fn detect(repository_path: &Path) -> Result<Self, RunError> {
        let branch = git_output(repository_path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let commit = git_output(repository_path, &["rev-parse", "HEAD"]).await?;

        Ok(Self { branch, commit })
    }
}

async fn git_output(repository_path: &Path, args: &[&str]) -> Result<String, RunError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repository_path)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        return Err(RunError::Internal(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Everything a run needs to know about itself.
#[derive(Debug)]
pub struct RunContext {
    pub config: RunnerConfig,
    pub repository_path: PathBuf,
    pub project: ProjectMetadata,
    pub workspace: WorkspaceMetadata,
    pub git: GitInfo,

    pub spec: PipelineSpec,
    pub pipeline_name: String,
    pub pipeline: Pipeline,
    pub pipeline_uuid: Uuid,
    pub start_time: DateTime<Utc>,

    /// Pipeline-declared variables with their resolved values.
    pub pipeline_variables: Vec<Variable>,
    /// Variables supplied by the user (flags, `.env`, env files).
    pub user_variables: Vec<Variable>,
    /// Step names to run; empty means all.
    pub selected_steps: Vec<String>,
}

impl RunContext {
    /// Root of this run's output tree:
    /// `<data-root>/<project-slug>/<build-number>`.
    pub fn run_dir(&self) -> PathBuf {
        self.config
            .data_root
            .join(&self.project.path_slug)
            .join(self.project.build_number.to_string())
    }

    pub fn pipeline_log_path(&self) -> PathBuf {
        self.run_dir().join("pipeline.log")
    }

    /// Root of this project's cache directories.
    pub fn cache_dir(&self) -> PathBuf {
        self.config
            .cache_root
            .join(&self.project.path_slug)
            .join("caches")
    }

    /// Values that must be masked in every log line.
    pub fn secret_values(&self) -> Vec<String> {
        self.pipeline_variables
            .iter()
            .chain(self.user_variables.iter())
            .filter(|v| v.secret && !v.value.is_empty())
            .map(|v| v.value.clone())
            .collect()
    }

    /// The image a step runs with: step override, then pipeline default,
    /// then the built-in default image.
    pub fn effective_image(&self, step: &Step) -> ImageSpec {
        step.image
            .clone()
            .or_else(|| self.spec.image.clone())
            .unwrap_or_else(|| ImageSpec::from_name(crate::config::DEFAULT_IMAGE))
    }
}

/// Position of a step inside a parallel group.
#[derive(Debug, Clone, Copy)]
pub struct ParallelInfo {
    pub index: usize,
    pub count: usize,
}

/// Per-step identity and directory layout, derived deterministically from
/// the run.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run: Arc<RunContext>,
    pub step: Step,
    pub group_index: usize,
    pub step_index: usize,
    pub parallel: Option<ParallelInfo>,
    pub step_uuid: Uuid,
    /// `<project-slug>-<build-number>-<group-index>-<step-index>-<name-slug>`.
    pub step_id: String,
    /// Step id plus a short random suffix; docker container name.
    pub container_name: String,
}

impl StepContext {
    pub fn new(
        run: Arc<RunContext>,
        step: Step,
        group_index: usize,
        step_index: usize,
        parallel: Option<ParallelInfo>,
    ) -> Self {
        let step_id = format!(
            "{}-{}-{}-{}-{}",
            run.project.slug,
            run.project.build_number,
            group_index,
            step_index,
            slugify(&step.name),
        );

        let suffix: u32 = rand::thread_rng().gen_range(0x100000..0xffffff);
        let container_name = format!("{step_id}-{suffix:06x}");

        debug!(step_id = %step_id, container = %container_name, "derived step identity");

        Self {
            run,
            step,
            group_index,
            step_index,
            parallel,
            step_uuid: Uuid::new_v4(),
            step_id,
            container_name,
        }
    }

    /// `<run-dir>/steps/<step-id>`.
    pub fn step_dir(&self) -> PathBuf {
        self.run.run_dir().join("steps").join(&self.step_id)
    }

    /// Host directory mounted as the container's working directory.
    pub fn build_dir(&self) -> PathBuf {
        self.step_dir().join("build")
    }

    /// Host directory collecting this step's artifacts.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.step_dir().join("artifacts")
    }

    pub fn services_log_dir(&self) -> PathBuf {
        self.step_dir().join("services")
    }

    pub fn script_log_path(&self) -> PathBuf {
        self.step_dir().join("script.log")
    }

    pub fn after_script_log_path(&self) -> PathBuf {
        self.step_dir().join("after-script.log")
    }

    pub fn container_log_path(&self) -> PathBuf {
        self.step_dir().join("container.log")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.step_dir().join("meta.json")
    }

    pub fn network_name(&self) -> String {
        format!("{}-network", self.step_id)
    }

    pub fn effective_image(&self) -> ImageSpec {
        self.run.effective_image(&self.step)
    }

    /// The uid the step container runs as; root unless the image says
    /// otherwise.
    pub fn run_as_user(&self) -> String {
        self.effective_image()
            .run_as_user
            .unwrap_or_else(|| "0".to_string())
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse::parse_pipeline_str;

    fn test_run_context(dir: &Path) -> RunContext {
        let spec = parse_pipeline_str(
            r#"
pipelines:
  custom:
    smoke:
      - step:
          name: Lint and test
          script: [whoami]
"#,
        )
        .unwrap();
        let pipeline = spec.pipelines.get("custom.smoke").unwrap().clone();

        RunContext {
            config: RunnerConfig {
                data_root: dir.join("data"),
                cache_root: dir.join("cache"),
                ..RunnerConfig::default()
            },
            repository_path: dir.to_path_buf(),
            project: ProjectMetadata {
                name: "demo".into(),
                path_slug: "demo-abc12345".into(),
                slug: "demo".into(),
                key: "D".into(),
                project_uuid: Uuid::new_v4(),
                repo_uuid: Uuid::new_v4(),
                build_number: 7,
            },
            workspace: WorkspaceMetadata {
                workspace_uuid: Uuid::new_v4(),
                owner_uuid: Uuid::new_v4(),
            },
            git: GitInfo {
                branch: "main".into(),
                commit: "deadbeef".into(),
            },
            spec,
            pipeline_name: "custom.smoke".into(),
            pipeline,
            pipeline_uuid: Uuid::new_v4(),
            start_time: Utc::now(),
            pipeline_variables: Vec::new(),
            user_variables: Vec::new(),
            selected_steps: Vec::new(),
        }
    }

    #[test]
    fn test_project_metadata_build_number_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("my-app");
        std::fs::create_dir_all(&project).unwrap();

        let first = ProjectMetadata::load_and_bump(dir.path(), &project).unwrap();
        let second = ProjectMetadata::load_and_bump(dir.path(), &project).unwrap();

        assert_eq!(first.build_number, 1);
        assert_eq!(second.build_number, 2);
        assert_eq!(first.project_uuid, second.project_uuid);
        assert_eq!(first.slug, "my-app");
        assert_eq!(first.key, "MA");
    }

    #[test]
    fn test_workspace_metadata_is_stable() {
        let dir = tempfile::tempdir().unwrap();

        let first = WorkspaceMetadata::load(dir.path()).unwrap();
        let second = WorkspaceMetadata::load(dir.path()).unwrap();

        assert_eq!(first.workspace_uuid, second.workspace_uuid);
        assert_eq!(first.owner_uuid, second.owner_uuid);
    }

    #[test]
    fn test_step_id_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let run = Arc::new(test_run_context(dir.path()));
        let step = run.pipeline.step_groups()[0].steps[0].clone();

        let ctx = StepContext::new(run, step, 0, 0, None);

        assert_eq!(ctx.step_id, "demo-7-0-0-lint-and-test");
        assert!(ctx.container_name.starts_with("demo-7-0-0-lint-and-test-"));
        assert_ne!(ctx.container_name, ctx.step_id);
    }

    #[test]
    fn test_step_directories_live_under_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let run = Arc::new(test_run_context(dir.path()));
        let step = run.pipeline.step_groups()[0].steps[0].clone();
        let run_dir = run.run_dir();

        let ctx = StepContext::new(run, step, 1, 2, None);

        assert!(ctx.build_dir().starts_with(&run_dir));
        assert!(ctx.meta_path().ends_with("steps/demo-7-1-2-lint-and-test/meta.json"));
    }

    #[test]
    fn test_run_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run_context(dir.path());

        let run_dir = run.run_dir();
        assert!(run_dir.ends_with("demo-abc12345/7"));
        assert_eq!(run.pipeline_log_path(), run_dir.join("pipeline.log"));
        assert!(run.cache_dir().ends_with("demo-abc12345/caches"));
    }

    #[test]
    fn test_effective_image_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run_context(dir.path());
        let step = run.pipeline.step_groups()[0].steps[0].clone();

        assert_eq!(
            run.effective_image(&step).name,
            crate::config::DEFAULT_IMAGE
        );
    }
}
