//! CLI command definitions for pipeline-forge.
//!
//! `run` executes a pipeline by its dotted name, `list` and `parse`
//! inspect the pipeline file, and `cache` manages the persistent cache
//! directories.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::context::{GitInfo, ProjectMetadata, RunContext, WorkspaceMetadata};
use crate::engine::{DefaultAuthProvider, PipelineCoordinator};
use crate::error::RunError;
use crate::model::parse::{parse_pipeline_file, PIPELINE_FILE_NAME};
use crate::variables::{load_user_variables, resolve_declared};

/// Process exit code for invalid invocations.
const EXIT_INVALID: i32 = 2;

/// Run Bitbucket Pipelines locally against the Docker daemon.
#[derive(Parser)]
#[command(name = "pipeline-forge")]
#[command(about = "Run Bitbucket Pipelines locally")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pipeline by its full name, e.g. `custom.deploy` or
    /// `branches.main`.
    Run(RunArgs),

    /// List the pipelines available in the pipeline file.
    List(ListArgs),

    /// Parse the pipeline file and print the model.
    Parse(ParseArgs),

    /// Inspect or clear the persistent cache directories.
    Cache(CacheArgs),
}

/// Arguments for `pipeline-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Full name of the pipeline to run, e.g. `custom.deploy`.
    pub pipeline: Option<String>,

    /// Path to the git repository. Defaults to the current directory.
    #[arg(short, long)]
    pub repository_path: Option<PathBuf>,

    /// Steps to run; all steps when none are given. Repeatable.
    #[arg(short = 's', long = "step")]
    pub steps: Vec<String>,

    /// Env files to load, in order. Repeatable.
    #[arg(short = 'e', long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Pipeline variables, KEY=VALUE. Repeatable.
    #[arg(long = "var")]
    pub vars: Vec<String>,

    /// Enforce CPU limits on step containers.
    #[arg(long)]
    pub cpu_limits: bool,

    /// Expose the local ssh agent to step containers.
    #[arg(long = "ssh")]
    pub expose_ssh_agent: bool,

    /// Extra bind mounts, docker --volume syntax. Repeatable.
    #[arg(long = "volume")]
    pub volumes: Vec<String>,
}

/// Arguments for `pipeline-forge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Path to the git repository. Defaults to the current directory.
    #[arg(short, long)]
    pub repository_path: Option<PathBuf>,
}

/// Arguments for `pipeline-forge parse`.
#[derive(Parser, Debug)]
pub struct ParseArgs {
    /// Pipeline to print; the whole model when omitted.
    pub pipeline: Option<String>,

    /// Path to the git repository. Defaults to the current directory.
    #[arg(short, long)]
    pub repository_path: Option<PathBuf>,
}

/// Arguments for `pipeline-forge cache`.
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(clap::Subcommand, Debug)]
pub enum CacheAction {
    /// List cached projects.
    List,
    /// Delete every cache directory.
    Clear,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Entry point used by `main`; returns the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::List(args) => cmd_list(args),
        Commands::Parse(args) => cmd_parse(args),
        Commands::Cache(args) => cmd_cache(args),
    }
}

fn repository_path(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = arg.unwrap_or_else(|| PathBuf::from("."));
    Ok(std::fs::canonicalize(path)?)
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = RunnerConfig::from_env()?;
    if args.cpu_limits {
        config.cpu_limits = true;
    }
    if args.expose_ssh_agent {
        config.expose_ssh_agent = true;
    }
    if !args.volumes.is_empty() {
        config.set_volumes(args.volumes.clone())?;
    }

    let repository_path = repository_path(args.repository_path)?;
    let pipeline_file = repository_path.join(PIPELINE_FILE_NAME);

    let spec = match parse_pipeline_file(&pipeline_file) {
        Ok(spec) => spec,
        Err(e) => {
            error!("{e}");
            return Ok(EXIT_INVALID);
        }
    };

    let Some(pipeline_name) = args.pipeline else {
        error!("pipeline not specified");
        print_available(&spec.pipelines.available());
        return Ok(EXIT_INVALID);
    };

    let Some(pipeline) = spec.pipelines.get(&pipeline_name).cloned() else {
        let err = RunError::InvalidPipeline {
            name: pipeline_name,
            available: spec.pipelines.available(),
        };
        error!("{err}");
        return Ok(EXIT_INVALID);
    };

    // Variables resolve before any container starts.
    let var_flags = parse_var_flags(&args.vars)?;
    let user_variables =
        match load_user_variables(&repository_path, &args.env_files, &var_flags) {
            Ok(vars) => vars,
            Err(e) => {
                error!("{e}");
                return Ok(EXIT_INVALID);
            }
        };

    let supplied: BTreeMap<String, String> = user_variables
        .iter()
        .map(|v| (v.name.clone(), v.value.clone()))
        .collect();

    let interactive = std::io::stdin().is_terminal();
    let pipeline_variables =
        match resolve_declared(pipeline.variables(), &supplied, interactive) {
            Ok(vars) => vars,
            Err(e) => {
                error!("{e}");
                return Ok(EXIT_INVALID);
            }
        };

    let workspace = WorkspaceMetadata::load(&config.data_root)?;
    let project = ProjectMetadata::load_and_bump(&config.data_root, &repository_path)?;
    let git = GitInfo::detect(&repository_path).await?;

    let ctx = Arc::new(RunContext {
        config,
        repository_path,
        project,
        workspace,
        git,
        spec,
        pipeline_name: pipeline_name.clone(),
        pipeline,
        pipeline_uuid: Uuid::new_v4(),
        start_time: Utc::now(),
        pipeline_variables,
        user_variables,
        selected_steps: args.steps,
    });

    let coordinator = PipelineCoordinator::new(
        ctx.clone(),
        Arc::new(DefaultAuthProvider),
        None,
        None,
    )?;

    match coordinator.run().await {
        Ok(result) => {
            if result.ok() {
                info!(pipeline = %pipeline_name, "pipeline successful");
                Ok(0)
            } else {
                error!(pipeline = %pipeline_name, "pipeline failed");
                Ok(1)
            }
        }
        Err(e @ (RunError::InvalidPipeline { .. } | RunError::Variable(_))) => {
            error!("{e}");
            Ok(EXIT_INVALID)
        }
        Err(e) => {
            error!("error running pipeline: {e}");
            Ok(1)
        }
    }
}

fn cmd_list(args: ListArgs) -> anyhow::Result<i32> {
    let repository_path = repository_path(args.repository_path)?;

    match parse_pipeline_file(&repository_path.join(PIPELINE_FILE_NAME)) {
        Ok(spec) => {
            print_available(&spec.pipelines.available());
            Ok(0)
        }
        Err(e) => {
            error!("{e}");
            Ok(EXIT_INVALID)
        }
    }
}

fn cmd_parse(args: ParseArgs) -> anyhow::Result<i32> {
    let repository_path = repository_path(args.repository_path)?;

    let spec = match parse_pipeline_file(&repository_path.join(PIPELINE_FILE_NAME)) {
        Ok(spec) => spec,
        Err(e) => {
            error!("{e}");
            return Ok(EXIT_INVALID);
        }
    };

    match args.pipeline {
        Some(name) => match spec.pipelines.get(&name) {
            Some(pipeline) => {
                println!("{}", serde_json::to_string_pretty(pipeline)?);
                Ok(0)
            }
            None => {
                error!("invalid pipeline: {name}");
                print_available(&spec.pipelines.available());
                Ok(EXIT_INVALID)
            }
        },
        None => {
            println!("{}", serde_json::to_string_pretty(&spec)?);
            Ok(0)
        }
    }
}

fn cmd_cache(args: CacheArgs) -> anyhow::Result<i32> {
    let config = RunnerConfig::from_env()?;

    if !config.cache_root.is_dir() {
        return Ok(0);
    }

    let mut projects: Vec<PathBuf> = std::fs::read_dir(&config.cache_root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    projects.sort();

    match args.action {
        CacheAction::List => {
            println!("Caches:");
            for project in projects {
                if let Some(name) = project.file_name() {
                    println!("\t{}", name.to_string_lossy());
                }
            }
        }
        CacheAction::Clear => {
            for project in projects {
                std::fs::remove_dir_all(&project)?;
            }
        }
    }

    Ok(0)
}

fn parse_var_flags(flags: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    flags
        .iter()
        .map(|flag| {
            flag.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("invalid --var value (expected KEY=VALUE): {flag}"))
        })
        .collect()
}

fn print_available(pipelines: &[String]) {
    let mut sorted = pipelines.to_vec();
    sorted.sort();

    println!("Available pipelines:");
    for name in sorted {
        println!("\t{name}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_flags() {
        let flags = vec!["FOO=bar".to_string(), "EMPTY=".to_string()];
        let parsed = parse_var_flags(&flags).unwrap();

        assert_eq!(
            parsed,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_var_flags_rejects_missing_equals() {
        assert!(parse_var_flags(&["NOPE".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::parse_from([
            "pipeline-forge",
            "run",
            "custom.deploy",
            "--step",
            "build",
            "--var",
            "ENV=dev",
            "--cpu-limits",
        ]);

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        assert_eq!(args.pipeline.as_deref(), Some("custom.deploy"));
        assert_eq!(args.steps, vec!["build"]);
        assert_eq!(args.vars, vec!["ENV=dev"]);
        assert!(args.cpu_limits);
        assert!(!args.expose_ssh_agent);
    }

    #[test]
    fn test_cli_parses_cache_subcommand() {
        let cli = Cli::parse_from(["pipeline-forge", "cache", "clear"]);

        let Commands::Cache(args) = cli.command else {
            panic!("expected cache command");
        };

        assert!(matches!(args.action, CacheAction::Clear));
    }
}
