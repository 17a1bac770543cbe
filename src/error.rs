//! Error types for the pipeline runner.
//!
//! Each subsystem carries its own error enum:
//! - Pipeline file parsing and validation
//! - Docker daemon interaction
//! - Image resolution and pulls
//! - Volume, cache, and artifact management
//! - Service container lifecycle
//! - Variable resolution
//! - Run-level coordination
//!
//! Failures that happen *inside* a step are not errors at all: they are
//! captured as a [`StepFailure`] in the step's result and never cross the
//! executor boundary as `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading or validating the pipeline file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Pipeline file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse pipeline file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid pipeline definition: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the Docker daemon client.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Docker API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while resolving a container image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Failed to pull image '{reference}': {message}")]
    PullFailed { reference: String, message: String },

    #[error("Failed to resolve registry credentials for '{reference}': {message}")]
    Auth { reference: String, message: String },

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),
}

/// Errors raised by the volume and path manager.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Cache '{cache}' key file not found: {file}")]
    CacheKeyMissingFile { cache: String, file: String },

    #[error("Failed to copy project source: {0}")]
    SourceCopy(String),

    #[error("Invalid volume spec '{0}'")]
    InvalidVolumeSpec(String),

    #[error("SSH key not found: {0}")]
    SshKeyNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while starting or stopping service containers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid service: {0}")]
    UnknownService(String),

    #[error("Service '{name}' not ready: {message}")]
    NotReady { name: String, message: String },

    #[error(
        "Not enough memory to run all services. Requested: {requested}MiB / Available: {available}MiB"
    )]
    NotEnoughMemory { requested: u64, available: u64 },

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),
}

/// Errors raised during variable resolution and validation.
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("Required variable '{0}' was not supplied")]
    MissingRequired(String),

    #[error("Invalid value for {name}: {value}")]
    NotAllowed { name: String, value: String },

    #[error("Invalid env file: {0}")]
    InvalidEnvFile(String),

    #[error("Unable to read from stdin")]
    StdinClosed,
}

/// The reason a step did not succeed, recorded in its result.
///
/// Script failures carry the script's own exit code; infrastructure
/// failures are reported with a nominal exit code of 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepFailure {
    /// The user script exited with a nonzero code.
    ScriptFailed { exit_code: i64 },
    /// The step image could not be resolved or pulled.
    Image(String),
    /// The step container could not be created or started.
    ContainerStart(String),
    /// A service container failed to start or become ready.
    Services(String),
    /// Build directory, cache, or artifact plumbing failed.
    Volumes(String),
    /// The step exceeded its max-time budget.
    TimedOut { seconds: u64 },
    /// The run was cancelled while the step was in flight.
    Cancelled,
    /// Anything else; a bug in the runner rather than the pipeline.
    Internal(String),
}

impl StepFailure {
    /// The exit code recorded for this failure.
    pub fn exit_code(&self) -> i64 {
        match self {
            StepFailure::ScriptFailed { exit_code } => *exit_code,
            _ => 1,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::ScriptFailed { exit_code } => {
                write!(f, "script exited with code {exit_code}")
            }
            StepFailure::Image(msg) => write!(f, "image error: {msg}"),
            StepFailure::ContainerStart(msg) => write!(f, "container start error: {msg}"),
            StepFailure::Services(msg) => write!(f, "service error: {msg}"),
            StepFailure::Volumes(msg) => write!(f, "volume error: {msg}"),
            StepFailure::TimedOut { seconds } => write!(f, "timed out after {seconds}s"),
            StepFailure::Cancelled => write!(f, "cancelled"),
            StepFailure::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

/// Errors that abort a run before or between steps.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid pipeline: {name}. Available pipelines: {}", .available.join(", "))]
    InvalidPipeline { name: String, available: Vec<String> },

    #[error("Invalid step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failure_exit_codes() {
        assert_eq!(StepFailure::ScriptFailed { exit_code: 69 }.exit_code(), 69);
        assert_eq!(StepFailure::Cancelled.exit_code(), 1);
        assert_eq!(StepFailure::Image("gone".into()).exit_code(), 1);
    }

    #[test]
    fn test_step_failure_display() {
        let failure = StepFailure::ScriptFailed { exit_code: 2 };
        assert_eq!(failure.to_string(), "script exited with code 2");

        let failure = StepFailure::TimedOut { seconds: 120 };
        assert!(failure.to_string().contains("120s"));
    }

    #[test]
    fn test_step_failure_roundtrips_through_json() {
        let failure = StepFailure::Services("postgres exited early".into());
        let json = serde_json::to_string(&failure).unwrap();
        let back: StepFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(failure, back);
    }

    #[test]
    fn test_invalid_pipeline_lists_alternatives() {
        let err = RunError::InvalidPipeline {
            name: "custom.nope".into(),
            available: vec!["custom.build".into(), "default".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("custom.nope"));
        assert!(msg.contains("custom.build"));
    }
}
