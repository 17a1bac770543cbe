//! pipeline-forge: run Bitbucket Pipelines locally.
//!
//! Reads a `bitbucket-pipelines.yml` from a working directory,
//! materialises the requested pipeline as container-backed steps,
//! streams their output, and persists logs, artifacts, and caches to
//! stable on-disk locations.

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod model;
pub mod oidc;
pub mod utils;
pub mod variables;

pub use error::{
    DockerError, ImageError, ParseError, RunError, ServiceError, StepFailure, VariableError,
    VolumeError,
};
