//! Command-line interface for pipeline-forge.
//!
//! Provides the `run`, `list`, `parse`, and `cache` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
