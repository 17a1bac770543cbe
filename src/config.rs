//! Runner configuration.
//!
//! All knobs live in a single [`RunnerConfig`] value built from the
//! environment (prefix `PIPELINE_RUNNER_`) and overridden by CLI flags.
//! The config is threaded explicitly through the run; there is no global
//! state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// Image used when neither the step nor the pipeline declares one.
pub const DEFAULT_IMAGE: &str = "atlassian/default-image:latest";

/// Image backing the `docker` service when the pipeline does not override it.
pub const DEFAULT_DOCKER_SERVICE_IMAGE: &str = "docker:27-dind";

/// In-container directory layout. The build directory doubles as the
/// working directory and `BITBUCKET_CLONE_DIR`.
pub const REMOTE_PIPELINE_DIR: &str = "/opt/atlassian/pipelines/agent";
pub const BUILD_DIR: &str = "/opt/atlassian/pipelines/agent/build";
pub const SCRIPTS_DIR: &str = "/opt/atlassian/pipelines/agent/scripts";
pub const TEMP_DIR: &str = "/opt/atlassian/pipelines/agent/temp";
pub const SSH_KEY_DIR: &str = "/opt/atlassian/pipelines/agent/ssh";

/// Where the Docker-in-Docker daemon socket lives, shared between the
/// `docker` service and the step container through a named volume.
pub const DOCKER_SOCKET_DIR: &str = "/var/run";
pub const DOCKER_HOST_SOCKET: &str = "unix:///var/run/docker.sock";

/// Cache paths preconfigured by the hosted product.
pub fn default_cache_paths() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("composer", "~/.composer/cache"),
        ("dotnetcore", "~/.nuget/packages"),
        ("gradle", "~/.gradle/caches"),
        ("ivy2", "~/.ivy2/cache"),
        ("maven", "~/.m2/repository"),
        ("node", "node_modules"),
        ("pip", "~/.cache/pip"),
        ("sbt", "~/.sbt"),
    ])
}

/// Errors that can occur while building the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A volume spec does not follow the `host[:container[:mode]]` syntax.
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// The user's home directory could not be determined.
    #[error("Unable to determine the user home directory")]
    NoHomeDirectory,
}

/// OIDC settings; disabled by default. The token itself is produced by an
/// external signer, the runner only injects it.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub enabled: bool,
    pub issuer: String,
    pub audience: String,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: "https://example.org".to_string(),
            audience: "rogueconsulting::pipeline-forge".to_string(),
        }
    }
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Enforce CPU limits on step containers.
    pub cpu_limits: bool,
    /// Bind-mount the local SSH agent socket into step containers.
    pub expose_ssh_agent: bool,
    /// Extra bind mounts, docker `--volume` syntax.
    pub volumes: Vec<String>,
    /// Reported as `BITBUCKET_REPO_OWNER`.
    pub username: String,

    /// Memory budget for one `1x` step, services included (MiB).
    pub total_memory_limit_mb: u64,
    /// Memory that must remain for the build container after services (MiB).
    pub build_container_minimum_memory_mb: u64,
    /// Default memory reservation for a service container (MiB).
    pub service_default_memory_mb: u64,
    /// CPU cores granted to a `1x` step when CPU limits are enforced.
    pub cpus_per_size: f64,

    /// Root of the run output trees (logs, artifacts, step results).
    pub data_root: PathBuf,
    /// Root of the persistent cache directories.
    pub cache_root: PathBuf,

    /// Platform override applied to step images only (e.g. `linux/amd64`).
    pub docker_platform: Option<String>,

    /// Private key copied into the step's SSH material directory.
    pub ssh_identity_file: Option<PathBuf>,

    pub oidc: OidcSettings,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cpu_limits: false,
            expose_ssh_agent: false,
            volumes: Vec::new(),
            username: whoami(),
            total_memory_limit_mb: 4096,
            build_container_minimum_memory_mb: 1024,
            service_default_memory_mb: 1024,
            cpus_per_size: 4.0,
            data_root: PathBuf::from(".pipeline-forge/data"),
            cache_root: PathBuf::from(".pipeline-forge/cache"),
            docker_platform: None,
            ssh_identity_file: None,
            oidc: OidcSettings::default(),
        }
    }
}

impl RunnerConfig {
    /// Builds a configuration from `PIPELINE_RUNNER_*` environment
    /// variables, with XDG-style defaults for the data and cache roots.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            data_root: default_data_root()?,
            cache_root: default_cache_root()?,
            ..Self::default()
        };

        if let Some(v) = env_flag("PIPELINE_RUNNER_CPU_LIMITS")? {
            config.cpu_limits = v;
        }

        if let Some(v) = env_flag("PIPELINE_RUNNER_EXPOSE_SSH_AGENT")? {
            config.expose_ssh_agent = v;
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_TOTAL_MEMORY_LIMIT") {
            config.total_memory_limit_mb =
                v.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "PIPELINE_RUNNER_TOTAL_MEMORY_LIMIT".into(),
                    message: format!("not a number: {v}"),
                })?;
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_DATA_DIR") {
            config.data_root = PathBuf::from(v);
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_CACHE_DIR") {
            config.cache_root = PathBuf::from(v);
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_DOCKER_PLATFORM") {
            if !v.is_empty() {
                config.docker_platform = Some(v);
            }
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_SSH_IDENTITY_FILE") {
            config.ssh_identity_file = Some(PathBuf::from(v));
        }

        if let Some(v) = env_flag("PIPELINE_RUNNER_OIDC_ENABLED")? {
            config.oidc.enabled = v;
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_OIDC_ISSUER") {
            config.oidc.issuer = v;
        }

        if let Ok(v) = std::env::var("PIPELINE_RUNNER_OIDC_AUDIENCE") {
            config.oidc.audience = v;
        }

        Ok(config)
    }

    /// Validates and normalises extra volume specs, expanding `~` in the
    /// host part.
    pub fn set_volumes(&mut self, volumes: Vec<String>) -> Result<(), ConfigError> {
        let home = std::env::var("HOME").unwrap_or_default();
        let mut normalised = Vec::with_capacity(volumes.len());

        for vol in volumes {
            if vol.is_empty() {
                return Err(ConfigError::InvalidVolume(vol));
            }

            let mut parts: Vec<String> = vol.split(':').map(str::to_string).collect();
            if parts.len() > 3 {
                return Err(ConfigError::InvalidVolume(vol));
            }

            if parts[0].starts_with("~/") && !home.is_empty() {
                parts[0] = parts[0].replacen('~', &home, 1);
            }

            normalised.push(parts.join(":"));
        }

        self.volumes = normalised;
        Ok(())
    }

    /// Memory limit for the build container given the step size and the
    /// memory already reserved by services (MiB).
    pub fn build_container_memory_mb(&self, size_multiplier: u64, services_mb: u64) -> u64 {
        (self.total_memory_limit_mb * size_multiplier).saturating_sub(services_mb)
    }
}

fn env_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("not a boolean: {other}"),
            }),
        },
        Err(_) => Ok(None),
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "pipeline".to_string())
}

fn default_data_root() -> Result<PathBuf, ConfigError> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg).join("pipeline-forge"));
    }

    let home = std::env::var("HOME").map_err(|_| ConfigError::NoHomeDirectory)?;
    Ok(PathBuf::from(home).join(".local/share/pipeline-forge"))
}

fn default_cache_root() -> Result<PathBuf, ConfigError> {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg).join("pipeline-forge"));
    }

    let home = std::env::var("HOME").map_err(|_| ConfigError::NoHomeDirectory)?;
    Ok(PathBuf::from(home).join(".cache/pipeline-forge"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert!(!config.cpu_limits);
        assert!(!config.expose_ssh_agent);
        assert_eq!(config.total_memory_limit_mb, 4096);
        assert_eq!(config.build_container_minimum_memory_mb, 1024);
        assert!(!config.oidc.enabled);
    }

    #[test]
    fn test_build_container_memory() {
        let config = RunnerConfig::default();
        assert_eq!(config.build_container_memory_mb(1, 1024), 3072);
        assert_eq!(config.build_container_memory_mb(2, 1024), 7168);
        // Services can never drive the limit below zero.
        assert_eq!(config.build_container_memory_mb(1, 9999), 0);
    }

    #[test]
    fn test_set_volumes_rejects_bad_specs() {
        let mut config = RunnerConfig::default();
        assert!(config.set_volumes(vec!["".into()]).is_err());
        assert!(config
            .set_volumes(vec!["a:b:c:d".into()])
            .is_err());
        assert!(config
            .set_volumes(vec!["/host:/container:ro".into()])
            .is_ok());
        assert_eq!(config.volumes, vec!["/host:/container:ro"]);
    }

    #[test]
    fn test_default_cache_paths_cover_common_tools() {
        let caches = default_cache_paths();
        assert_eq!(caches["pip"], "~/.cache/pip");
        assert_eq!(caches["node"], "node_modules");
        assert_eq!(caches.len(), 8);
    }
}
