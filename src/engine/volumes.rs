//! Host-side resource management: build directories, caches, SSH
//! material, user volumes, and the per-run allocation ledger.
//!
//! Every allocation is recorded and released in LIFO order when the run
//! ends, on every exit path. Cache directories outlive the run; build and
//! artifact directories stay under the run tree for inspection; only
//! sensitive or daemon-side allocations (SSH material, socket volumes)
//! are actually removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::docker::DockerClient;
use crate::error::VolumeError;
use crate::model::CacheSpec;
use crate::utils::ensure_directory;

/// Home directory assumed when resolving `~`-rooted cache paths; steps
/// run as root unless the image overrides the user.
const CONTAINER_HOME: &str = "/root";

/// One tracked allocation.
#[derive(Debug, Clone)]
enum Allocation {
    /// A host directory. Transient directories are deleted on release.
    Dir { path: PathBuf, transient: bool },
    /// A named docker volume. Transient volumes are removed on release.
    Volume { name: String, transient: bool },
}

/// Allocates and reclaims host directories and named volumes for a run.
pub struct VolumeManager {
    docker: Arc<DockerClient>,
    cache_root: PathBuf,
    project_slug: String,
    repository_path: PathBuf,
    ledger: Mutex<Vec<Allocation>>,
}

impl VolumeManager {
    pub fn new(
        docker: Arc<DockerClient>,
        cache_root: PathBuf,
        project_slug: String,
        repository_path: PathBuf,
    ) -> Self {
        Self {
            docker,
            cache_root,
            project_slug,
            repository_path,
            ledger: Mutex::new(Vec::new()),
        }
    }

    /// Creates the step's build directory and fills it with the project
    /// source, honouring `.gitignore` (tracked plus untracked-but-not-
    /// ignored files).
    pub async fn prepare_build_dir(&self, build_dir: &Path) -> Result<(), VolumeError> {
        ensure_directory(build_dir)?;
        self.record(Allocation::Dir {
            path: build_dir.to_path_buf(),
            transient: false,
        })
        .await;

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repository_path)
            .args(["ls-files", "--cached", "--others", "--exclude-standard", "-z"])
            .output()
            .await
            .map_err(|e| VolumeError::SourceCopy(format!("running git ls-files: {e}")))?;

        if !output.status.success() {
            return Err(VolumeError::SourceCopy(format!(
                "git ls-files failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let mut copied = 0usize;

        for rel in listing.split('\0').filter(|p| !p.is_empty()) {
            let src = self.repository_path.join(rel);
            if !src.is_file() {
                // Deleted-but-staged entries and submodule mounts.
                continue;
            }

            let dst = build_dir.join(rel);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            tokio::fs::copy(&src, &dst).await?;
            copied += 1;
        }

        debug!(files = copied, dir = %build_dir.display(), "project source copied");

        Ok(())
    }

    /// Resolves a cache to its host directory, creating it on first use.
    /// Returns the directory and the derived cache key.
    pub async fn cache_dir(
        &self,
        name: &str,
        spec: &CacheSpec,
    ) -> Result<(PathBuf, String), VolumeError> {
        let key = compute_cache_key(name, spec, &self.repository_path)?;
        let dir = self.cache_root.join(format!("{name}-{key}"));

        let created = !dir.exists();
        ensure_directory(&dir)?;

        if created {
            info!(cache = name, key = %key, "created cache directory");
        }

        self.record(Allocation::Dir {
            path: dir.clone(),
            transient: false,
        })
        .await;

        Ok((dir, key))
    }

    /// The named docker volume backing the `docker` cache. Persists
    /// across runs.
    pub async fn docker_cache_volume(&self) -> Result<String, VolumeError> {
        let name = format!("pipeline-runner-{}-docker", self.project_slug);

        self.docker
            .create_volume(&name)
            .await
            .map_err(|e| VolumeError::SourceCopy(format!("creating docker cache volume: {e}")))?;

        self.record(Allocation::Volume {
            name: name.clone(),
            transient: false,
        })
        .await;

        Ok(name)
    }

    /// A per-step named volume carrying the Docker-in-Docker daemon
    /// socket. Removed when the run ends.
    pub async fn socket_volume(&self, container_name: &str) -> Result<String, VolumeError> {
        let name = format!("{container_name}-docker-socket");

        self.docker
            .create_volume(&name)
            .await
            .map_err(|e| VolumeError::SourceCopy(format!("creating socket volume: {e}")))?;

        self.record(Allocation::Volume {
            name: name.clone(),
            transient: true,
        })
        .await;

        Ok(name)
    }

    /// Builds the SSH material directory for a step: the private key at
    /// mode 0600, a world-readable copy for alternate uids, and an
    /// ssh_config pointing at the key.
    pub async fn ssh_material_dir(
        &self,
        step_dir: &Path,
        identity_file: &Path,
    ) -> Result<PathBuf, VolumeError> {
        use std::os::unix::fs::PermissionsExt;

        if !identity_file.exists() {
            return Err(VolumeError::SshKeyNotFound(
                identity_file.display().to_string(),
            ));
        }

        let ssh_dir = step_dir.join("ssh");
        ensure_directory(&ssh_dir)?;

        let key = tokio::fs::read(identity_file).await?;

        let id_rsa = ssh_dir.join("id_rsa");
        tokio::fs::write(&id_rsa, &key).await?;
        tokio::fs::set_permissions(&id_rsa, std::fs::Permissions::from_mode(0o600)).await?;

        let id_rsa_tmp = ssh_dir.join("id_rsa_tmp");
        tokio::fs::write(&id_rsa_tmp, &key).await?;
        tokio::fs::set_permissions(&id_rsa_tmp, std::fs::Permissions::from_mode(0o644)).await?;

        let config = format!(
            "IdentityFile {}/id_rsa\nServerAliveInterval 180\n",
            crate::config::SSH_KEY_DIR
        );
        tokio::fs::write(ssh_dir.join("config"), config).await?;

        self.record(Allocation::Dir {
            path: ssh_dir.clone(),
            transient: true,
        })
        .await;

        Ok(ssh_dir)
    }

    async fn record(&self, allocation: Allocation) {
        self.ledger.lock().await.push(allocation);
    }

    /// Releases all allocations in LIFO order. Persistent allocations
    /// are only logged; transient ones are deleted best-effort.
    pub async fn release_all(&self) {
        let mut ledger = self.ledger.lock().await;

        while let Some(allocation) = ledger.pop() {
            match allocation {
                Allocation::Dir { path, transient } => {
                    if transient {
                        debug!(dir = %path.display(), "removing transient directory");
                        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                            warn!(dir = %path.display(), "failed to remove directory: {e}");
                        }
                    } else {
                        debug!(dir = %path.display(), "retained on disk");
                    }
                }
                Allocation::Volume { name, transient } => {
                    if transient {
                        debug!(volume = %name, "removing transient volume");
                        if let Err(e) = self.docker.remove_volume(&name).await {
                            warn!(volume = %name, "failed to remove volume: {e}");
                        }
                    } else {
                        debug!(volume = %name, "volume retained");
                    }
                }
            }
        }
    }
}

/// Resolves a declared cache path to an absolute in-container path.
/// `~` and `$HOME` resolve against the container user's home.
pub fn resolve_cache_mount_path(declared: &str) -> String {
    if let Some(rest) = declared.strip_prefix("~/") {
        return format!("{CONTAINER_HOME}/{rest}");
    }

    if let Some(rest) = declared.strip_prefix("$HOME/") {
        return format!("{CONTAINER_HOME}/{rest}");
    }

    if declared.starts_with('/') {
        return declared.to_string();
    }

    // Relative paths anchor at the build directory.
    format!("{}/{declared}", crate::config::BUILD_DIR)
}

/// Derives the cache key for a cache definition.
///
/// With no key definition the key is the constant `default`. With a
/// `key.files` list, the key is the lowercase hex SHA-256 of the
/// concatenation of each listed file's SHA-256 digest, in declared
/// order. A missing file is a hard error.
pub fn compute_cache_key(
    name: &str,
    spec: &CacheSpec,
    repository_path: &Path,
) -> Result<String, VolumeError> {
    let Some(files) = spec.key_files() else {
        return Ok("default".to_string());
    };

    let mut hasher = Sha256::new();

    for file in files {
        let path = repository_path.join(file);
        let content = std::fs::read(&path).map_err(|_| VolumeError::CacheKeyMissingFile {
            cache: name.to_string(),
            file: file.clone(),
        })?;

        hasher.update(Sha256::digest(&content));
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Normalises user volume specs into docker bind strings.
pub fn user_volume_binds(volumes: &[String]) -> Result<Vec<String>, VolumeError> {
    volumes
        .iter()
        .map(|vol| {
            let parts: Vec<&str> = vol.split(':').collect();
            match parts.len() {
                1 => Ok(format!("{}:{}", parts[0], parts[0])),
                2 | 3 => Ok(vol.clone()),
                _ => Err(VolumeError::InvalidVolumeSpec(vol.clone())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CacheKeyDef, KeyedCache};

    fn keyed(files: &[&str]) -> CacheSpec {
        CacheSpec::Keyed(KeyedCache {
            key: CacheKeyDef {
                files: files.iter().map(|f| f.to_string()).collect(),
            },
            path: "target".to_string(),
        })
    }

    #[test]
    fn test_cache_key_defaults_to_constant() {
        let dir = tempfile::tempdir().unwrap();
        let key = compute_cache_key("pip", &CacheSpec::Path("~/.cache/pip".into()), dir.path()).unwrap();
        assert_eq!(key, "default");
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "lockfile contents").unwrap();

        let a = compute_cache_key("cargo-target", &keyed(&["Cargo.lock"]), dir.path()).unwrap();
        let b = compute_cache_key("cargo-target", &keyed(&["Cargo.lock"]), dir.path()).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn test_cache_key_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "v1").unwrap();
        let a = compute_cache_key("cargo-target", &keyed(&["Cargo.lock"]), dir.path()).unwrap();

        std::fs::write(dir.path().join("Cargo.lock"), "v2").unwrap();
        let b = compute_cache_key("cargo-target", &keyed(&["Cargo.lock"]), dir.path()).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_respects_file_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "aaa").unwrap();
        std::fs::write(dir.path().join("b"), "bbb").unwrap();

        let ab = compute_cache_key("cargo-target", &keyed(&["a", "b"]), dir.path()).unwrap();
        let ba = compute_cache_key("cargo-target", &keyed(&["b", "a"]), dir.path()).unwrap();

        assert_ne!(ab, ba);
    }

    #[test]
    fn test_cache_key_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_cache_key("cargo-target", &keyed(&["nope.lock"]), dir.path()).unwrap_err();
        assert!(matches!(err, VolumeError::CacheKeyMissingFile { .. }));
    }

    #[test]
    fn test_resolve_cache_mount_path() {
        assert_eq!(resolve_cache_mount_path("~/.cache/pip"), "/root/.cache/pip");
        assert_eq!(
            resolve_cache_mount_path("$HOME/.m2/repository"),
            "/root/.m2/repository"
        );
        assert_eq!(resolve_cache_mount_path("/var/lib/thing"), "/var/lib/thing");
        assert_eq!(
            resolve_cache_mount_path("node_modules"),
            format!("{}/node_modules", crate::config::BUILD_DIR)
        );
    }

    #[test]
    fn test_user_volume_binds() {
        let binds = user_volume_binds(&[
            "/data".to_string(),
            "/a:/b".to_string(),
            "/a:/b:ro".to_string(),
        ])
        .unwrap();

        assert_eq!(binds, vec!["/data:/data", "/a:/b", "/a:/b:ro"]);

        assert!(user_volume_binds(&["a:b:c:d".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_ssh_material_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("id_ed25519");
        std::fs::write(&key_file, "PRIVATE KEY MATERIAL").unwrap();

        let docker = match DockerClient::new() {
            Ok(d) => Arc::new(d),
            // Daemon-independent: ssh_material_dir never touches docker,
            // but the manager needs a client value.
            Err(_) => return,
        };

        let manager = VolumeManager::new(
            docker,
            dir.path().join("caches"),
            "demo".into(),
            dir.path().to_path_buf(),
        );

        let step_dir = dir.path().join("step");
        std::fs::create_dir_all(&step_dir).unwrap();

        let ssh_dir = manager
            .ssh_material_dir(&step_dir, &key_file)
            .await
            .unwrap();

        let id_rsa_mode = std::fs::metadata(ssh_dir.join("id_rsa"))
            .unwrap()
            .permissions()
            .mode();
        let tmp_mode = std::fs::metadata(ssh_dir.join("id_rsa_tmp"))
            .unwrap()
            .permissions()
            .mode();

        assert_eq!(id_rsa_mode & 0o777, 0o600);
        assert_eq!(tmp_mode & 0o777, 0o644);

        let config = std::fs::read_to_string(ssh_dir.join("config")).unwrap();
        assert!(config.contains("IdentityFile"));
        assert!(config.contains("ServerAliveInterval 180"));
    }
}
