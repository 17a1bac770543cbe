//! Image resolution: making sure a runnable local image exists before a
//! container is created.
//!
//! Pulls are idempotent within a run; concurrent requests for the same
//! (reference, platform) coalesce into a single pull. Registry
//! credentials come from a [`RegistryAuthProvider`] collaborator and are
//! never logged.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::docker::DockerClient;
use crate::error::{DockerError, ImageError};
use crate::model::ImageSpec;

/// A transient registry login.
#[derive(Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Resolves registry credentials for an image reference. External
/// collaborator; the provider owns any cloud API exchange.
#[async_trait]
pub trait RegistryAuthProvider: Send + Sync {
    async fn resolve(&self, image: &ImageSpec) -> Result<Option<RegistryAuth>, ImageError>;
}

/// ECR registries are recognised by their host pattern.
pub fn is_ecr_reference(reference: &str) -> bool {
    // Compiled on demand; image resolution is not hot.
    let pattern = Regex::new(r"^\d+\.dkr\.ecr\.[a-z0-9-]+\.amazonaws\.com/")
        .expect("static regex");
    pattern.is_match(reference)
}

/// Default credentials provider: uses the credentials declared on the
/// image, and for ECR references exchanges the pre-fetched authorization
/// token from `AWS_ECR_AUTHORIZATION_TOKEN` (base64 `user:password`).
pub struct DefaultAuthProvider;

#[async_trait]
impl RegistryAuthProvider for DefaultAuthProvider {
    async fn resolve(&self, image: &ImageSpec) -> Result<Option<RegistryAuth>, ImageError> {
        if image.aws.is_some() || is_ecr_reference(&image.name) {
            let token = std::env::var("AWS_ECR_AUTHORIZATION_TOKEN").map_err(|_| {
                ImageError::Auth {
                    reference: image.name.clone(),
                    message: "ECR image requires AWS_ECR_AUTHORIZATION_TOKEN".to_string(),
                }
            })?;

            let decoded = base64::engine::general_purpose::STANDARD
                .decode(token.trim())
                .map_err(|e| ImageError::Auth {
                    reference: image.name.clone(),
                    message: format!("invalid authorization token: {e}"),
                })?;

            let decoded = String::from_utf8_lossy(&decoded).to_string();
            let (username, password) =
                decoded.split_once(':').ok_or_else(|| ImageError::Auth {
                    reference: image.name.clone(),
                    message: "authorization token is not user:password".to_string(),
                })?;

            return Ok(Some(RegistryAuth {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }

        if let (Some(username), Some(password)) = (&image.username, &image.password) {
            return Ok(Some(RegistryAuth {
                username: username.clone(),
                password: password.clone(),
            }));
        }

        Ok(None)
    }
}

/// Ensures images are available locally before containers start.
pub struct ImageProvider {
    docker: Arc<DockerClient>,
    auth: Arc<dyn RegistryAuthProvider>,
    /// Platform override, applied to step images only.
    platform: Option<String>,
    pulled: Mutex<HashSet<String>>,
}

impl ImageProvider {
    pub fn new(
        docker: Arc<DockerClient>,
        auth: Arc<dyn RegistryAuthProvider>,
        platform: Option<String>,
    ) -> Self {
        Self {
            docker,
            auth,
            platform,
            pulled: Mutex::new(HashSet::new()),
        }
    }

    /// Acquires a runnable local reference for the image.
    ///
    /// `apply_platform` is true for pipeline-step images and false for
    /// service images; the platform override never applies to services.
    pub async fn ensure(
        &self,
        image: &ImageSpec,
        apply_platform: bool,
    ) -> Result<String, ImageError> {
        let platform = if apply_platform {
            self.platform.as_deref()
        } else {
            None
        };

        let key = format!("{}|{}", image.name, platform.unwrap_or(""));

        // The lock is held across the pull so concurrent requests for the
        // same image coalesce.
        let mut pulled = self.pulled.lock().await;

        if pulled.contains(&key) {
            debug!(image = %image.name, "image already pulled");
            return Ok(image.name.clone());
        }

        if self.docker.image_exists(&image.name).await {
            debug!(image = %image.name, "image present locally");
            pulled.insert(key);
            return Ok(image.name.clone());
        }

        info!(image = %image.name, "pulling image");

        let credentials = self
            .auth
            .resolve(image)
            .await?
            .map(|auth| (auth.username, auth.password));

        match self
            .docker
            .pull_image(&image.name, platform, credentials)
            .await
        {
            Ok(()) => {}
            Err(DockerError::ImageNotFound(message)) => {
                return Err(ImageError::NotFound(format!("{}: {message}", image.name)));
            }
            Err(e) => {
                // A stale local copy is still usable when the registry is
                // unreachable.
                if self.docker.image_exists(&image.name).await {
                    warn!(image = %image.name, "pull failed, using local copy: {e}");
                } else {
                    return Err(ImageError::PullFailed {
                        reference: image.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        pulled.insert(key);
        Ok(image.name.clone())
    }
}
