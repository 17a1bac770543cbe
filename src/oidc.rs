//! OIDC identity tokens for steps that request them.
//!
//! The runner builds the claim set; signing is delegated to an external
//! [`OidcSigner`] so no key material flows through the engine. The signed
//! token is injected into the step environment as
//! `BITBUCKET_STEP_OIDC_TOKEN` and treated as a secret.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::OidcSettings;
use crate::context::StepContext;

/// Token lifetime in seconds.
const TOKEN_TTL_SECS: i64 = 3600;

/// Errors raised while producing an identity token.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("Signer error: {0}")]
    Signer(String),
}

/// Claim set of a step identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,

    #[serde(rename = "accountUuid")]
    pub account_uuid: String,
    #[serde(rename = "workspaceUuid")]
    pub workspace_uuid: String,
    #[serde(rename = "repositoryUuid")]
    pub repository_uuid: String,
    #[serde(rename = "pipelineUuid")]
    pub pipeline_uuid: String,
    #[serde(rename = "stepUuid")]
    pub step_uuid: String,
    #[serde(rename = "deploymentEnvironmentUuid", skip_serializing_if = "Option::is_none")]
    pub deployment_environment_uuid: Option<String>,
    #[serde(rename = "branchName")]
    pub branch_name: String,
}

impl OidcClaims {
    /// Builds the claims for one step. The hosted product wraps uuids in
    /// braces; the subject is the pipeline uuid, optionally the
    /// deployment environment uuid, then the step uuid.
    pub fn for_step(settings: &OidcSettings, ctx: &StepContext) -> Self {
        let run = &ctx.run;
        let iat = Utc::now().timestamp();

        let pipeline_uuid = braced(&run.pipeline_uuid);
        let step_uuid = braced(&ctx.step_uuid);

        let deployment_environment_uuid = ctx.step.deployment.as_ref().map(|environment| {
            braced(&Uuid::new_v5(&Uuid::NAMESPACE_OID, environment.as_bytes()))
        });

        let sub = match &deployment_environment_uuid {
            Some(env_uuid) => format!("{pipeline_uuid}:{env_uuid}:{step_uuid}"),
            None => format!("{pipeline_uuid}:{step_uuid}"),
        };

        Self {
            iss: settings.issuer.clone(),
            aud: settings.audience.clone(),
            sub,
            iat,
            exp: iat + TOKEN_TTL_SECS,
            account_uuid: braced(&run.workspace.owner_uuid),
            workspace_uuid: braced(&run.workspace.workspace_uuid),
            repository_uuid: braced(&run.project.repo_uuid),
            pipeline_uuid,
            step_uuid,
            deployment_environment_uuid,
            branch_name: run.git.branch.clone(),
        }
    }
}

fn braced(uuid: &Uuid) -> String {
    format!("{{{uuid}}}")
}

/// Signs claim sets into JWTs. External collaborator; implementations
/// own the key material.
#[async_trait]
pub trait OidcSigner: Send + Sync {
    async fn sign(&self, claims: &OidcClaims) -> Result<String, OidcError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::context::{
        GitInfo, ProjectMetadata, RunContext, StepContext, WorkspaceMetadata,
    };
    use crate::model::parse::parse_pipeline_str;
    use std::sync::Arc;

    fn step_context(deployment: Option<&str>) -> StepContext {
        let spec = parse_pipeline_str(
            r#"
pipelines:
  default:
    - step:
        name: deploy
        script: [whoami]
"#,
        )
        .unwrap();
        let pipeline = spec.pipelines.get("default").unwrap().clone();
        let mut step = pipeline.step_groups()[0].steps[0].clone();
        step.deployment = deployment.map(str::to_string);

        let run = Arc::new(RunContext {
            config: RunnerConfig::default(),
            repository_path: "/tmp/demo".into(),
            project: ProjectMetadata {
                name: "demo".into(),
                path_slug: "demo-x".into(),
                slug: "demo".into(),
                key: "D".into(),
                project_uuid: Uuid::new_v4(),
                repo_uuid: Uuid::new_v4(),
                build_number: 1,
            },
            workspace: WorkspaceMetadata {
                workspace_uuid: Uuid::new_v4(),
                owner_uuid: Uuid::new_v4(),
            },
            git: GitInfo {
                branch: "main".into(),
                commit: "abc".into(),
            },
            spec,
            pipeline_name: "default".into(),
            pipeline,
            pipeline_uuid: Uuid::new_v4(),
            start_time: Utc::now(),
            pipeline_variables: Vec::new(),
            user_variables: Vec::new(),
            selected_steps: Vec::new(),
        });

        StepContext::new(run, step, 0, 0, None)
    }

    #[test]
    fn test_claims_subject_without_deployment() {
        let ctx = step_context(None);
        let claims = OidcClaims::for_step(&OidcSettings::default(), &ctx);

        assert_eq!(
            claims.sub,
            format!("{{{}}}:{{{}}}", ctx.run.pipeline_uuid, ctx.step_uuid)
        );
        assert!(claims.deployment_environment_uuid.is_none());
        assert_eq!(claims.exp - claims.iat, TOKEN_TTL_SECS);
    }

    #[test]
    fn test_claims_subject_with_deployment() {
        let ctx = step_context(Some("production"));
        let claims = OidcClaims::for_step(&OidcSettings::default(), &ctx);

        let env_uuid = claims.deployment_environment_uuid.clone().unwrap();
        assert_eq!(
            claims.sub,
            format!(
                "{{{}}}:{env_uuid}:{{{}}}",
                ctx.run.pipeline_uuid, ctx.step_uuid
            )
        );
    }

    #[test]
    fn test_deployment_environment_uuid_is_deterministic() {
        let a = OidcClaims::for_step(&OidcSettings::default(), &step_context(Some("staging")));
        let b = OidcClaims::for_step(&OidcSettings::default(), &step_context(Some("staging")));

        assert_eq!(
            a.deployment_environment_uuid,
            b.deployment_environment_uuid
        );
    }

    #[test]
    fn test_claims_serialise_with_camel_case_names() {
        let ctx = step_context(None);
        let claims = OidcClaims::for_step(&OidcSettings::default(), &ctx);
        let json = serde_json::to_string(&claims).unwrap();

        assert!(json.contains("\"accountUuid\""));
        assert!(json.contains("\"branchName\""));
        assert!(!json.contains("deploymentEnvironmentUuid"));
    }
}
