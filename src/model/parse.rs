//! Reading and validating the pipeline file.
//!
//! Validation happens once, here; the engine assumes the model it
//! receives is schema-valid.

use std::path::Path;

use crate::error::ParseError;
use crate::model::{Pipeline, PipelineElement, PipelineSpec};

/// Name of the pipeline file inside the repository.
pub const PIPELINE_FILE_NAME: &str = "bitbucket-pipelines.yml";

/// Reads and validates the pipeline file at `path`.
pub fn parse_pipeline_file(path: &Path) -> Result<PipelineSpec, ParseError> {
    if !path.exists() {
        return Err(ParseError::FileNotFound(path.display().to_string()));
    }

    let raw = std::fs::read_to_string(path)?;
    parse_pipeline_str(&raw)
}

/// Parses and validates pipeline file content.
pub fn parse_pipeline_str(raw: &str) -> Result<PipelineSpec, ParseError> {
    let spec: PipelineSpec = serde_yaml::from_str(raw)?;
    validate(&spec)?;
    Ok(spec)
}

fn validate(spec: &PipelineSpec) -> Result<(), ParseError> {
    if spec.pipelines.is_empty() {
        return Err(ParseError::Validation(
            "There must be at least one pipeline".to_string(),
        ));
    }

    for (name, pipeline) in spec.pipelines.get_all() {
        validate_pipeline(&name, pipeline)?;
    }

    for (name, service) in &spec.definitions.services {
        // The default `docker` service has a built-in image; everything
        // else must name one.
        if service.image.is_none() && name != "docker" {
            return Err(ParseError::Validation(format!(
                "Service '{name}' must have an image"
            )));
        }

        if let Some(image) = &service.image {
            validate_image(image)?;
        }
    }

    if let Some(image) = &spec.image {
        validate_image(image)?;
    }

    Ok(())
}

fn validate_pipeline(name: &str, pipeline: &Pipeline) -> Result<(), ParseError> {
    if pipeline.elements.is_empty() {
        return Err(ParseError::Validation(format!(
            "Pipeline '{name}' has no steps"
        )));
    }

    for element in pipeline.elements.iter().skip(1) {
        if matches!(element, PipelineElement::Variables { .. }) {
            return Err(ParseError::Validation(format!(
                "Pipeline '{name}': 'variables' can only be the first element of the list"
            )));
        }
    }

    if pipeline.step_groups().is_empty() {
        return Err(ParseError::Validation(format!(
            "Pipeline '{name}' has no steps"
        )));
    }

    for var in pipeline.variables() {
        if let Some(allowed) = &var.allowed_values {
            let default = var.default.as_deref().ok_or_else(|| {
                ParseError::Validation(format!(
                    "Variable '{}' requires a default value when allowed values are specified",
                    var.name
                ))
            })?;

            if !allowed.iter().any(|v| v == default) {
                return Err(ParseError::Validation(format!(
                    "Variable '{}': allowed values list doesn't contain the default value \"{default}\"",
                    var.name
                )));
            }
        }
    }

    for element in &pipeline.elements {
        let steps: Vec<&crate::model::Step> = match element {
            PipelineElement::Variables { .. } => continue,
            PipelineElement::Step { step } => vec![step],
            PipelineElement::Parallel { parallel } => {
                parallel.steps().iter().map(|w| &w.step).collect()
            }
        };

        for step in steps {
            if step.script.is_empty() {
                return Err(ParseError::Validation(format!(
                    "Pipeline '{name}': step '{}' has an empty script",
                    step.name
                )));
            }

            if let Some(image) = &step.image {
                validate_image(image)?;
            }
        }
    }

    Ok(())
}

fn validate_image(image: &crate::model::ImageSpec) -> Result<(), ParseError> {
    if let Some(aws) = &image.aws {
        if aws.oidc_role.is_some() {
            return Err(ParseError::Validation(format!(
                "Image '{}': aws oidc-role is not supported",
                image.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_minimal_file() {
        let spec = parse_pipeline_str(
            r#"
pipelines:
  default:
    - step:
        script:
          - echo hello
"#,
        )
        .unwrap();

        assert!(spec.pipelines.get("default").is_some());
    }

    #[test]
    fn test_no_pipelines_is_rejected() {
        let err = parse_pipeline_str("pipelines: {}").unwrap_err();
        assert!(err.to_string().contains("at least one pipeline"));
    }

    #[test]
    fn test_variables_must_come_first() {
        let err = parse_pipeline_str(
            r#"
pipelines:
  custom:
    bad:
      - step:
          script: [whoami]
      - variables:
          - name: LATE
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("first element"));
    }

    #[test]
    fn test_allowed_values_require_matching_default() {
        let err = parse_pipeline_str(
            r#"
pipelines:
  custom:
    deploy:
      - variables:
          - name: ENV
            default: nowhere
            allowed-values: [dev, prod]
      - step:
          script: [whoami]
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("doesn't contain the default"));
    }

    #[test]
    fn test_allowed_values_require_a_default() {
        let err = parse_pipeline_str(
            r#"
pipelines:
  custom:
    deploy:
      - variables:
          - name: ENV
            allowed-values: [dev, prod]
      - step:
          script: [whoami]
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("requires a default"));
    }

    #[test]
    fn test_custom_service_needs_an_image() {
        let err = parse_pipeline_str(
            r#"
definitions:
  services:
    cache:
      memory: 128
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("must have an image"));
    }

    #[test]
    fn test_docker_service_may_omit_image() {
        let spec = parse_pipeline_str(
            r#"
definitions:
  services:
    docker:
      memory: 2048
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        )
        .unwrap();

        assert!(spec.definitions.services["docker"].image.is_none());
    }

    #[test]
    fn test_empty_script_is_rejected() {
        let err = parse_pipeline_str(
            r#"
pipelines:
  default:
    - step:
        script: []
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("empty script"));
    }

    #[test]
    fn test_aws_oidc_role_is_rejected() {
        let err = parse_pipeline_str(
            r#"
image:
  name: 123456789.dkr.ecr.us-east-1.amazonaws.com/app:1
  aws:
    access-key: AKIA123
    secret-key: abc123
    oidc-role: arn:aws:iam::123:role/deploy
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("oidc-role is not supported"));
    }
}
