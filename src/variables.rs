//! Variable resolution for pipeline runs.
//!
//! The environment a step sees is assembled from five origins with a
//! strict precedence order: step-local beats user-supplied beats
//! deployment beats pipeline-declared beats system. Secret values are
//! replaced by a fixed placeholder everywhere they would be logged.

use std::collections::BTreeMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;

use tracing::debug;

use crate::config::BUILD_DIR;
use crate::context::StepContext;
use crate::error::VariableError;
use crate::model::VariableSpec;

/// Placeholder written to logs in place of a secret value.
pub const SECRET_PLACEHOLDER: &str = "****";

/// Where a variable's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarOrigin {
    System,
    PipelineDeclared,
    Deployment,
    UserSupplied,
    StepLocal,
    Oidc,
}

/// A named value with its origin and sensitivity.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub origin: VarOrigin,
    pub secret: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl Into<String>, origin: VarOrigin) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            origin,
            secret: false,
        }
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// Provides variables bound to a deployment environment. External
/// collaborator; the engine only merges what it returns.
pub trait DeploymentVariablesProvider: Send + Sync {
    fn variables_for(&self, environment: &str) -> Vec<(String, String)>;
}

/// Resolves the pipeline-declared variables against the values the user
/// supplied.
///
/// On a terminal, unsupplied variables are prompted for; otherwise the
/// default applies, an unsupplied non-required variable resolves to the
/// empty string, and an unsupplied required variable without a default is
/// a validation error. Values outside `allowed-values` are always
/// rejected, before any container starts.
pub fn resolve_declared(
    specs: &[VariableSpec],
    supplied: &BTreeMap<String, String>,
    interactive: bool,
) -> Result<Vec<Variable>, VariableError> {
    let mut resolved = Vec::with_capacity(specs.len());

    for spec in specs {
        let value = match supplied.get(&spec.name) {
            Some(value) => value.clone(),
            None if interactive => prompt_for_variable(spec)?,
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    return Err(VariableError::MissingRequired(spec.name.clone()));
                }
                None => String::new(),
            },
        };

        if let Some(allowed) = &spec.allowed_values {
            if !allowed.iter().any(|v| v == &value) {
                return Err(VariableError::NotAllowed {
                    name: spec.name.clone(),
                    value,
                });
            }
        }

        let mut var = Variable::new(&spec.name, value, VarOrigin::PipelineDeclared);
        var.secret = spec.secret;
        resolved.push(var);
    }

    Ok(resolved)
}

fn prompt_for_variable(spec: &VariableSpec) -> Result<String, VariableError> {
    let default = spec.default.clone().unwrap_or_default();

    let prompt = match &spec.allowed_values {
        None => format!("Enter value for {} [{}]: ", spec.name, default),
        Some(allowed) => {
            let mut lines = vec![format!("Enter value for {}:", spec.name)];
            lines.extend(allowed.iter().map(|v| format!("\t{v}")));
            lines.push(format!("Choice [{default}]: "));
            lines.join("\n")
        }
    };

    let value = read_from_stdin(&prompt)?;
    let value = if value.is_empty() { default } else { value };

    Ok(value)
}

fn read_from_stdin(prompt: &str) -> Result<String, VariableError> {
    print!("{prompt}");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    let stdin = std::io::stdin();

    if stdin.is_terminal() {
        stdin
            .lock()
            .read_line(&mut line)
            .map_err(|_| VariableError::StdinClosed)?;
    } else {
        let read = stdin
            .lock()
            .read_line(&mut line)
            .map_err(|_| VariableError::StdinClosed)?;
        if read == 0 {
            return Err(VariableError::StdinClosed);
        }
    }

    Ok(line.trim_end().to_string())
}

/// Parses `KEY=VALUE` lines from an env file. Blank lines and `#`
/// comments are skipped; an optional `export ` prefix and surrounding
/// quotes are stripped.
pub fn parse_env_file(content: &str, source: &str) -> Result<Vec<(String, String)>, VariableError> {
    let mut vars = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);

        let (name, value) = line.split_once('=').ok_or_else(|| {
            VariableError::InvalidEnvFile(format!("{source}:{}: missing '='", lineno + 1))
        })?;

        let name = name.trim();
        if name.is_empty() {
            return Err(VariableError::InvalidEnvFile(format!(
                "{source}:{}: empty variable name",
                lineno + 1
            )));
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);

        vars.push((name.to_string(), value.to_string()));
    }

    Ok(vars)
}

/// Loads user-supplied variables: the repository `.env` (if present),
/// then each `--env-file` in order, then `--var` flags. Later sources
/// win within this origin.
pub fn load_user_variables(
    repository_path: &Path,
    env_files: &[std::path::PathBuf],
    var_flags: &[(String, String)],
) -> Result<Vec<Variable>, VariableError> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();

    let dotenv = repository_path.join(".env");
    if dotenv.exists() {
        debug!(path = %dotenv.display(), "loading .env file");
        let content = std::fs::read_to_string(&dotenv)
            .map_err(|e| VariableError::InvalidEnvFile(format!("{}: {e}", dotenv.display())))?;
        for (name, value) in parse_env_file(&content, &dotenv.display().to_string())? {
            merged.insert(name, value);
        }
    }

    for file in env_files {
        if !file.exists() {
            return Err(VariableError::InvalidEnvFile(format!(
                "{}: no such file",
                file.display()
            )));
        }

        debug!(path = %file.display(), "loading env file");
        let content = std::fs::read_to_string(file)
            .map_err(|e| VariableError::InvalidEnvFile(format!("{}: {e}", file.display())))?;
        for (name, value) in parse_env_file(&content, &file.display().to_string())? {
            merged.insert(name, value);
        }
    }

    for (name, value) in var_flags {
        merged.insert(name.clone(), value.clone());
    }

    Ok(merged
        .into_iter()
        .map(|(name, value)| Variable::new(name, value, VarOrigin::UserSupplied))
        .collect())
}

/// The `BITBUCKET_*` system variables for a step.
pub fn system_variables(ctx: &StepContext) -> Vec<Variable> {
    let run = &ctx.run;
    let slug = &run.project.slug;

    let mut vars = vec![
        Variable::new("CI", "true", VarOrigin::System),
        Variable::new("BUILD_DIR", BUILD_DIR, VarOrigin::System),
        Variable::new("BITBUCKET_CLONE_DIR", BUILD_DIR, VarOrigin::System),
        Variable::new("BITBUCKET_BRANCH", &run.git.branch, VarOrigin::System),
        Variable::new("BITBUCKET_COMMIT", &run.git.commit, VarOrigin::System),
        Variable::new(
            "BITBUCKET_BUILD_NUMBER",
            run.project.build_number.to_string(),
            VarOrigin::System,
        ),
        Variable::new(
            "BITBUCKET_PIPELINE_UUID",
            run.pipeline_uuid.to_string(),
            VarOrigin::System,
        ),
        Variable::new(
            "BITBUCKET_STEP_UUID",
            ctx.step_uuid.to_string(),
            VarOrigin::System,
        ),
        Variable::new("BITBUCKET_REPO_SLUG", slug, VarOrigin::System),
        Variable::new("BITBUCKET_REPO_OWNER", &run.config.username, VarOrigin::System),
        Variable::new(
            "BITBUCKET_REPO_FULL_NAME",
            format!("{slug}/{slug}"),
            VarOrigin::System,
        ),
        Variable::new("BITBUCKET_WORKSPACE", slug, VarOrigin::System),
        Variable::new("BITBUCKET_REPO_IS_PRIVATE", "true", VarOrigin::System),
        Variable::new("BITBUCKET_PROJECT_KEY", &run.project.key, VarOrigin::System),
        Variable::new(
            "BITBUCKET_PROJECT_UUID",
            run.project.project_uuid.to_string(),
            VarOrigin::System,
        ),
        Variable::new(
            "BITBUCKET_REPO_UUID",
            run.project.repo_uuid.to_string(),
            VarOrigin::System,
        ),
        Variable::new(
            "BITBUCKET_REPO_OWNER_UUID",
            run.workspace.owner_uuid.to_string(),
            VarOrigin::System,
        ),
    ];

    if let Some(parallel) = ctx.parallel {
        vars.push(Variable::new(
            "BITBUCKET_PARALLEL_STEP",
            parallel.index.to_string(),
            VarOrigin::System,
        ));
        vars.push(Variable::new(
            "BITBUCKET_PARALLEL_STEP_COUNT",
            parallel.count.to_string(),
            VarOrigin::System,
        ));
    }

    if let Some(deployment) = &ctx.step.deployment {
        vars.push(Variable::new(
            "BITBUCKET_DEPLOYMENT_ENVIRONMENT",
            deployment,
            VarOrigin::System,
        ));
    }

    vars
}

/// Merges variable sets into the final environment. Slices are given in
/// increasing precedence order; later sets overwrite earlier ones.
pub fn assemble_environment(sets: &[&[Variable]]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for set in sets {
        for var in *set {
            env.insert(var.name.clone(), var.value.clone());
        }
    }

    env
}

/// Replaces every secret value in `text` with the placeholder.
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    let mut masked = text.to_string();

    for secret in secrets {
        if !secret.is_empty() {
            masked = masked.replace(secret.as_str(), SECRET_PLACEHOLDER);
        }
    }

    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, default: Option<&str>, allowed: Option<&[&str]>) -> VariableSpec {
        VariableSpec {
            name: name.to_string(),
            default: default.map(str::to_string),
            allowed_values: allowed.map(|vs| vs.iter().map(|v| v.to_string()).collect()),
            secret: false,
            required: false,
        }
    }

    #[test]
    fn test_resolve_uses_supplied_then_default_then_empty() {
        let specs = vec![
            spec("FILENAME", None, None),
            spec("EMPTY", None, None),
            spec("VAR_WITH_DEFAULT_1", Some("Default 1"), None),
        ];
        let supplied = BTreeMap::from([("FILENAME".to_string(), "out.txt".to_string())]);

        let resolved = resolve_declared(&specs, &supplied, false).unwrap();

        assert_eq!(resolved[0].value, "out.txt");
        assert_eq!(resolved[1].value, "");
        assert_eq!(resolved[2].value, "Default 1");
        assert!(resolved.iter().all(|v| v.origin == VarOrigin::PipelineDeclared));
    }

    #[test]
    fn test_resolve_allowed_values_defaults_to_default() {
        let specs = vec![spec(
            "VAR_WITH_CHOICE",
            Some("dev"),
            Some(&["dev", "staging", "production"]),
        )];

        let resolved = resolve_declared(&specs, &BTreeMap::new(), false).unwrap();
        assert_eq!(resolved[0].value, "dev");
    }

    #[test]
    fn test_resolve_rejects_disallowed_value() {
        let specs = vec![spec(
            "VAR_WITH_CHOICE",
            Some("dev"),
            Some(&["dev", "staging", "production"]),
        )];
        let supplied = BTreeMap::from([("VAR_WITH_CHOICE".to_string(), "nope".to_string())]);

        let err = resolve_declared(&specs, &supplied, false).unwrap_err();
        assert!(matches!(err, VariableError::NotAllowed { .. }));
    }

    #[test]
    fn test_resolve_missing_required_variable() {
        let mut required = spec("TOKEN", None, None);
        required.required = true;

        let err = resolve_declared(&[required], &BTreeMap::new(), false).unwrap_err();
        assert!(matches!(err, VariableError::MissingRequired(name) if name == "TOKEN"));
    }

    #[test]
    fn test_parse_env_file() {
        let content = r#"
# comment
FOO=bar
export QUOTED="hello world"
SINGLE='x'
EMPTY=
"#;

        let vars = parse_env_file(content, "test.env").unwrap();
        assert_eq!(
            vars,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("QUOTED".to_string(), "hello world".to_string()),
                ("SINGLE".to_string(), "x".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_env_file_rejects_garbage() {
        let err = parse_env_file("NOT A VAR", "bad.env").unwrap_err();
        assert!(matches!(err, VariableError::InvalidEnvFile(_)));
    }

    #[test]
    fn test_assemble_environment_precedence() {
        let system = vec![Variable::new("SHARED", "from-system", VarOrigin::System)];
        let declared = vec![
            Variable::new("SHARED", "from-declared", VarOrigin::PipelineDeclared),
            Variable::new("DECLARED_ONLY", "yes", VarOrigin::PipelineDeclared),
        ];
        let user = vec![Variable::new("SHARED", "from-user", VarOrigin::UserSupplied)];
        let step_local = vec![Variable::new("SHARED", "from-step", VarOrigin::StepLocal)];

        let env = assemble_environment(&[&system, &declared, &user, &step_local]);

        assert_eq!(env["SHARED"], "from-step");
        assert_eq!(env["DECLARED_ONLY"], "yes");
    }

    #[test]
    fn test_mask_secrets() {
        let secrets = vec!["hunter2".to_string()];
        assert_eq!(
            mask_secrets("password is hunter2!", &secrets),
            "password is ****!"
        );
        assert_eq!(mask_secrets("nothing here", &secrets), "nothing here");
    }

    #[test]
    fn test_mask_ignores_empty_secrets() {
        let secrets = vec![String::new()];
        assert_eq!(mask_secrets("unchanged", &secrets), "unchanged");
    }

    #[test]
    fn test_load_user_variables_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=dotenv\nB=dotenv\n").unwrap();
        let extra = dir.path().join("extra.env");
        std::fs::write(&extra, "B=extra\nC=extra\n").unwrap();

        let vars = load_user_variables(
            dir.path(),
            &[extra],
            &[("C".to_string(), "flag".to_string())],
        )
        .unwrap();

        let by_name: BTreeMap<_, _> = vars
            .iter()
            .map(|v| (v.name.as_str(), v.value.as_str()))
            .collect();

        assert_eq!(by_name["A"], "dotenv");
        assert_eq!(by_name["B"], "extra");
        assert_eq!(by_name["C"], "flag");
    }
}
