//! In-memory model of a `bitbucket-pipelines.yml` file.
//!
//! The model is deserialised with serde and validated once, up front; the
//! execution engine consumes it as immutable values. Shorthand forms in
//! the file (a bare image name, an artifact list without options) are
//! normalised into their full representations at deserialisation time.

pub mod parse;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Registry credentials for AWS ECR image references.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsCredentials {
    #[serde(rename = "access-key")]
    pub access_key_id: String,
    #[serde(rename = "secret-key")]
    pub secret_access_key: String,
    #[serde(rename = "oidc-role", default)]
    pub oidc_role: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("oidc_role", &self.oidc_role)
            .finish()
    }
}

/// A container image reference with optional registry auth and run-user.
///
/// In the pipeline file this is either a bare string or a mapping.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ImageDef")]
pub struct ImageSpec {
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
    pub run_as_user: Option<String>,
    pub aws: Option<AwsCredentials>,
}

impl ImageSpec {
    /// A plain image reference with no credentials.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            username: None,
            password: None,
            email: None,
            run_as_user: None,
            aws: None,
        }
    }
}

impl std::fmt::Debug for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSpec")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("run_as_user", &self.run_as_user)
            .field("aws", &self.aws)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageDef {
    Name(String),
    Full(ImageSpecDef),
}

#[derive(Deserialize)]
struct ImageSpecDef {
    name: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(rename = "run-as-user", default)]
    run_as_user: Option<IntOrString>,
    #[serde(default)]
    aws: Option<AwsCredentials>,
}

impl From<ImageDef> for ImageSpec {
    fn from(def: ImageDef) -> Self {
        match def {
            ImageDef::Name(name) => ImageSpec::from_name(name),
            ImageDef::Full(full) => ImageSpec {
                name: full.name,
                username: full.username,
                password: full.password,
                email: full.email,
                run_as_user: full.run_as_user.map(|v| v.into_string()),
                aws: full.aws,
            },
        }
    }
}

/// YAML scalars that may be written as numbers or strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

impl IntOrString {
    fn into_string(self) -> String {
        match self {
            IntOrString::Int(v) => v.to_string(),
            IntOrString::Str(v) => v,
        }
    }
}

/// A sidecar service definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default, alias = "environment")]
    pub variables: BTreeMap<String, String>,
    #[serde(default = "default_service_memory")]
    pub memory: u64,
    #[serde(default)]
    pub command: Option<Command>,
}

fn default_service_memory() -> u64 {
    1024
}

/// Commands may be written as a string or a list of arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Argv(Vec<String>),
}

impl Command {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Command::Line(line) => vec!["sh".into(), "-c".into(), line.clone()],
            Command::Argv(argv) => argv.clone(),
        }
    }
}

/// A cache definition: a bare path, or a path with a file-based key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheSpec {
    Path(String),
    Keyed(KeyedCache),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedCache {
    pub key: CacheKeyDef,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyDef {
    pub files: Vec<String>,
}

impl CacheSpec {
    /// The declared in-container path of the cache.
    pub fn declared_path(&self) -> &str {
        match self {
            CacheSpec::Path(path) => path,
            CacheSpec::Keyed(keyed) => &keyed.path,
        }
    }

    pub fn key_files(&self) -> Option<&[String]> {
        match self {
            CacheSpec::Path(_) => None,
            CacheSpec::Keyed(keyed) => Some(&keyed.key.files),
        }
    }
}

/// Artifact configuration: patterns plus a flag controlling whether
/// artifacts from earlier steps are placed into this step's build
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ArtifactsDef")]
pub struct Artifacts {
    pub download: bool,
    pub paths: Vec<String>,
}

impl Default for Artifacts {
    fn default() -> Self {
        Self {
            download: true,
            paths: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactsDef {
    List(Vec<String>),
    Object {
        #[serde(default = "default_true")]
        download: bool,
        #[serde(default)]
        paths: Vec<String>,
    },
}

fn default_true() -> bool {
    true
}

impl From<ArtifactsDef> for Artifacts {
    fn from(def: ArtifactsDef) -> Self {
        match def {
            ArtifactsDef::List(paths) => Artifacts {
                download: true,
                paths,
            },
            ArtifactsDef::Object { download, paths } => Artifacts { download, paths },
        }
    }
}

/// How a step is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Automatic,
    Manual,
}

/// Step size multiplier, scaling memory and (optionally) CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepSize {
    #[default]
    #[serde(rename = "1x")]
    Size1,
    #[serde(rename = "2x")]
    Size2,
    #[serde(rename = "4x")]
    Size4,
    #[serde(rename = "8x")]
    Size8,
}

impl StepSize {
    pub fn multiplier(self) -> u64 {
        match self {
            StepSize::Size1 => 1,
            StepSize::Size2 => 2,
            StepSize::Size4 => 4,
            StepSize::Size8 => 8,
        }
    }
}

/// A single scripted unit of work running in one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default = "default_step_name")]
    pub name: String,
    pub script: Vec<String>,
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub caches: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default, rename = "after-script")]
    pub after_script: Vec<String>,
    #[serde(default)]
    pub size: StepSize,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
    /// Maximum run time in minutes.
    #[serde(default, rename = "max-time")]
    pub max_time: Option<u64>,
    #[serde(default)]
    pub oidc: bool,
    /// Step-local variables; the highest-precedence origin.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

fn default_step_name() -> String {
    "<unnamed>".to_string()
}

/// A variable the pipeline asks the user to supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default, rename = "allowed-values")]
    pub allowed_values: Option<Vec<String>>,
    #[serde(default)]
    pub secret: bool,
    /// A required variable with no default must be supplied explicitly.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepWrapper {
    pub step: Step,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelDef {
    Steps(Vec<StepWrapper>),
    Wrapped { steps: Vec<StepWrapper> },
}

impl ParallelDef {
    pub fn steps(&self) -> &[StepWrapper] {
        match self {
            ParallelDef::Steps(steps) => steps,
            ParallelDef::Wrapped { steps } => steps,
        }
    }
}

/// One element of a pipeline definition list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineElement {
    Variables { variables: Vec<VariableSpec> },
    Step { step: Step },
    Parallel { parallel: ParallelDef },
}

/// An ordered list of steps, parallel blocks, and (first only) variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    pub elements: Vec<PipelineElement>,
}

/// Execution mode of a step group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Sequential,
    Parallel,
}

/// A maximal run of steps sharing an execution mode.
#[derive(Debug, Clone)]
pub struct StepGroup {
    pub index: usize,
    pub mode: GroupMode,
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Variables declared by this pipeline (first element only).
    pub fn variables(&self) -> &[VariableSpec] {
        match self.elements.first() {
            Some(PipelineElement::Variables { variables }) => variables,
            _ => &[],
        }
    }

    /// Splits the pipeline into step groups: consecutive plain steps form
    /// one sequential group; each parallel block is its own group. A
    /// degenerate single-step parallel block is folded into the
    /// surrounding sequential run.
    pub fn step_groups(&self) -> Vec<StepGroup> {
        let mut groups: Vec<StepGroup> = Vec::new();
        let mut sequential: Vec<Step> = Vec::new();

        let mut flush_sequential = |groups: &mut Vec<StepGroup>, run: &mut Vec<Step>| {
            if !run.is_empty() {
                groups.push(StepGroup {
                    index: groups.len(),
                    mode: GroupMode::Sequential,
                    steps: std::mem::take(run),
                });
            }
        };

        for element in &self.elements {
            match element {
                PipelineElement::Variables { .. } => {}
                PipelineElement::Step { step } => sequential.push(step.clone()),
                PipelineElement::Parallel { parallel } => {
                    let steps: Vec<Step> =
                        parallel.steps().iter().map(|w| w.step.clone()).collect();

                    if steps.len() < 2 {
                        sequential.extend(steps);
                        continue;
                    }

                    flush_sequential(&mut groups, &mut sequential);
                    groups.push(StepGroup {
                        index: groups.len(),
                        mode: GroupMode::Parallel,
                        steps,
                    });
                }
            }
        }

        flush_sequential(&mut groups, &mut sequential);
        groups
    }
}

/// `definitions` block: named caches and services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub caches: BTreeMap<String, CacheSpec>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

/// All pipelines addressable by a dotted name (`custom.<name>`,
/// `branches.<name>`, or plain `default`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipelines {
    #[serde(default)]
    pub default: Option<Pipeline>,
    #[serde(default)]
    pub branches: BTreeMap<String, Pipeline>,
    #[serde(default, rename = "pull-requests")]
    pub pull_requests: BTreeMap<String, Pipeline>,
    #[serde(default)]
    pub custom: BTreeMap<String, Pipeline>,
    #[serde(default)]
    pub tags: BTreeMap<String, Pipeline>,
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Pipeline>,
}

impl Pipelines {
    pub fn get_all(&self) -> BTreeMap<String, &Pipeline> {
        let mut all = BTreeMap::new();

        if let Some(p) = &self.default {
            all.insert("default".to_string(), p);
        }

        let sections: [(&str, &BTreeMap<String, Pipeline>); 5] = [
            ("branches", &self.branches),
            ("pull-requests", &self.pull_requests),
            ("custom", &self.custom),
            ("tags", &self.tags),
            ("bookmarks", &self.bookmarks),
        ];

        for (section, pipelines) in sections {
            for (name, p) in pipelines {
                all.insert(format!("{section}.{name}"), p);
            }
        }

        all
    }

    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.get_all().get(name).copied()
    }

    pub fn available(&self) -> Vec<String> {
        self.get_all().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.get_all().is_empty()
    }
}

/// The root of a parsed pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub definitions: Definitions,
    pub pipelines: Pipelines,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_spec(yaml: &str) -> PipelineSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_string_image_normalises_to_object() {
        let spec = parse_spec(
            r#"
image: alpine:3.19
pipelines:
  default:
    - step:
        script:
          - echo hello
"#,
        );

        assert_eq!(spec.image.unwrap().name, "alpine:3.19");
    }

    #[test]
    fn test_full_image_with_run_as_user_as_int() {
        let spec = parse_spec(
            r#"
image:
  name: private.registry/app:1
  username: bob
  password: hunter2
  run-as-user: 1000
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        );

        let image = spec.image.unwrap();
        assert_eq!(image.run_as_user.as_deref(), Some("1000"));
        assert_eq!(image.username.as_deref(), Some("bob"));
    }

    #[test]
    fn test_image_debug_redacts_password() {
        let image = ImageSpec {
            password: Some("hunter2".into()),
            ..ImageSpec::from_name("private/app")
        };

        let debug = format!("{image:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_artifacts_list_form() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - step:
        script: [whoami]
        artifacts:
          - dist/**
          - report.txt
"#,
        );

        let groups = spec.pipelines.default.as_ref().unwrap().step_groups();
        let artifacts = &groups[0].steps[0].artifacts;
        assert!(artifacts.download);
        assert_eq!(artifacts.paths, vec!["dist/**", "report.txt"]);
    }

    #[test]
    fn test_artifacts_object_form_disables_download() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - step:
        script: [whoami]
        artifacts:
          download: false
          paths:
            - dist/**
"#,
        );

        let groups = spec.pipelines.default.as_ref().unwrap().step_groups();
        let artifacts = &groups[0].steps[0].artifacts;
        assert!(!artifacts.download);
        assert_eq!(artifacts.paths, vec!["dist/**"]);
    }

    #[test]
    fn test_keyed_cache() {
        let spec = parse_spec(
            r#"
definitions:
  caches:
    cargo-target:
      key:
        files:
          - Cargo.lock
      path: target
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        );

        let cache = &spec.definitions.caches["cargo-target"];
        assert_eq!(cache.declared_path(), "target");
        assert_eq!(cache.key_files().unwrap(), ["Cargo.lock"]);
    }

    #[test]
    fn test_step_groups_merge_consecutive_steps() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - step:
        name: one
        script: [whoami]
    - step:
        name: two
        script: [whoami]
    - parallel:
        - step:
            name: three
            script: [whoami]
        - step:
            name: four
            script: [whoami]
    - step:
        name: five
        script: [whoami]
"#,
        );

        let groups = spec.pipelines.default.as_ref().unwrap().step_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].mode, GroupMode::Sequential);
        assert_eq!(groups[0].steps.len(), 2);
        assert_eq!(groups[1].mode, GroupMode::Parallel);
        assert_eq!(groups[1].steps.len(), 2);
        assert_eq!(groups[2].mode, GroupMode::Sequential);
        assert_eq!(groups[2].steps[0].name, "five");
        assert_eq!(groups[2].index, 2);
    }

    #[test]
    fn test_single_step_parallel_folds_into_sequential_run() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - step:
        name: one
        script: [whoami]
    - parallel:
        - step:
            name: lonely
            script: [whoami]
"#,
        );

        let groups = spec.pipelines.default.as_ref().unwrap().step_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].mode, GroupMode::Sequential);
        assert_eq!(groups[0].steps.len(), 2);
    }

    #[test]
    fn test_parallel_wrapped_steps_form() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - parallel:
        steps:
          - step:
              name: a
              script: [whoami]
          - step:
              name: b
              script: [whoami]
"#,
        );

        let groups = spec.pipelines.default.as_ref().unwrap().step_groups();
        assert_eq!(groups[0].mode, GroupMode::Parallel);
        assert_eq!(groups[0].steps.len(), 2);
    }

    #[test]
    fn test_pipeline_variables_first_element() {
        let spec = parse_spec(
            r#"
pipelines:
  custom:
    deploy:
      - variables:
          - name: TARGET
            default: staging
            allowed-values: [staging, production]
      - step:
          script: [whoami]
"#,
        );

        let pipeline = spec.pipelines.get("custom.deploy").unwrap();
        let vars = pipeline.variables();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "TARGET");
        assert_eq!(vars[0].allowed_values.as_ref().unwrap().len(), 2);
        // Variables do not produce a step group.
        assert_eq!(pipeline.step_groups().len(), 1);
    }

    #[test]
    fn test_dotted_pipeline_names() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - step:
        script: [whoami]
  branches:
    main:
      - step:
          script: [whoami]
  custom:
    nightly:
      - step:
          script: [whoami]
"#,
        );

        let names = spec.pipelines.available();
        assert_eq!(names, vec!["branches.main", "custom.nightly", "default"]);
        assert!(spec.pipelines.get("branches.main").is_some());
        assert!(spec.pipelines.get("branches.missing").is_none());
    }

    #[test]
    fn test_service_environment_alias() {
        let spec = parse_spec(
            r#"
definitions:
  services:
    postgres:
      image: postgres:16
      environment:
        POSTGRES_PASSWORD: secret
      memory: 2048
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        );

        let service = &spec.definitions.services["postgres"];
        assert_eq!(service.variables["POSTGRES_PASSWORD"], "secret");
        assert_eq!(service.memory, 2048);
    }

    #[test]
    fn test_step_defaults() {
        let spec = parse_spec(
            r#"
pipelines:
  default:
    - step:
        script: [whoami]
"#,
        );

        let groups = spec.pipelines.default.as_ref().unwrap().step_groups();
        let step = &groups[0].steps[0];
        assert_eq!(step.name, "<unnamed>");
        assert_eq!(step.trigger, Trigger::Automatic);
        assert_eq!(step.size.multiplier(), 1);
        assert!(step.after_script.is_empty());
        assert!(!step.oidc);
        assert!(step.max_time.is_none());
    }
}
