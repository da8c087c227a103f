//! Desired-state loader.
//!
//! Loads a YAML configuration document, applies environment overrides, and
//! converts the `resources` and `variables` sections into the typed model.
//! Loading is pure: nothing here talks to a provider.

use crate::error::{ConfigError, Result, StackError};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use super::model::{AttributeValue, DesiredState, ResourceAddress, ResourceDeclaration, StackDocument, Variable};
use super::spec::{DeployConfig, DocumentSpec, ResourceSpec, VariableSpec};

/// Configuration parser for loading stack documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackDocument> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Loads a document and applies environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackDocument> {
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document.config);
        Ok(document)
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for invalid syntax or malformed expressions,
    /// `DuplicateName` for repeated declarations, and `UndeclaredVariable`
    /// when a value uses a variable that is not declared.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackDocument> {
        debug!("Parsing YAML configuration");

        let raw: DocumentSpec = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source, e.location()) {
                (Some(p), Some(loc)) => Some(format!("{}:{}:{}", p.display(), loc.line(), loc.column())),
                (None, Some(loc)) => Some(format!("line {}, column {}", loc.line(), loc.column())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, None) => None,
            };
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        let variables = Self::convert_variables(&raw.variables)?;
        let resources = Self::convert_resources(&raw.resources)?;
        let desired = DesiredState {
            resources,
            variables,
        };
        Self::check_variable_references(&desired)?;

        debug!(
            "Parsed {} resources and {} variables for project: {}",
            desired.resources.len(),
            desired.variables.len(),
            raw.project.name
        );

        Ok(StackDocument {
            config: DeployConfig {
                project: raw.project,
                state: raw.state,
                provider: raw.provider,
                settings: raw.settings,
            },
            desired,
        })
    }

    fn convert_variables(specs: &[VariableSpec]) -> Result<Vec<Variable>> {
        let mut seen = BTreeSet::new();
        let mut variables = Vec::with_capacity(specs.len());

        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(StackError::Config(ConfigError::DuplicateName {
                    kind: String::from("variable"),
                    name: spec.name.clone(),
                }));
            }

            let default = match &spec.default {
                None | Some(serde_yaml::Value::Null) => None,
                Some(value) => Some(serde_json::to_value(value).map_err(|e| {
                    StackError::Config(ConfigError::ParseError {
                        message: format!("Invalid default for variable '{}': {e}", spec.name),
                        location: Some(format!("variables.{}.default", spec.name)),
                    })
                })?),
            };

            variables.push(Variable {
                name: spec.name.clone(),
                var_type: spec.var_type,
                default,
                sensitive: spec.sensitive,
                description: spec.description.clone(),
            });
        }

        Ok(variables)
    }

    fn convert_resources(specs: &[ResourceSpec]) -> Result<Vec<ResourceDeclaration>> {
        let mut seen = BTreeSet::new();
        let mut resources = Vec::with_capacity(specs.len());

        for (index, spec) in specs.iter().enumerate() {
            let address = ResourceAddress::new(&spec.resource_type, &spec.name);
            if !seen.insert(address.clone()) {
                return Err(StackError::Config(ConfigError::DuplicateName {
                    kind: String::from("resource"),
                    name: address.to_string(),
                }));
            }

            let mut attributes = std::collections::BTreeMap::new();
            for (key, value) in &spec.attributes {
                let converted = AttributeValue::from_yaml(value).map_err(|message| {
                    StackError::Config(ConfigError::ParseError {
                        message,
                        location: Some(format!("{address}.attributes.{key}")),
                    })
                })?;
                attributes.insert(key.clone(), converted);
            }

            let depends_on = spec
                .depends_on
                .iter()
                .map(|d| {
                    d.parse::<ResourceAddress>().map_err(|message| {
                        StackError::Config(ConfigError::ParseError {
                            message,
                            location: Some(format!("{address}.depends_on")),
                        })
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            resources.push(ResourceDeclaration {
                address,
                attributes,
                depends_on,
                index,
            });
        }

        Ok(resources)
    }

    fn check_variable_references(desired: &DesiredState) -> Result<()> {
        for resource in &desired.resources {
            for name in resource.variables() {
                if desired.variable(name).is_none() {
                    return Err(StackError::Config(ConfigError::UndeclaredVariable {
                        name: name.to_string(),
                        resource: resource.address.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut DeployConfig) {
        if let Ok(name) = std::env::var("STACKWRIGHT_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("STACKWRIGHT_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(region) = std::env::var("STACKWRIGHT_PROJECT_REGION") {
            debug!("Overriding project.region from environment");
            config.project.region = Some(region);
        }

        if let Ok(bucket) = std::env::var("STACKWRIGHT_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("STACKWRIGHT_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("STACKWRIGHT_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(limit) = std::env::var("STACKWRIGHT_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            debug!("Overriding settings.max_concurrency from environment");
            config.settings.max_concurrency = limit;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackwright.yaml",
    "stackwright.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::VariableType;

    const PIPELINE: &str = r#"
project:
  name: codedeploy-stack
  environment: prod
  region: us-east-1

variables:
  - name: github_token
    sensitive: true
  - name: branch
    default: main

resources:
  - type: aws_s3_bucket
    name: artifacts
    attributes:
      bucket: codedeploy-artifacts
  - type: aws_iam_role
    name: pipeline
    attributes:
      assume_role_policy:
        Version: "2012-10-17"
      artifact_bucket: { ref: aws_s3_bucket.artifacts.arn }
  - type: aws_codepipeline
    name: main
    depends_on: [aws_iam_role.pipeline]
    attributes:
      role_arn: { ref: aws_iam_role.pipeline.arn }
      source:
        branch: { var: branch }
        oauth_token: { var: github_token }
"#;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let doc = parser.parse_yaml(yaml, None).expect("parse");
        assert_eq!(doc.config.project.name, "test-project");
        assert_eq!(doc.config.project.environment, "dev");
        assert!(doc.desired.resources.is_empty());
    }

    #[test]
    fn test_parse_pipeline_document() {
        let parser = ConfigParser::new();
        let doc = parser.parse_yaml(PIPELINE, None).expect("parse");

        assert_eq!(doc.desired.resources.len(), 3);
        assert_eq!(doc.desired.variables.len(), 2);
        assert_eq!(doc.desired.variables[0].var_type, VariableType::String);
        assert!(doc.desired.variables[0].sensitive);
        assert_eq!(
            doc.desired.variables[1].default,
            Some(serde_json::json!("main"))
        );

        let pipeline = &doc.desired.resources[2];
        assert_eq!(pipeline.index, 2);
        assert_eq!(pipeline.address.to_string(), "aws_codepipeline.main");
        assert_eq!(
            pipeline.dependencies(),
            vec![ResourceAddress::new("aws_iam_role", "pipeline")]
        );
        let vars: Vec<_> = pipeline.variables().into_iter().collect();
        assert_eq!(vars, vec!["branch", "github_token"]);
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        let parser = ConfigParser::new();
        let err = parser
            .parse_yaml("project: [unclosed", None)
            .expect_err("must fail");
        assert!(matches!(
            err,
            StackError::Config(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_undeclared_variable() {
        let yaml = r"
project:
  name: demo
resources:
  - type: aws_s3_bucket
    name: logs
    attributes:
      bucket: { var: bucket_name }
";
        let err = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect_err("must fail");
        match err {
            StackError::Config(ConfigError::UndeclaredVariable { name, resource }) => {
                assert_eq!(name, "bucket_name");
                assert_eq!(resource, "aws_s3_bucket.logs");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_resource() {
        let yaml = r"
project:
  name: demo
resources:
  - { type: aws_s3_bucket, name: logs }
  - { type: aws_s3_bucket, name: logs }
";
        let err = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect_err("must fail");
        assert!(matches!(
            err,
            StackError::Config(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_malformed_reference_has_location() {
        let yaml = r"
project:
  name: demo
resources:
  - type: aws_iam_role
    name: r
    attributes:
      bucket: { ref: aws_s3_bucket }
";
        let err = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect_err("must fail");
        match err {
            StackError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("aws_iam_role.r.attributes.bucket"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("stackwright.yaml"), "project: {name: x}\n").expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("stackwright.yaml"));
    }
}
