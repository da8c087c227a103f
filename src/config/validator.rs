//! Configuration validation for stack documents.
//!
//! This module checks a loaded document for values that parse but cannot
//! work: bad identifiers, inconsistent retry settings, defaults that do not
//! match their declared type. Graph-level problems (unknown references,
//! cycles) are reported by the graph builder instead.

use crate::error::{ConfigError, Result, StackError};
use std::collections::BTreeSet;
use tracing::debug;

use super::model::{DesiredState, StackDocument};
use super::spec::{DeployConfig, StateBackend};

/// Validator for stack documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, document: &StackDocument) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&document.config, &mut result);
        Self::validate_state(&document.config, &mut result);
        Self::validate_provider(&document.config, &mut result);
        Self::validate_settings(&document.config, &mut result);
        Self::validate_variables(&document.desired, &mut result);
        Self::validate_resources(&document.desired, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    fn validate_project(config: &DeployConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        } else if project.environment.contains('/') {
            result.error(
                "project.environment",
                format!("Environment '{}' cannot contain '/'", project.environment),
            );
        }
    }

    fn validate_state(config: &DeployConfig, result: &mut ValidationResult) {
        let state = &config.state;
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_provider(config: &DeployConfig, result: &mut ValidationResult) {
        let provider = &config.provider;
        if let Some(endpoint) = &provider.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            result.error(
                "provider.endpoint",
                format!("Provider endpoint '{endpoint}' must start with http:// or https://"),
            );
        }

        if provider.token_env.is_empty() {
            result.error("provider.token_env", "Token environment variable cannot be empty");
        }

        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Provider timeout must be at least 1 second");
        }
    }

    fn validate_settings(config: &DeployConfig, result: &mut ValidationResult) {
        let settings = &config.settings;
        if settings.max_concurrency == 0 {
            result.error("settings.max_concurrency", "max_concurrency must be at least 1");
        }

        let retry = &settings.retry;
        if retry.max_attempts == 0 {
            result.error("settings.retry.max_attempts", "max_attempts must be at least 1");
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "settings.retry.initial_backoff_ms",
                format!(
                    "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                    retry.initial_backoff_ms, retry.max_backoff_ms
                ),
            );
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            result.error("settings.retry.multiplier", "multiplier must be at least 1.0");
        }
    }

    fn validate_variables(desired: &DesiredState, result: &mut ValidationResult) {
        let referenced = desired.referenced_variables();

        for (i, variable) in desired.variables.iter().enumerate() {
            let prefix = format!("variables[{i}]");

            if !is_valid_identifier(&variable.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Variable name '{}' is invalid. Must match [a-z_][a-z0-9_]*.",
                        variable.name
                    ),
                );
            }

            if let Some(default) = &variable.default
                && !variable.var_type.accepts(default)
            {
                result.error(
                    format!("{prefix}.default"),
                    format!(
                        "Default for variable '{}' is not a {}",
                        variable.name, variable.var_type
                    ),
                );
            }

            if !referenced.contains(variable.name.as_str()) {
                result
                    .warnings
                    .push(format!("{prefix}: Variable '{}' is never used", variable.name));
            }
        }
    }

    fn validate_resources(desired: &DesiredState, result: &mut ValidationResult) {
        if desired.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        for (i, resource) in desired.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let address = &resource.address;

            if !is_valid_identifier(&address.resource_type) {
                result.error(
                    format!("{prefix}.type"),
                    format!(
                        "Resource type '{}' is invalid. Must match [a-z][a-z0-9_]*.",
                        address.resource_type
                    ),
                );
            } else if address.resource_type.starts_with('_') {
                result.error(
                    format!("{prefix}.type"),
                    format!("Resource type '{}' cannot start with '_'", address.resource_type),
                );
            }

            if !is_valid_resource_name(&address.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must match [a-z_][a-z0-9_-]*.",
                        address.name
                    ),
                );
            }

            if resource.depends_on.contains(address) {
                result.error(
                    format!("{prefix}.depends_on"),
                    format!("Resource {address} depends on itself"),
                );
            }

            let referenced: BTreeSet<_> =
                resource.references().into_iter().map(|r| &r.target).collect();
            for dep in &resource.depends_on {
                if referenced.contains(dep) {
                    result.warnings.push(format!(
                        "{prefix}.depends_on: {dep} is already implied by a reference"
                    ));
                }
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Identifiers: `[a-z_][a-z0-9_]*`.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Resource names additionally allow hyphens after the first character.
fn is_valid_resource_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
