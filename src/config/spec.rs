//! Configuration document types.
//!
//! This module defines the structs that map to `stackwright.yaml`. The
//! `resources` and `variables` sections are kept as raw YAML here and turned
//! into the typed model by the parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default environment variable holding the provider bearer token.
pub const DEFAULT_TOKEN_ENV: &str = "STACKWRIGHT_PROVIDER_TOKEN";

/// The raw configuration document as written on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentSpec {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Engine settings.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Declared variables.
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Everything in the document except the declarations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    pub state: StateConfig,
    /// Provider endpoint configuration.
    pub provider: ProviderConfig,
    /// Engine settings.
    pub settings: SettingsConfig,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Provider region, passed through to the provider as metadata.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SettingsConfig {
    /// Maximum in-flight provider calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Stop scheduling new work after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            fail_fast: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// A raw variable declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableSpec {
    /// Variable name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type", default)]
    pub var_type: super::model::VariableType,
    /// Default value.
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    /// Whether the value is secret.
    #[serde(default)]
    pub sensitive: bool,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A raw resource declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Explicit dependencies as `type.name`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from(DEFAULT_TOKEN_ENV)
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

impl DeployConfig {
    /// Returns `project/environment`, used to key state.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project.name, self.project.environment)
    }
}
