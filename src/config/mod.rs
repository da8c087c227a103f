//! Configuration module for the Stackwright engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing `stackwright.yaml` into the typed desired-state model
//! - Resolving variable values
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod model;
mod parser;
mod validator;
mod variables;
mod hash;

pub use spec::{
    DEFAULT_TOKEN_ENV, DeployConfig, ProjectConfig, ProviderConfig, RetryConfig, SettingsConfig,
    StateBackend, StateConfig,
};
pub use model::{
    AttributeValue, DesiredState, ReferenceExpr, ResourceAddress, ResourceDeclaration,
    StackDocument, Variable, VariableType,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationResult};
pub use variables::{EnvSource, VAR_ENV_PREFIX, VariableResolver, VariableValue, VariableValues};
pub use hash::ConfigHasher;
