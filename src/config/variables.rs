//! Variable value resolution.
//!
//! A variable's value comes from, in order of precedence, a `--var` command
//! line assignment, the `STACKWRIGHT_VAR_<name>` environment variable, or the
//! declared default. Only variables that some resource uses must resolve.

use crate::error::{ConfigError, Result, StackError};
use crate::sensitive::{Redactor, Sensitive};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::model::{DesiredState, Variable, VariableType};

/// Prefix of environment variables supplying variable values.
pub const VAR_ENV_PREFIX: &str = "STACKWRIGHT_VAR_";

/// Where environment lookups are answered from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// The process environment.
    #[default]
    Process,
    /// A fixed map, used in tests and embedding.
    Fixed(BTreeMap<String, String>),
}

impl EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::Process => std::env::var(key).ok(),
            Self::Fixed(map) => map.get(key).cloned(),
        }
    }
}

/// A resolved variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    /// A value that may be shown.
    Plain(serde_json::Value),
    /// A value declared sensitive.
    Secret(Sensitive<serde_json::Value>),
}

impl VariableValue {
    /// Returns the underlying value. Callers must not log secret values.
    #[must_use]
    pub const fn value(&self) -> &serde_json::Value {
        match self {
            Self::Plain(v) => v,
            Self::Secret(v) => v.expose(),
        }
    }

    /// Returns true if the value is sensitive.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(self, Self::Secret(_))
    }
}

/// All resolved variable values of a run.
#[derive(Debug, Clone, Default)]
pub struct VariableValues {
    values: BTreeMap<String, VariableValue>,
}

impl VariableValues {
    /// Looks up a value by variable name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.values.get(name)
    }

    /// Inserts a value directly.
    pub fn insert(&mut self, name: impl Into<String>, value: VariableValue) {
        self.values.insert(name.into(), value);
    }

    /// Number of resolved values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds a redactor knowing every sensitive value.
    #[must_use]
    pub fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        for value in self.values.values() {
            if let VariableValue::Secret(secret) = value {
                redactor.register(secret.expose());
            }
        }
        redactor
    }
}

/// Resolves declared variables to values.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    overrides: BTreeMap<String, String>,
    env: EnvSource,
}

impl VariableResolver {
    /// Creates a resolver reading the process environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets command line assignments.
    #[must_use]
    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Sets the environment source.
    #[must_use]
    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    /// Parses `NAME=VALUE` command line assignments.
    ///
    /// # Errors
    ///
    /// Returns an error if an assignment has no `=` or an empty name.
    pub fn parse_assignments(assignments: &[String]) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for assignment in assignments {
            let (name, value) = assignment
                .split_once('=')
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| {
                    StackError::Config(ConfigError::validation(
                        format!("Invalid --var '{assignment}', expected NAME=VALUE"),
                        "var",
                    ))
                })?;
            map.insert(name.to_string(), value.to_string());
        }
        Ok(map)
    }

    /// Resolves every declared variable that has a value.
    ///
    /// # Errors
    ///
    /// Returns `MissingVariableValue` when a variable used by a resource has
    /// no value, `InvalidVariableValue` when a value does not match its
    /// declared type, and a validation error when `--var` names an
    /// undeclared variable.
    pub fn resolve(&self, desired: &DesiredState) -> Result<VariableValues> {
        for name in self.overrides.keys() {
            if desired.variable(name).is_none() {
                return Err(StackError::Config(ConfigError::validation(
                    format!("--var sets undeclared variable '{name}'"),
                    "var",
                )));
            }
        }

        let referenced = desired.referenced_variables();
        let mut values = VariableValues::default();

        for variable in &desired.variables {
            let env_var = format!("{VAR_ENV_PREFIX}{}", variable.name);
            let raw = self
                .overrides
                .get(&variable.name)
                .cloned()
                .or_else(|| self.env.get(&env_var));

            let value = match (raw, &variable.default) {
                (Some(raw), _) => Some(Self::convert(variable, &raw)?),
                (None, Some(default)) => Some(default.clone()),
                (None, None) => None,
            };

            let Some(value) = value else {
                if referenced.contains(variable.name.as_str()) {
                    return Err(StackError::Config(ConfigError::MissingVariableValue {
                        name: variable.name.clone(),
                        env_var,
                    }));
                }
                warn!("Variable '{}' has no value and is not used", variable.name);
                continue;
            };

            if !variable.var_type.accepts(&value) {
                return Err(StackError::Config(ConfigError::InvalidVariableValue {
                    name: variable.name.clone(),
                    expected: variable.var_type.to_string(),
                }));
            }

            debug!("Resolved variable '{}'", variable.name);
            let value = if variable.sensitive {
                VariableValue::Secret(Sensitive::new(value))
            } else {
                VariableValue::Plain(value)
            };
            values.insert(variable.name.clone(), value);
        }

        Ok(values)
    }

    fn convert(variable: &Variable, raw: &str) -> Result<serde_json::Value> {
        match variable.var_type {
            VariableType::String => Ok(serde_json::Value::String(raw.to_string())),
            VariableType::Any => Ok(serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))),
            other => serde_json::from_str(raw).map_err(|_| {
                StackError::Config(ConfigError::InvalidVariableValue {
                    name: variable.name.clone(),
                    expected: other.to_string(),
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use serde_json::json;

    const DOC: &str = r"
project:
  name: demo
variables:
  - name: branch
    default: main
  - name: replicas
    type: number
  - name: github_token
    sensitive: true
  - name: unused
resources:
  - type: aws_codepipeline
    name: main
    attributes:
      branch: { var: branch }
      replicas: { var: replicas }
      token: { var: github_token }
";

    fn desired() -> DesiredState {
        ConfigParser::new()
            .parse_yaml(DOC, None)
            .expect("parse")
            .desired
    }

    fn env(pairs: &[(&str, &str)]) -> EnvSource {
        EnvSource::Fixed(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_precedence_override_env_default() {
        let resolver = VariableResolver::new()
            .with_overrides(BTreeMap::from([(String::from("branch"), String::from("release"))]))
            .with_env(env(&[
                ("STACKWRIGHT_VAR_branch", "develop"),
                ("STACKWRIGHT_VAR_replicas", "3"),
                ("STACKWRIGHT_VAR_github_token", "ghp_secret"),
            ]));

        let values = resolver.resolve(&desired()).expect("resolve");
        assert_eq!(values.get("branch").map(VariableValue::value), Some(&json!("release")));
        assert_eq!(values.get("replicas").map(VariableValue::value), Some(&json!(3)));
        assert!(values.get("github_token").is_some_and(VariableValue::is_sensitive));
        assert!(values.get("unused").is_none());
    }

    #[test]
    fn test_missing_referenced_value() {
        let resolver = VariableResolver::new().with_env(env(&[("STACKWRIGHT_VAR_replicas", "1")]));
        let err = resolver.resolve(&desired()).expect_err("must fail");
        match err {
            StackError::Config(ConfigError::MissingVariableValue { name, env_var }) => {
                assert_eq!(name, "github_token");
                assert_eq!(env_var, "STACKWRIGHT_VAR_github_token");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_type_mismatch() {
        let resolver = VariableResolver::new().with_env(env(&[
            ("STACKWRIGHT_VAR_replicas", "three"),
            ("STACKWRIGHT_VAR_github_token", "x"),
        ]));
        let err = resolver.resolve(&desired()).expect_err("must fail");
        assert!(matches!(
            err,
            StackError::Config(ConfigError::InvalidVariableValue { .. })
        ));
    }

    #[test]
    fn test_redactor_knows_secrets() {
        let resolver = VariableResolver::new().with_env(env(&[
            ("STACKWRIGHT_VAR_replicas", "2"),
            ("STACKWRIGHT_VAR_github_token", "ghp_secret"),
        ]));
        let values = resolver.resolve(&desired()).expect("resolve");
        let redactor = values.redactor();
        assert_eq!(redactor.scrub("token ghp_secret rejected"), "token (sensitive) rejected");
        assert!(!format!("{values:?}").contains("ghp_secret"));
    }

    #[test]
    fn test_parse_assignments() {
        let map = VariableResolver::parse_assignments(&[String::from("a=b=c")]).expect("parse");
        assert_eq!(map.get("a").map(String::as_str), Some("b=c"));
        assert!(VariableResolver::parse_assignments(&[String::from("=x")]).is_err());
        assert!(VariableResolver::parse_assignments(&[String::from("novalue")]).is_err());
    }

    #[test]
    fn test_undeclared_override_rejected() {
        let resolver = VariableResolver::new()
            .with_overrides(BTreeMap::from([(String::from("nope"), String::from("1"))]));
        assert!(resolver.resolve(&desired()).is_err());
    }
}
