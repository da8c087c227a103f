//! Error types for the Stackwright reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! loading the configuration document, building the dependency graph,
//! talking to the provider, persisting state, and applying changes.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for Stackwright.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Dependency graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {message}{}", location.as_ref().map(|l| format!(" (at {l})")).unwrap_or_default())]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A value references a variable that was never declared.
    #[error("Resource {resource} references undeclared variable '{name}'")]
    UndeclaredVariable {
        /// Name of the undeclared variable.
        name: String,
        /// Address of the referencing resource.
        resource: String,
    },

    /// A referenced variable has no value and no default.
    #[error("No value for variable '{name}' (set --var {name}=..., or {env_var})")]
    MissingVariableValue {
        /// Variable name.
        name: String,
        /// Environment variable that could supply it.
        env_var: String,
    },

    /// A variable value does not match its declared type.
    #[error("Invalid value for variable '{name}': expected {expected}")]
    InvalidVariableValue {
        /// Variable name.
        name: String,
        /// Expected type.
        expected: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource or variable definition.
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName {
        /// Kind of item (resource, variable).
        kind: String,
        /// The duplicated name.
        name: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Resources reference each other in a loop.
    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Addresses forming the cycle, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// A reference points at a resource that is not declared.
    #[error("Resource {from} references undeclared resource {target}")]
    UnresolvedReference {
        /// Referencing resource.
        from: String,
        /// Missing target.
        target: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State storage could not be read or written.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State written for a different project or environment.
    #[error("State belongs to {found}, expected {expected}")]
    ProjectMismatch {
        /// Expected `project/environment`.
        expected: String,
        /// Found `project/environment`.
        found: String,
    },

    /// Address not present in the state.
    #[error("{address} is not managed in this state")]
    NotManaged {
        /// Resource address.
        address: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors returned by a provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Rate limiting, eventual consistency gaps, network blips. Retried.
    #[error("transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Provider hint for when to retry.
        retry_after: Option<Duration>,
    },

    /// The provider rejected the operation. Not retried.
    #[error("provider rejected operation: {message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },

    /// Transient failures continued past the retry budget.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Message of the last transient failure.
        last: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A single resource could not be reconciled.
    #[error("Failed to {action} {address}: {reason}")]
    ResourceFailed {
        /// Resource address.
        address: String,
        /// Action being applied.
        action: String,
        /// Reason for failure.
        reason: String,
    },

    /// Some resources failed or were skipped; applied changes were kept.
    #[error("{0}")]
    PartialApply(PartialApplySummary),

    /// Reconciliation was aborted before any change was made.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Outcome lists carried by [`ReconcileError::PartialApply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PartialApplySummary {
    /// Resources whose change was applied.
    pub applied: Vec<String>,
    /// Resources whose change failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Resources that were never attempted.
    pub skipped: Vec<String>,
}

impl std::fmt::Display for PartialApplySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Partial apply: {} applied, {} failed, {} skipped",
            self.applied.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        for (address, reason) in &self.failed {
            write!(f, "; {address} failed: {reason}")?;
        }
        if !self.skipped.is_empty() {
            write!(f, "; skipped: {}", self.skipped.join(", "))?;
        }
        Ok(())
    }
}

/// Result type alias for Stackwright operations.
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay, if applicable.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(e) => e.retry_after(),
            Self::State(StateError::LockFailed { .. }) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a parse error without a location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the provider's retry hint.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the error with its message passed through `f`.
    #[must_use]
    pub fn map_message(self, f: impl Fn(&str) -> String) -> Self {
        match self {
            Self::Transient {
                message,
                retry_after,
            } => Self::Transient {
                message: f(&message),
                retry_after,
            },
            Self::Fatal { message } => Self::Fatal {
                message: f(&message),
            },
            Self::RetriesExhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                last: f(&last),
            },
        }
    }
}
