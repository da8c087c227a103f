//! State types for tracking managed resources.
//!
//! The state maps each managed resource address to the provider-assigned
//! identifier, its last known attributes, and the dependencies it had when
//! it was last applied. It never holds a sensitive value: secret attributes
//! are stored as fingerprints only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ResourceAddress;
use crate::error::{Result, StackError, StateError};
use crate::provider::Attributes;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of one project environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied configuration.
    pub config_hash: String,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// Managed resources keyed by address.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// Recorded state of one managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource address.
    pub address: ResourceAddress,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Last known non-sensitive attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Fingerprints of sensitive attributes, keyed by attribute name.
    #[serde(default)]
    pub sensitive: BTreeMap<String, String>,
    /// Dependencies at the time of the last apply.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
    /// Attribute names the configuration declared at the last apply.
    #[serde(default)]
    pub declared: BTreeSet<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last changed.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Configuration hash at the time of the run.
    pub config_hash: String,
    /// Resources changed.
    pub resources: Vec<String>,
    /// Whether every change succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Apply of a plan.
    Apply,
    /// Destruction of every managed resource.
    Destroy,
    /// Manual removal of records from state.
    StateRemove,
}

impl DeploymentState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            serial: 0,
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses a stored state document.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for invalid JSON and `VersionMismatch` for a
    /// state written in another format version.
    pub fn from_json(content: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;
        if state.version != STATE_VERSION {
            return Err(StackError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }
        Ok(state)
    }

    /// Serializes the state for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })
    }

    /// Returns `project/environment`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project, self.environment)
    }

    /// Gets a resource record by address.
    #[must_use]
    pub fn get_resource(&self, address: &ResourceAddress) -> Option<&ResourceRecord> {
        self.resources.get(&address.to_string())
    }

    /// Adds or replaces a resource record.
    pub fn set_resource(&mut self, record: ResourceRecord) {
        self.resources.insert(record.address.to_string(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a resource record.
    pub fn remove_resource(&mut self, address: &ResourceAddress) -> Option<ResourceRecord> {
        let result = self.resources.remove(&address.to_string());
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Addresses of every managed resource, sorted.
    #[must_use]
    pub fn addresses(&self) -> Vec<ResourceAddress> {
        self.resources.values().map(|r| r.address.clone()).collect()
    }

    /// Recorded dependency edges `(from, to)`.
    #[must_use]
    pub fn dependency_edges(&self) -> Vec<(ResourceAddress, ResourceAddress)> {
        self.resources
            .values()
            .flat_map(|r| {
                r.dependencies
                    .iter()
                    .map(move |d| (r.address.clone(), d.clone()))
            })
            .collect()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Marks the state as about to be persisted.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(address: ResourceAddress, provider_id: &str) -> Self {
        let now = Utc::now();
        Self {
            address,
            provider_id: provider_id.to_string(),
            attributes: Attributes::new(),
            sensitive: BTreeMap::new(),
            dependencies: Vec::new(),
            declared: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl DeploymentHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: DeploymentOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: DeploymentOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::StateRemove => "state rm",
        };
        write!(f, "{op}")
    }
}
