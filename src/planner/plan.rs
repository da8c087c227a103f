//! Plan types.
//!
//! A plan lists one [`PlannedChange`] per resource: creates, updates and
//! no-ops for declared resources in apply order, then destroys for
//! resources no longer declared in reverse dependency order. Its JSON form
//! never contains a sensitive value.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

use crate::config::ResourceAddress;
use crate::error::{Result, StackError, StateError};
use crate::sensitive::REDACTED;

use super::resolve::{DesiredAttribute, RemoteCache};

/// Placeholder shown for values known only after apply.
pub const UNKNOWN_VALUE: &str = "(known after apply)";

/// What a plan does to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Destroy,
    /// Leave the resource as it is.
    NoOp,
}

impl ChangeAction {
    /// Returns true for actions that call the provider.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// One-character marker used in plan listings.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Destroy => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

/// An attribute value as it may be shown to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayValue {
    /// A plain value.
    Known(serde_json::Value),
    /// A value that must not be shown.
    Sensitive,
    /// A value known only after apply.
    Unknown,
}

impl From<&DesiredAttribute> for DisplayValue {
    fn from(value: &DesiredAttribute) -> Self {
        match value {
            DesiredAttribute::Known(v) => Self::Known(v.clone()),
            DesiredAttribute::Secret(_) => Self::Sensitive,
            DesiredAttribute::Unknown => Self::Unknown,
        }
    }
}

impl Serialize for DisplayValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => v.serialize(serializer),
            Self::Sensitive => serializer.serialize_str(REDACTED),
            Self::Unknown => serializer.serialize_str(UNKNOWN_VALUE),
        }
    }
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Sensitive => f.write_str(REDACTED),
            Self::Unknown => f.write_str(UNKNOWN_VALUE),
        }
    }
}

/// One attribute that differs between desired and observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Observed value, if the resource exists and has the attribute.
    pub old: Option<DisplayValue>,
    /// Desired value.
    pub new: DisplayValue,
}

/// The planned change for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    /// Resource address.
    pub address: ResourceAddress,
    /// Action to take.
    pub action: ChangeAction,
    /// Position in the apply order, or in the destroy order for destroys.
    /// Starts at 1.
    pub rank: usize,
    /// Provider identifier of the existing resource.
    pub provider_id: Option<String>,
    /// Why this action was chosen.
    pub reason: String,
    /// Attribute differences.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Resources whose change in the same phase must complete first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<ResourceAddress>,
}

/// What a plan was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Converge on the declared resources.
    Apply,
    /// Remove every managed resource.
    Destroy,
}

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// What the plan converges on.
    pub kind: PlanKind,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// Planned changes: apply phase in rank order, then destroy phase.
    pub changes: Vec<PlannedChange>,
    /// Records whose resource no longer exists; dropped from state on apply.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub forgotten: Vec<ResourceAddress>,
    /// Observed remote states the plan was computed from.
    #[serde(skip)]
    pub observed: RemoteCache,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(
        kind: PlanKind,
        project: &str,
        environment: &str,
        config_hash: &str,
        state_serial: u64,
    ) -> Self {
        Self {
            kind,
            project: project.to_string(),
            environment: environment.to_string(),
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            state_serial,
            changes: Vec::new(),
            forgotten: Vec::new(),
            observed: RemoteCache::new(),
        }
    }

    /// Looks up the change planned for `address`.
    #[must_use]
    pub fn change_for(&self, address: &ResourceAddress) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| &c.address == address)
    }

    /// Returns true if applying the plan would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forgotten.is_empty() && !self.changes.iter().any(|c| c.action.is_change())
    }

    /// Counts changes with `action`.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Number of resources to create.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ChangeAction::Create)
    }

    /// Number of resources to update.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ChangeAction::Update)
    }

    /// Number of resources to destroy.
    #[must_use]
    pub fn destroy_count(&self) -> usize {
        self.count(ChangeAction::Destroy)
    }

    /// Number of resources left as they are.
    #[must_use]
    pub fn unchanged_count(&self) -> usize {
        self.count(ChangeAction::NoOp)
    }

    /// One-line summary of the counts.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to destroy",
            self.create_count(),
            self.update_count(),
            self.destroy_count()
        )
    }

    /// Serializes the plan as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize plan: {e}"
            )))
        })
    }
}

impl fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.action.symbol(), self.action, self.address)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        for change in &self.changes {
            match &change.old {
                Some(old) => write!(f, "\n      {}: {old} -> {}", change.attribute, change.new)?,
                None => write!(f, "\n      {}: {}", change.attribute, change.new)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes. Infrastructure matches the configuration.");
        }

        writeln!(f, "Plan for {}/{}:", self.project, self.environment)?;
        for change in self.changes.iter().filter(|c| c.action.is_change()) {
            writeln!(f, "  {:>3}. {change}", change.rank)?;
        }
        for address in &self.forgotten {
            writeln!(f, "  forget {address} (no longer exists)")?;
        }
        write!(f, "{}", self.summary())
    }
}
