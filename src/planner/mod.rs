//! Planning and execution.
//!
//! This module computes what must change to bring managed resources in
//! line with the configuration, and applies those changes in dependency
//! order.

mod diff;
mod executor;
mod plan;
mod resolve;

pub use diff::DiffEngine;
pub use executor::{ChangeResult, ExecutionOptions, ExecutionResult, PlanExecutor, ResourceStatus};
pub use plan::{
    AttributeChange, ChangeAction, DisplayValue, Plan, PlanKind, PlannedChange, UNKNOWN_VALUE,
};
pub use resolve::{AttributeResolver, DesiredAttribute, RemoteCache, ResolvedAttributes};
