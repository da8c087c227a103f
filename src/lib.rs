// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! A declarative, dependency-ordered reconciliation engine for infrastructure
//! definitions.
//!
//! ## Overview
//!
//! Stackwright reads a YAML document declaring resources and the references
//! between them, and converges a provider's real resources on that
//! declaration:
//!
//! - References between resources are typed values, so the dependency graph
//!   is derived structurally and cycles are rejected before any change
//! - Plans show every create, update and destroy before it happens
//! - Applies run independent resources concurrently, bounded by a limit
//! - A failure only stops the resources that depend on it
//! - Sensitive values never reach the state file, plans or logs
//!
//! ## Architecture
//!
//! 1. **Desired State**: loaded from `stackwright.yaml` by [`config`]
//! 2. **Dependency Graph**: built and topologically ordered by [`graph`]
//! 3. **Remote State**: read through a [`provider::ProviderClient`]
//! 4. **Reconciler**: diffs, plans and applies via [`planner`] and [`reconciler`]
//! 5. **State**: the last applied view, persisted by [`state`]
//!
//! ## Modules
//!
//! - [`config`]: Document parsing, variables and validation
//! - [`graph`]: Dependency graph and ordering
//! - [`provider`]: Provider client trait, HTTP and in-memory clients, retry
//! - [`planner`]: Diff computation, plans and the concurrent executor
//! - [`reconciler`]: Refresh, plan, apply and drift detection
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`sensitive`]: Redacting wrapper for secret values
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! provider:
//!   endpoint: https://cloud.example.com/api
//!
//! resources:
//!   - type: bucket
//!     name: assets
//!     attributes:
//!       acl: private
//!   - type: role
//!     name: reader
//!     attributes:
//!       policy_target: { ref: bucket.assets.arn }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod sensitive;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig, StackDocument};
pub use error::{Result, StackError};
pub use graph::DependencyGraph;
pub use planner::{DiffEngine, ExecutionResult, Plan, PlanExecutor};
pub use provider::{HttpProvider, MemoryProvider, ProviderClient};
pub use reconciler::{DriftReport, Reconciler};
pub use state::{DeploymentState, LocalStateStore, S3StateStore, StateStore};
