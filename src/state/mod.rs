//! State management module for the Stackwright engine.
//!
//! This module provides persistent state storage for tracking managed
//! resources: provider identifiers, last known attributes, recorded
//! dependencies, and run history.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LockInfo, generate_holder_id};
pub use types::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceRecord, STATE_VERSION,
};

use crate::config::{DeployConfig, StateBackend};
use crate::error::Result;

/// Opens the state store configured for `config`.
///
/// # Errors
///
/// Returns an error if the backend cannot be initialized.
pub async fn open_store(config: &DeployConfig) -> Result<Box<dyn StateStore>> {
    let project = &config.project.name;
    let environment = &config.project.environment;

    match config.state.backend {
        StateBackend::Local => {
            let store = match &config.state.path {
                Some(path) => LocalStateStore::for_project(path, project, environment),
                None => LocalStateStore::in_current_dir(project, environment)?,
            };
            Ok(Box::new(store))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().unwrap_or_default();
            let store = S3StateStore::new(
                bucket,
                config.state.prefix.as_deref(),
                config.state.region.as_deref(),
                project,
                environment,
            )
            .await?;
            Ok(Box::new(store))
        }
    }
}
