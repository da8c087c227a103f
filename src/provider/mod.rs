//! Provider abstraction.
//!
//! A provider owns the real resources. The engine only ever asks it four
//! things: describe a resource, create one, update one, delete one. Every
//! call may fail transiently (retried by [`RetryingProvider`]) or fatally.

mod http;
mod memory;
mod retry;

pub use http::HttpProvider;
pub use memory::{MemoryProvider, OpRecord, Operation};
pub use retry::{RetryPolicy, RetryingProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ResourceAddress;
use crate::error::ProviderError;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Attribute map sent to or received from a provider.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// What the provider reports about a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteState {
    /// Provider-assigned identifier.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// Observed attributes, including computed ones.
    #[serde(default)]
    pub attributes: Attributes,
}

impl RemoteState {
    /// Returns an observed attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }
}

/// Operations the engine needs from a provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> String;

    /// Reads a resource. Returns `None` if it no longer exists.
    async fn describe(&self, resource_type: &str, id: &str) -> ProviderResult<Option<RemoteState>>;

    /// Creates a resource and returns its observed state.
    async fn create(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState>;

    /// Updates a resource in place and returns its observed state.
    ///
    /// A `null` attribute value clears that attribute.
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState>;

    /// Deletes a resource. Deleting a missing resource succeeds.
    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()>;
}
