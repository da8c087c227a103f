//! Retry of transient provider failures.
//!
//! Delays grow geometrically from `initial_backoff` by `multiplier` and are
//! capped at `max_backoff`. A provider's own retry hint takes precedence,
//! still capped. Fatal errors are returned at once.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ResourceAddress, RetryConfig};
use crate::error::ProviderError;

use super::{Attributes, ProviderClient, ProviderResult, RemoteState};

/// Retry policy for provider calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_backoff);
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_backoff
        }
    }

    /// Runs `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the fatal error, or `RetriesExhausted` carrying the last
    /// transient message.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ProviderResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Transient {
                    message,
                    retry_after,
                }) => {
                    if attempt >= self.max_attempts {
                        warn!("{what}: giving up after {attempt} attempts");
                        return Err(ProviderError::RetriesExhausted {
                            attempts: attempt,
                            last: message,
                        });
                    }
                    let delay = self.delay_for(attempt, retry_after);
                    debug!(
                        "{what}: transient failure ({message}), retry {attempt}/{} in {delay:?}",
                        self.max_attempts - 1
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Provider wrapper retrying transient failures of every call.
#[derive(Clone)]
pub struct RetryingProvider {
    inner: Arc<dyn ProviderClient>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RetryingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingProvider")
            .field("inner", &self.inner.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryingProvider {
    /// Wraps `inner` with `policy`.
    #[must_use]
    pub fn new(inner: Arc<dyn ProviderClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ProviderClient for RetryingProvider {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn describe(&self, resource_type: &str, id: &str) -> ProviderResult<Option<RemoteState>> {
        self.policy
            .run(&format!("describe {resource_type} {id}"), || {
                self.inner.describe(resource_type, id)
            })
            .await
    }

    async fn create(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState> {
        self.policy
            .run(&format!("create {address}"), || self.inner.create(address, attributes))
            .await
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState> {
        self.policy
            .run(&format!("update {resource_type} {id}"), || {
                self.inner.update(resource_type, id, attributes)
            })
            .await
    }

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        self.policy
            .run(&format!("delete {resource_type} {id}"), || {
                self.inner.delete(resource_type, id)
            })
            .await
    }
}
