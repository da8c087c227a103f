//! In-process provider.
//!
//! Keeps resources in memory and records every call. Faults and latency can
//! be injected per resource, which makes it the provider of choice for
//! exercising the reconciler without a network.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::ResourceAddress;
use crate::error::ProviderError;

use super::{Attributes, ProviderClient, ProviderResult, RemoteState};

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A read.
    Describe,
    /// A create.
    Create,
    /// An in-place update.
    Update,
    /// A delete.
    Delete,
}

impl Operation {
    /// Returns true for calls that change remote state.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::Describe)
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// Kind of call.
    pub operation: Operation,
    /// Address of the resource, when known.
    pub address: Option<ResourceAddress>,
    /// Logical clock value when the call started.
    pub started: usize,
    /// Logical clock value when the call finished.
    pub finished: usize,
    /// Whether the call returned an error.
    pub failed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Resources keyed by id.
    resources: BTreeMap<String, (ResourceAddress, RemoteState)>,
    /// Next id number per type.
    counters: HashMap<String, u64>,
    /// Addresses whose mutations always fail.
    fatal: HashMap<ResourceAddress, String>,
    /// Remaining transient failures per address.
    transient: HashMap<ResourceAddress, u32>,
    /// Call log.
    log: Vec<OpRecord>,
}

/// Provider keeping resources in memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    delay: Option<Duration>,
    clock: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every mutating call take `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the data consistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes every mutation of `address` fail fatally with `message`.
    pub fn fail_on(&self, address: &ResourceAddress, message: impl Into<String>) {
        self.lock().fatal.insert(address.clone(), message.into());
    }

    /// Makes the next `times` mutations of `address` fail transiently.
    pub fn fail_transiently(&self, address: &ResourceAddress, times: u32) {
        self.lock().transient.insert(address.clone(), times);
    }

    /// Creates a resource out of band, as if someone made it by hand.
    pub fn seed(&self, address: &ResourceAddress, attributes: Attributes) -> RemoteState {
        let mut inner = self.lock();
        Self::insert(&mut inner, address, attributes)
    }

    /// Changes an attribute out of band.
    pub fn set_attribute(&self, id: &str, key: &str, value: serde_json::Value) {
        if let Some((_, state)) = self.lock().resources.get_mut(id) {
            state.attributes.insert(key.to_string(), value);
        }
    }

    /// Deletes a resource out of band.
    pub fn remove(&self, id: &str) {
        self.lock().resources.remove(id);
    }

    /// Returns a resource by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<RemoteState> {
        self.lock().resources.get(id).map(|(_, s)| s.clone())
    }

    /// Returns the resource created for `address`, if any.
    #[must_use]
    pub fn find(&self, address: &ResourceAddress) -> Option<RemoteState> {
        self.lock()
            .resources
            .values()
            .find(|(a, _)| a == address)
            .map(|(_, s)| s.clone())
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns true if no resources exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().resources.is_empty()
    }

    /// Every recorded call, in completion order.
    #[must_use]
    pub fn operations(&self) -> Vec<OpRecord> {
        self.lock().log.clone()
    }

    /// Recorded calls that change remote state.
    #[must_use]
    pub fn mutations(&self) -> Vec<OpRecord> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.operation.is_mutation())
            .cloned()
            .collect()
    }

    /// Finds the successful mutation of `address`.
    #[must_use]
    pub fn mutation_of(&self, address: &ResourceAddress) -> Option<OpRecord> {
        self.lock()
            .log
            .iter()
            .find(|r| r.operation.is_mutation() && !r.failed && r.address.as_ref() == Some(address))
            .cloned()
    }

    /// Largest number of calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Clears the call log and the concurrency peak.
    pub fn reset_log(&self) {
        self.lock().log.clear();
        self.peak.store(0, Ordering::SeqCst);
    }

    fn insert(inner: &mut Inner, address: &ResourceAddress, mut attributes: Attributes) -> RemoteState {
        let counter = inner.counters.entry(address.resource_type.clone()).or_insert(0);
        *counter += 1;
        let id = format!("{}-{counter}", address.resource_type);

        attributes.insert(String::from("id"), serde_json::Value::String(id.clone()));
        attributes.insert(
            String::from("arn"),
            serde_json::Value::String(format!(
                "arn:stackwright:{}:::{}",
                address.resource_type, address.name
            )),
        );

        let state = RemoteState {
            id: id.clone(),
            resource_type: address.resource_type.clone(),
            attributes,
        };
        inner.resources.insert(id, (address.clone(), state.clone()));
        state
    }

    fn address_of(&self, id: &str) -> Option<ResourceAddress> {
        self.lock().resources.get(id).map(|(a, _)| a.clone())
    }

    fn begin(&self) -> usize {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn end(&self, operation: Operation, address: Option<ResourceAddress>, started: usize, failed: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let finished = self.clock.fetch_add(1, Ordering::SeqCst);
        self.lock().log.push(OpRecord {
            operation,
            address,
            started,
            finished,
            failed,
        });
    }

    /// Applies injected faults for a mutation of `address`.
    fn check_faults(&self, address: Option<&ResourceAddress>) -> ProviderResult<()> {
        let Some(address) = address else {
            return Ok(());
        };
        let mut inner = self.lock();
        if let Some(message) = inner.fatal.get(address) {
            return Err(ProviderError::fatal(message.clone()));
        }
        if let Some(remaining) = inner.transient.get_mut(address)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::transient(format!("{address} is throttled")));
        }
        Ok(())
    }

    async fn mutate<T>(
        &self,
        operation: Operation,
        address: Option<ResourceAddress>,
        f: impl FnOnce(&mut Inner) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let started = self.begin();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .check_faults(address.as_ref())
            .and_then(|()| {
                let mut inner = self.lock();
                f(&mut *inner)
            });

        self.end(operation, address, started, result.is_err());
        result
    }
}

#[async_trait]
impl ProviderClient for MemoryProvider {
    fn name(&self) -> String {
        String::from("memory")
    }

    async fn describe(&self, _resource_type: &str, id: &str) -> ProviderResult<Option<RemoteState>> {
        let started = self.begin();
        let found = self.lock().resources.get(id).cloned();
        let (address, state) = found.map_or((None, None), |(a, s)| (Some(a), Some(s)));
        self.end(Operation::Describe, address, started, false);
        Ok(state)
    }

    async fn create(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState> {
        debug!("memory: create {address}");
        self.mutate(Operation::Create, Some(address.clone()), |inner| {
            Ok(Self::insert(inner, address, attributes.clone()))
        })
        .await
    }

    async fn update(
        &self,
        _resource_type: &str,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState> {
        debug!("memory: update {id}");
        let address = self.address_of(id);
        self.mutate(Operation::Update, address, |inner| {
            let (_, state) = inner
                .resources
                .get_mut(id)
                .ok_or_else(|| ProviderError::fatal(format!("resource {id} does not exist")))?;
            for (key, value) in attributes {
                if value.is_null() {
                    state.attributes.remove(key);
                } else {
                    state.attributes.insert(key.clone(), value.clone());
                }
            }
            Ok(state.clone())
        })
        .await
    }

    async fn delete(&self, _resource_type: &str, id: &str) -> ProviderResult<()> {
        debug!("memory: delete {id}");
        let address = self.address_of(id);
        self.mutate(Operation::Delete, address, |inner| {
            inner.resources.remove(id);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().expect("address")
    }

    #[tokio::test]
    async fn test_create_assigns_computed_attributes() {
        let provider = MemoryProvider::new();
        let state = provider
            .create(&addr("aws_s3_bucket.logs"), &Attributes::from([(String::from("bucket"), json!("logs"))]))
            .await
            .expect("create");

        assert_eq!(state.id, "aws_s3_bucket-1");
        assert_eq!(state.attribute("arn"), Some(&json!("arn:stackwright:aws_s3_bucket:::logs")));
        assert_eq!(provider.find(&addr("aws_s3_bucket.logs")), Some(state));
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_removes() {
        let provider = MemoryProvider::new();
        let state = provider.seed(&addr("t.a"), Attributes::from([(String::from("x"), json!(1))]));

        let updated = provider
            .update("t", &state.id, &Attributes::from([(String::from("x"), json!(2))]))
            .await
            .expect("update");
        assert_eq!(updated.attribute("x"), Some(&json!(2)));
        assert!(updated.attribute("arn").is_some());

        let cleared = provider
            .update("t", &state.id, &Attributes::from([(String::from("x"), json!(null))]))
            .await
            .expect("clear");
        assert!(cleared.attribute("x").is_none());

        provider.delete("t", &state.id).await.expect("delete");
        assert!(provider.describe("t", &state.id).await.expect("describe").is_none());
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let provider = MemoryProvider::new();
        provider.fail_transiently(&addr("t.a"), 1);
        provider.fail_on(&addr("t.b"), "quota exceeded");

        let first = provider.create(&addr("t.a"), &Attributes::new()).await;
        assert!(first.expect_err("transient").is_retryable());
        provider.create(&addr("t.a"), &Attributes::new()).await.expect("second try");

        let err = provider.create(&addr("t.b"), &Attributes::new()).await.expect_err("fatal");
        assert!(err.to_string().contains("quota exceeded"));

        assert_eq!(provider.mutations().len(), 3);
        assert!(provider.mutation_of(&addr("t.a")).is_some());
        assert!(provider.mutation_of(&addr("t.b")).is_none());
    }
}
