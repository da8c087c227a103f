//! Plan executor.
//!
//! Changes run as tasks on a [`JoinSet`]; a change is only spawned once it
//! holds one of `max_concurrency` semaphore permits. A change starts once
//! every change listed in its `after` set has been applied. Creates, updates
//! and no-ops run first; destroys run afterwards in reverse dependency order.
//! A failed change skips everything downstream of it, destroys included,
//! while independent branches continue, unless `fail_fast` is set. The state
//! is saved after every completed change.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, DesiredState, ResourceAddress, VariableValues};
use crate::error::{PartialApplySummary, ProviderError, ReconcileError, Result, StackError};
use crate::provider::{Attributes, ProviderClient, RemoteState, RetryPolicy};
use crate::sensitive::Redactor;
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceRecord, StateStore,
};

use super::plan::{ChangeAction, Plan, PlanKind, PlannedChange};
use super::resolve::{AttributeResolver, RemoteCache, provider_payload, secret_keys};

/// Options controlling plan execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    /// Maximum number of provider calls in flight.
    pub max_concurrency: usize,
    /// Stop scheduling new changes after the first failure.
    pub fail_fast: bool,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            fail_fast: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle of one change during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Not started yet.
    Planned,
    /// Provider call in progress.
    Applying,
    /// Change applied (or nothing to do).
    Applied,
    /// Change failed.
    Failed,
    /// Never started.
    Skipped,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Result of executing a single change.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeResult {
    /// Resource address.
    pub address: ResourceAddress,
    /// Action that was planned.
    pub action: ChangeAction,
    /// Final status.
    pub status: ResourceStatus,
    /// Provider calls made, including retries.
    pub attempts: u32,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Provider identifier after the change.
    pub provider_id: Option<String>,
    /// Time spent in the provider.
    pub duration_ms: u64,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Per-change results, in plan order.
    pub results: Vec<ChangeResult>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl ExecutionResult {
    fn count(&self, status: ResourceStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Number of applied changes, no-ops included.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.count(ResourceStatus::Applied)
    }

    /// Number of failed changes.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(ResourceStatus::Failed)
    }

    /// Number of skipped changes.
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.count(ResourceStatus::Skipped)
    }

    /// Returns true if every change was applied.
    #[must_use]
    pub fn all_successful(&self) -> bool {
        self.results.iter().all(|r| r.status == ResourceStatus::Applied)
    }

    /// Looks up the result for `address`.
    #[must_use]
    pub fn result_for(&self, address: &ResourceAddress) -> Option<&ChangeResult> {
        self.results.iter().find(|r| &r.address == address)
    }

    /// Applied, failed and skipped resources.
    #[must_use]
    pub fn summary(&self) -> PartialApplySummary {
        let mut summary = PartialApplySummary::default();
        for result in &self.results {
            let address = result.address.to_string();
            match result.status {
                ResourceStatus::Applied => summary.applied.push(address),
                ResourceStatus::Failed => summary
                    .failed
                    .push((address, result.error.clone().unwrap_or_default())),
                ResourceStatus::Planned | ResourceStatus::Applying | ResourceStatus::Skipped => {
                    summary.skipped.push(address);
                }
            }
        }
        summary
    }

    /// One error per failed change.
    #[must_use]
    pub fn failures(&self) -> Vec<ReconcileError> {
        self.results
            .iter()
            .filter(|r| r.status == ResourceStatus::Failed)
            .map(|r| ReconcileError::ResourceFailed {
                address: r.address.to_string(),
                action: r.action.to_string(),
                reason: r.error.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Converts an incomplete run into [`ReconcileError::PartialApply`].
    ///
    /// # Errors
    ///
    /// Returns `PartialApply` if any change failed or was skipped.
    pub fn into_result(self) -> Result<Self> {
        if self.all_successful() {
            Ok(self)
        } else {
            Err(StackError::Reconcile(ReconcileError::PartialApply(
                self.summary(),
            )))
        }
    }
}

impl ChangeResult {
    fn planned(change: &PlannedChange) -> Self {
        Self {
            address: change.address.clone(),
            action: change.action,
            status: ResourceStatus::Planned,
            attempts: 0,
            error: None,
            provider_id: change.provider_id.clone(),
            duration_ms: 0,
        }
    }
}

/// What a task reports back to the scheduler.
enum TaskOutcome {
    /// The provider call succeeded. `None` for a delete.
    Done {
        remote: Option<RemoteState>,
        attempts: u32,
        elapsed: Duration,
    },
    /// The provider call failed.
    Failed {
        error: ProviderError,
        attempts: u32,
        elapsed: Duration,
    },
}

/// The provider call a task makes.
enum TaskCall {
    Create(Attributes),
    Update(String, Attributes),
    Delete(String),
}

/// A call ready to run, with fingerprints of the secrets it sends.
struct Prepared {
    call: TaskCall,
    fingerprints: BTreeMap<String, String>,
}

/// Executor for plans.
pub struct PlanExecutor<'a> {
    provider: Arc<dyn ProviderClient>,
    store: &'a dyn StateStore,
    desired: &'a DesiredState,
    values: &'a VariableValues,
    options: ExecutionOptions,
    cancel: CancellationToken,
    redactor: Redactor,
    hasher: ConfigHasher,
}

impl std::fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.location())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Dependency bookkeeping across every change of a plan.
struct Schedule {
    /// Unfinished prerequisites per plan index.
    waiting: HashMap<usize, usize>,
    /// Plan indices waiting on each plan index.
    dependents: HashMap<usize, Vec<usize>>,
    /// Plan indices of the phase being run.
    phase: BTreeSet<usize>,
}

impl Schedule {
    fn new(plan: &Plan) -> Self {
        let position: HashMap<&ResourceAddress, usize> = plan
            .changes
            .iter()
            .enumerate()
            .map(|(i, change)| (&change.address, i))
            .collect();

        let mut waiting = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, change) in plan.changes.iter().enumerate() {
            let prerequisites: BTreeSet<usize> = change
                .after
                .iter()
                .filter_map(|a| position.get(a).copied())
                .collect();
            waiting.insert(i, prerequisites.len());
            for p in prerequisites {
                dependents.entry(p).or_default().push(i);
            }
        }

        Self {
            waiting,
            dependents,
            phase: BTreeSet::new(),
        }
    }

    /// Everything downstream of `index`, in any phase.
    fn downstream(&self, index: usize) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &next in self.dependents.get(&current).into_iter().flatten() {
                if found.insert(next) {
                    stack.push(next);
                }
            }
        }
        found
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        store: &'a dyn StateStore,
        desired: &'a DesiredState,
        values: &'a VariableValues,
    ) -> Self {
        Self {
            provider,
            store,
            desired,
            values,
            options: ExecutionOptions::default(),
            cancel: CancellationToken::new(),
            redactor: values.redactor(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the execution options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `cancel` to stop scheduling new changes.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes `plan`, recording every outcome in `state`.
    ///
    /// Failed and skipped changes are reported in the result, not as an
    /// error; see [`ExecutionResult::into_result`].
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be saved or a task panics.
    pub async fn execute(&self, plan: &Plan, state: &mut DeploymentState) -> Result<ExecutionResult> {
        info!(
            "Executing plan for {}/{}: {}",
            plan.project,
            plan.environment,
            plan.summary()
        );

        let mut cache = plan.observed.clone();
        if !plan.forgotten.is_empty() {
            for address in &plan.forgotten {
                info!(address = %address, "Dropping record of resource that no longer exists");
                state.remove_resource(address);
                cache.remove(address);
            }
            self.persist(state).await?;
        }

        let mut results: Vec<ChangeResult> = plan.changes.iter().map(ChangeResult::planned).collect();
        let halt = self.cancel.child_token();

        let (apply, destroy): (BTreeSet<usize>, BTreeSet<usize>) = (0..plan.changes.len())
            .partition(|&i| plan.changes[i].action != ChangeAction::Destroy);
        let mut schedule = Schedule::new(plan);

        for phase in [apply, destroy] {
            if phase.is_empty() {
                continue;
            }
            schedule.phase = phase;
            self.run_phase(plan, &mut schedule, &mut results, &mut cache, state, &halt)
                .await?;
        }

        let result = ExecutionResult {
            results,
            cancelled: self.cancel.is_cancelled(),
        };
        self.record_history(plan, &result, state);
        self.persist(state).await?;

        info!(
            "Plan executed: {} applied, {} failed, {} skipped",
            result.applied_count(),
            result.failed_count(),
            result.skipped_count()
        );
        Ok(result)
    }

    /// Runs the changes of the current phase. Prerequisites finished in an
    /// earlier phase stay counted as finished in `schedule`.
    async fn run_phase(
        &self,
        plan: &Plan,
        schedule: &mut Schedule,
        results: &mut [ChangeResult],
        cache: &mut RemoteCache,
        state: &mut DeploymentState,
        halt: &CancellationToken,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut ready: BinaryHeap<Reverse<usize>> = schedule
            .phase
            .iter()
            .filter(|&&i| {
                schedule.waiting.get(&i) == Some(&0) && results[i].status == ResourceStatus::Planned
            })
            .map(|&i| Reverse(i))
            .collect();
        let mut tasks: JoinSet<(usize, TaskOutcome, OwnedSemaphorePermit)> = JoinSet::new();
        let mut fingerprints: HashMap<usize, BTreeMap<String, String>> = HashMap::new();
        let mut save_error = None;

        loop {
            while !halt.is_cancelled() {
                let Some(Reverse(index)) = ready.pop() else {
                    break;
                };
                let change = &plan.changes[index];

                let prepared = match self.prepare(change, cache) {
                    Ok(Some(prepared)) => prepared,
                    Ok(None) => {
                        debug!(address = %change.address, "No changes");
                        self.record_noop(change, state);
                        results[index].status = ResourceStatus::Applied;
                        self.release(schedule, index, results, &mut ready);
                        continue;
                    }
                    Err(reason) => {
                        let reason = self.redactor.scrub(&reason);
                        error!(address = %change.address, "Cannot {}: {reason}", change.action);
                        self.fail(schedule, index, reason, results, halt);
                        continue;
                    }
                };

                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    ready.push(Reverse(index));
                    break;
                };

                info!(address = %change.address, "{} started", change.action);
                results[index].status = ResourceStatus::Applying;
                fingerprints.insert(index, prepared.fingerprints);
                tasks.spawn(run_task(
                    index,
                    change.address.clone(),
                    prepared.call,
                    Arc::clone(&self.provider),
                    self.options.retry,
                    permit,
                ));
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (index, outcome, permit) =
                joined.map_err(|e| StackError::internal(format!("Apply task failed: {e}")))?;
            let change = &plan.changes[index];

            match outcome {
                TaskOutcome::Done {
                    remote,
                    attempts,
                    elapsed,
                } => {
                    let result = &mut results[index];
                    result.status = ResourceStatus::Applied;
                    result.attempts = attempts;
                    result.duration_ms = duration_ms(elapsed);
                    match remote {
                        Some(remote) => {
                            info!(address = %change.address, id = %remote.id, "{} complete", change.action);
                            result.provider_id = Some(remote.id.clone());
                            let secrets = fingerprints.remove(&index).unwrap_or_default();
                            self.record_applied(change, &remote, secrets, state);
                            cache.insert(change.address.clone(), remote);
                        }
                        None => {
                            info!(address = %change.address, "destroy complete");
                            result.provider_id = None;
                            state.remove_resource(&change.address);
                            cache.remove(&change.address);
                        }
                    }
                    if let Err(e) = self.persist(state).await {
                        error!("Failed to save state: {e}");
                        halt.cancel();
                        if save_error.is_none() {
                            save_error = Some(e);
                        }
                    }
                    self.release(schedule, index, results, &mut ready);
                }
                TaskOutcome::Failed {
                    error,
                    attempts,
                    elapsed,
                } => {
                    let reason = self.redactor.scrub(&error.to_string());
                    error!(address = %change.address, "{} failed: {reason}", change.action);
                    results[index].attempts = attempts;
                    results[index].duration_ms = duration_ms(elapsed);
                    self.fail(schedule, index, reason, results, halt);
                }
            }
            drop(permit);
        }

        let reason = if self.cancel.is_cancelled() {
            "cancelled"
        } else {
            "not started after an earlier failure"
        };
        for &index in &schedule.phase {
            if results[index].status == ResourceStatus::Planned {
                warn!(address = %plan.changes[index].address, "Skipped: {reason}");
                results[index].status = ResourceStatus::Skipped;
                results[index].error = Some(reason.to_string());
            }
        }

        save_error.map_or(Ok(()), Err)
    }

    /// Works out the provider call for `change`, or `None` for a no-op.
    fn prepare(
        &self,
        change: &PlannedChange,
        cache: &RemoteCache,
    ) -> std::result::Result<Option<Prepared>, String> {
        let existing_id = || {
            change
                .provider_id
                .clone()
                .ok_or_else(|| format!("{} has no provider id", change.address))
        };

        match change.action {
            ChangeAction::NoOp => Ok(None),
            ChangeAction::Destroy => existing_id().map(|id| {
                Some(Prepared {
                    call: TaskCall::Delete(id),
                    fingerprints: BTreeMap::new(),
                })
            }),
            ChangeAction::Create | ChangeAction::Update => {
                let declaration = self
                    .desired
                    .resource(&change.address)
                    .ok_or_else(|| format!("{} is not declared", change.address))?;
                let pending = BTreeSet::new();
                let resolver = AttributeResolver::new(self.desired, self.values, cache, &pending);
                let resolved = resolver.resolve(declaration).map_err(|e| e.to_string())?;
                let mut payload = provider_payload(&resolved)
                    .map_err(|key| format!("attribute '{key}' is still unknown"))?;
                // Attributes dropped from the configuration are cleared.
                for removed in &change.changes {
                    if !resolved.contains_key(&removed.attribute) {
                        payload.insert(removed.attribute.clone(), Value::Null);
                    }
                }
                let fingerprints = secret_keys(&resolved)
                    .into_iter()
                    .filter_map(|key| {
                        payload
                            .get(key)
                            .map(|value| (key.to_string(), self.hasher.fingerprint(value)))
                    })
                    .collect();

                let call = if change.action == ChangeAction::Create {
                    TaskCall::Create(payload)
                } else {
                    TaskCall::Update(existing_id()?, payload)
                };
                Ok(Some(Prepared { call, fingerprints }))
            }
        }
    }

    /// Marks `index` applied and queues dependents of this phase that
    /// became ready. Dependents in a later phase wait for that phase.
    fn release(
        &self,
        schedule: &mut Schedule,
        index: usize,
        results: &[ChangeResult],
        ready: &mut BinaryHeap<Reverse<usize>>,
    ) {
        let Schedule {
            waiting,
            dependents,
            phase,
        } = schedule;
        for &next in dependents.get(&index).into_iter().flatten() {
            if let Some(count) = waiting.get_mut(&next) {
                *count = count.saturating_sub(1);
                if *count == 0
                    && phase.contains(&next)
                    && results[next].status == ResourceStatus::Planned
                {
                    ready.push(Reverse(next));
                }
            }
        }
    }

    /// Marks `index` failed and everything downstream skipped.
    fn fail(
        &self,
        schedule: &Schedule,
        index: usize,
        reason: String,
        results: &mut [ChangeResult],
        halt: &CancellationToken,
    ) {
        let failed = results[index].address.clone();
        results[index].status = ResourceStatus::Failed;
        results[index].error = Some(reason);

        for next in schedule.downstream(index) {
            if results[next].status == ResourceStatus::Planned {
                warn!(address = %results[next].address, "Skipped: depends on failed {failed}");
                results[next].status = ResourceStatus::Skipped;
                results[next].error = Some(format!("depends on failed {failed}"));
            }
        }

        if self.options.fail_fast {
            warn!("Stopping after failure of {failed}");
            halt.cancel();
        }
    }

    fn record_applied(
        &self,
        change: &PlannedChange,
        remote: &RemoteState,
        fingerprints: BTreeMap<String, String>,
        state: &mut DeploymentState,
    ) {
        let declaration = self.desired.resource(&change.address);
        let dependencies = declaration.map(|d| d.dependencies()).unwrap_or_default();
        let declared = declaration.map(|d| d.attribute_names()).unwrap_or_default();

        let mut record = state
            .get_resource(&change.address)
            .cloned()
            .unwrap_or_else(|| ResourceRecord::new(change.address.clone(), &remote.id));
        record.provider_id.clone_from(&remote.id);
        record.dependencies = dependencies;
        record.declared = declared;
        record.updated_at = Utc::now();
        // Secret attributes keep only a fingerprint.
        record.attributes = remote
            .attributes
            .iter()
            .filter(|(key, _)| !fingerprints.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        record.sensitive = fingerprints;
        state.set_resource(record);
    }

    fn record_noop(&self, change: &PlannedChange, state: &mut DeploymentState) {
        let Some(declaration) = self.desired.resource(&change.address) else {
            return;
        };
        let dependencies = declaration.dependencies();
        let declared = declaration.attribute_names();
        if let Some(record) = state.get_resource(&change.address)
            && (record.dependencies != dependencies || record.declared != declared)
        {
            let mut record = record.clone();
            record.dependencies = dependencies;
            record.declared = declared;
            state.set_resource(record);
        }
    }

    fn record_history(&self, plan: &Plan, result: &ExecutionResult, state: &mut DeploymentState) {
        let operation = match plan.kind {
            PlanKind::Apply => DeploymentOperation::Apply,
            PlanKind::Destroy => DeploymentOperation::Destroy,
        };
        let changed: Vec<String> = result
            .results
            .iter()
            .filter(|r| r.action.is_change() && r.status == ResourceStatus::Applied)
            .map(|r| r.address.to_string())
            .collect();

        let entry = if result.all_successful() {
            DeploymentHistoryEntry::new(operation, &plan.config_hash, changed)
        } else {
            DeploymentHistoryEntry::failed(
                operation,
                &plan.config_hash,
                changed,
                &result.summary().to_string(),
            )
        };
        state.add_history(entry);

        if plan.kind == PlanKind::Apply && result.all_successful() {
            state.config_hash.clone_from(&plan.config_hash);
        }
    }

    async fn persist(&self, state: &mut DeploymentState) -> Result<()> {
        state.touch();
        self.store.save(state).await
    }
}

/// Runs one provider call. The permit goes back to the scheduler with the
/// outcome, so a slot frees up only once the outcome has been recorded.
async fn run_task(
    index: usize,
    address: ResourceAddress,
    call: TaskCall,
    provider: Arc<dyn ProviderClient>,
    policy: RetryPolicy,
    permit: OwnedSemaphorePermit,
) -> (usize, TaskOutcome, OwnedSemaphorePermit) {
    let attempts = AtomicU32::new(0);
    let started = Instant::now();
    let provider = provider.as_ref();
    let result = match &call {
        TaskCall::Create(attributes) => policy
            .run(&format!("create {address}"), || {
                attempts.fetch_add(1, Ordering::Relaxed);
                provider.create(&address, attributes)
            })
            .await
            .map(Some),
        TaskCall::Update(id, attributes) => policy
            .run(&format!("update {address}"), || {
                attempts.fetch_add(1, Ordering::Relaxed);
                provider.update(&address.resource_type, id, attributes)
            })
            .await
            .map(Some),
        TaskCall::Delete(id) => policy
            .run(&format!("delete {address}"), || {
                attempts.fetch_add(1, Ordering::Relaxed);
                provider.delete(&address.resource_type, id)
            })
            .await
            .map(|()| None),
    };

    let attempts = attempts.into_inner();
    let elapsed = started.elapsed();
    let outcome = match result {
        Ok(remote) => TaskOutcome::Done {
            remote,
            attempts,
            elapsed,
        },
        Err(error) => TaskOutcome::Failed {
            error,
            attempts,
            elapsed,
        },
    };
    (index, outcome, permit)
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, VariableValue};
    use crate::graph::DependencyGraph;
    use crate::planner::DiffEngine;
    use crate::provider::MemoryProvider;
    use crate::sensitive::Sensitive;
    use crate::state::LocalStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    const DOC: &str = r"
project:
  name: demo
provider:
  endpoint: http://localhost:9000
variables:
  - name: api_key
    sensitive: true
resources:
  - type: aws_s3_bucket
    name: a
    attributes:
      acl: private
  - type: aws_s3_bucket
    name: b
    attributes:
      acl: private
  - type: aws_iam_role
    name: reader
    attributes:
      bucket: { ref: aws_s3_bucket.a.arn }
      key: { var: api_key }
";

    struct Harness {
        desired: DesiredState,
        graph: DependencyGraph,
        values: VariableValues,
        provider: Arc<MemoryProvider>,
        store: LocalStateStore,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let doc = ConfigParser::new().parse_yaml(DOC, None).expect("parse");
            let graph = DependencyGraph::build(&doc.desired).expect("graph");
            let mut values = VariableValues::default();
            values.insert(
                "api_key",
                VariableValue::Secret(Sensitive::new(json!("sk-live-123"))),
            );
            let dir = TempDir::new().expect("temp dir");
            let store = LocalStateStore::with_base_dir(dir.path());
            Self {
                desired: doc.desired,
                graph,
                values,
                provider: Arc::new(MemoryProvider::new()),
                store,
                _dir: dir,
            }
        }

        fn plan(&self, state: &DeploymentState, observed: RemoteCache) -> Plan {
            DiffEngine::new()
                .plan(&self.desired, &self.graph, &self.values, state, observed, "hash")
                .expect("plan")
        }

        fn executor(&self, options: ExecutionOptions) -> PlanExecutor<'_> {
            let provider: Arc<dyn ProviderClient> = self.provider.clone();
            PlanExecutor::new(provider, &self.store, &self.desired, &self.values)
                .with_options(options)
        }
    }

    fn addr(s: &str) -> ResourceAddress {
        s.parse().expect("address")
    }

    fn options(max_concurrency: usize, fail_fast: bool) -> ExecutionOptions {
        ExecutionOptions {
            max_concurrency,
            fail_fast,
            retry: RetryPolicy::none(),
        }
    }

    #[tokio::test]
    async fn test_apply_records_state_and_history() {
        let h = Harness::new();
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());

        let result = h
            .executor(options(2, false))
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        assert!(result.all_successful());
        assert_eq!(result.applied_count(), 3);
        assert_eq!(h.provider.len(), 3);

        let role = state.get_resource(&addr("aws_iam_role.reader")).expect("role");
        assert_eq!(role.dependencies, vec![addr("aws_s3_bucket.a")]);
        assert_eq!(role.attributes["bucket"], json!("arn:stackwright:aws_s3_bucket:::a"));
        assert!(role.sensitive.contains_key("key"));
        assert!(!role.attributes.contains_key("key"));

        assert_eq!(state.config_hash, "hash");
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);

        let saved = std::fs::read_to_string(h.store.state_path()).expect("state file");
        assert!(!saved.contains("sk-live-123"));
    }

    #[tokio::test]
    async fn test_dependency_applied_before_dependent() {
        let h = Harness::new();
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());
        h.executor(options(4, false))
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        let bucket = h.provider.mutation_of(&addr("aws_s3_bucket.a")).expect("bucket");
        let role = h.provider.mutation_of(&addr("aws_iam_role.reader")).expect("role");
        assert!(bucket.finished < role.started);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let h = Harness::new();
        h.provider.fail_on(&addr("aws_s3_bucket.a"), "bucket name taken");
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());

        let result = h
            .executor(options(1, false))
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        let status = |a: &str| result.result_for(&addr(a)).map(|r| r.status);
        assert_eq!(status("aws_s3_bucket.a"), Some(ResourceStatus::Failed));
        assert_eq!(status("aws_s3_bucket.b"), Some(ResourceStatus::Applied));
        assert_eq!(status("aws_iam_role.reader"), Some(ResourceStatus::Skipped));
        assert_eq!(result.failures().len(), 1);
        assert!(!state.history[0].success);
        assert_eq!(state.config_hash, "");

        let err = result.into_result().expect_err("partial");
        assert!(matches!(
            err,
            StackError::Reconcile(ReconcileError::PartialApply(ref s))
                if s.applied == vec![String::from("aws_s3_bucket.b")]
        ));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_scheduling() {
        let h = Harness::new();
        h.provider.fail_on(&addr("aws_s3_bucket.a"), "quota exceeded");
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());

        let result = h
            .executor(options(1, true))
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        let b = result.result_for(&addr("aws_s3_bucket.b")).expect("b");
        assert_eq!(b.status, ResourceStatus::Skipped);
        assert_eq!(b.error.as_deref(), Some("not started after an earlier failure"));
        assert!(h.provider.mutation_of(&addr("aws_s3_bucket.b")).is_none());
    }

    #[tokio::test]
    async fn test_noop_makes_no_provider_call() {
        let h = Harness::new();
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());
        let result = h
            .executor(options(4, false))
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        let mut observed = RemoteCache::new();
        for r in &result.results {
            let id = r.provider_id.as_deref().expect("id");
            observed.insert(r.address.clone(), h.provider.get(id).expect("remote"));
        }
        let replan = h.plan(&state, observed);
        assert!(replan.is_empty(), "{replan}");

        h.provider.reset_log();
        let again = h
            .executor(options(4, false))
            .execute(&replan, &mut state)
            .await
            .expect("execute");
        assert!(again.all_successful());
        assert!(h.provider.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_count_attempts() {
        let h = Harness::new();
        h.provider.fail_transiently(&addr("aws_s3_bucket.b"), 2);
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());

        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        };
        let result = h
            .executor(ExecutionOptions {
                max_concurrency: 2,
                fail_fast: false,
                retry,
            })
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        let b = result.result_for(&addr("aws_s3_bucket.b")).expect("b");
        assert_eq!(b.status, ResourceStatus::Applied);
        assert_eq!(b.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let h = Harness::new();
        let mut state = DeploymentState::new("demo", "dev");
        let plan = h.plan(&state, RemoteCache::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .executor(options(4, false))
            .with_cancellation(cancel)
            .execute(&plan, &mut state)
            .await
            .expect("execute");

        assert!(result.cancelled);
        assert_eq!(result.skipped_count(), 3);
        assert!(h.provider.is_empty());
        assert!(
            result
                .results
                .iter()
                .all(|r| r.error.as_deref() == Some("cancelled"))
        );
    }
}
