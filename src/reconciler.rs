//! Reconciler for converging managed resources on the configuration.
//!
//! The reconciler owns one loaded document and drives a run: load the
//! state, refresh every recorded resource from the provider, compute a
//! plan, then apply it under the state lock.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ResourceAddress, StackDocument, VariableValues};
use crate::error::{ReconcileError, Result, StackError, StateError};
use crate::graph::DependencyGraph;
use crate::planner::{
    ChangeAction, DiffEngine, ExecutionOptions, ExecutionResult, Plan, PlanExecutor, PlanKind,
    PlannedChange, RemoteCache,
};
use crate::provider::{ProviderClient, RetryPolicy, RetryingProvider};
use crate::sensitive::Redactor;
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceRecord, StateStore,
    generate_holder_id,
};

/// Reconciler for one project environment.
pub struct Reconciler {
    /// Loaded configuration.
    document: StackDocument,
    /// Resolved variable values.
    values: VariableValues,
    /// Dependency graph of the declared resources.
    graph: DependencyGraph,
    /// Provider client.
    provider: Arc<dyn ProviderClient>,
    /// State store.
    store: Box<dyn StateStore>,
    /// Execution options.
    options: ExecutionOptions,
    /// Cancellation of running applies.
    cancel: CancellationToken,
    /// Lock holder identity.
    holder: String,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Scrubs secrets out of provider messages.
    redactor: Redactor,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.document.config.qualified_name())
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler, building the dependency graph.
    ///
    /// Execution options default to the document's settings.
    ///
    /// # Errors
    ///
    /// Returns a graph error for unresolved references or cycles.
    pub fn new(
        document: StackDocument,
        values: VariableValues,
        provider: Arc<dyn ProviderClient>,
        store: Box<dyn StateStore>,
    ) -> Result<Self> {
        let graph = DependencyGraph::build(&document.desired)?;
        let settings = &document.config.settings;
        let options = ExecutionOptions {
            max_concurrency: settings.max_concurrency,
            fail_fast: settings.fail_fast,
            retry: RetryPolicy::from(&settings.retry),
        };
        let redactor = values.redactor();

        Ok(Self {
            document,
            values,
            graph,
            provider,
            store,
            options,
            cancel: CancellationToken::new(),
            holder: generate_holder_id(),
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            redactor,
        })
    }

    /// Overrides the execution options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `cancel` to interrupt applies.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The loaded document.
    #[must_use]
    pub const fn document(&self) -> &StackDocument {
        &self.document
    }

    /// The dependency graph of the declared resources.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// The execution options in effect.
    #[must_use]
    pub const fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Hash of the loaded document.
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.hasher.hash_document(&self.document)
    }

    /// Loads the stored state, or an empty one on the first run.
    ///
    /// # Errors
    ///
    /// Returns `ProjectMismatch` if the stored state belongs to another
    /// project or environment, or any storage error.
    pub async fn load_state(&self) -> Result<DeploymentState> {
        let project = &self.document.config.project;
        match self.store.load().await? {
            Some(state) => {
                if state.project != project.name || state.environment != project.environment {
                    return Err(StackError::State(StateError::ProjectMismatch {
                        expected: self.document.config.qualified_name(),
                        found: state.qualified_name(),
                    }));
                }
                Ok(state)
            }
            None => {
                debug!("No state yet for {}", self.document.config.qualified_name());
                Ok(DeploymentState::new(&project.name, &project.environment))
            }
        }
    }

    /// Reads the current remote state of every recorded resource.
    ///
    /// Resources the provider no longer knows are left out.
    ///
    /// # Errors
    ///
    /// Returns the provider error if a read fails after retries.
    pub async fn refresh(&self, state: &DeploymentState) -> Result<RemoteCache> {
        let reader = RetryingProvider::new(Arc::clone(&self.provider), self.options.retry);
        let mut cache = RemoteCache::new();

        for record in state.resources.values() {
            let address = &record.address;
            let observed = reader
                .describe(&address.resource_type, &record.provider_id)
                .await
                .map_err(|e| StackError::Provider(e.map_message(|m| self.redactor.scrub(m))))?;
            match observed {
                Some(remote) => {
                    cache.insert(address.clone(), remote);
                }
                None => {
                    warn!(address = %address, id = %record.provider_id, "Resource no longer exists");
                }
            }
        }

        debug!("Refreshed {} of {} resources", cache.len(), state.resources.len());
        Ok(cache)
    }

    /// Computes the plan converging remote state on the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded, a refresh fails, or
    /// an attribute cannot be resolved.
    pub async fn plan(&self) -> Result<Plan> {
        info!("Planning {}", self.document.config.qualified_name());
        let state = self.load_state().await?;
        let observed = self.refresh(&state).await?;
        let plan = self.diff_engine.plan(
            &self.document.desired,
            &self.graph,
            &self.values,
            &state,
            observed,
            &self.config_hash(),
        )?;
        info!("{}", plan.summary());
        Ok(plan)
    }

    /// Computes a plan destroying every managed resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or a refresh fails.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        info!("Planning destroy of {}", self.document.config.qualified_name());
        let state = self.load_state().await?;
        let observed = self.refresh(&state).await?;
        self.diff_engine
            .plan_destroy(&state, observed, &self.config_hash())
    }

    /// Executes `plan` under the state lock and reports every outcome.
    ///
    /// Failed and skipped changes do not make this an error; use
    /// [`Reconciler::apply`] for that.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the state changed since
    /// the plan was computed, or the state cannot be saved.
    pub async fn execute(&self, plan: &Plan) -> Result<ExecutionResult> {
        if plan.project != self.document.config.project.name
            || plan.environment != self.document.config.project.environment
        {
            return Err(StackError::Reconcile(ReconcileError::Aborted {
                reason: format!(
                    "plan is for {}/{}, not {}",
                    plan.project,
                    plan.environment,
                    self.document.config.qualified_name()
                ),
            }));
        }

        let operation = match plan.kind {
            PlanKind::Apply => DeploymentOperation::Apply,
            PlanKind::Destroy => DeploymentOperation::Destroy,
        };
        let lock = self
            .store
            .acquire_lock(&self.holder, &operation.to_string())
            .await?;

        let outcome = self.execute_locked(plan).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn execute_locked(&self, plan: &Plan) -> Result<ExecutionResult> {
        let mut state = self.load_state().await?;
        if state.serial != plan.state_serial {
            return Err(StackError::Reconcile(ReconcileError::Aborted {
                reason: format!(
                    "state changed since the plan was made (serial {} now {}); plan again",
                    plan.state_serial, state.serial
                ),
            }));
        }

        PlanExecutor::new(
            Arc::clone(&self.provider),
            self.store.as_ref(),
            &self.document.desired,
            &self.values,
        )
        .with_options(self.options)
        .with_cancellation(self.cancel.clone())
        .execute(plan, &mut state)
        .await
    }

    /// Applies `plan`.
    ///
    /// # Errors
    ///
    /// Returns `PartialApply` with the applied, failed and skipped lists if
    /// any change did not apply, after the state has been saved. Returns the
    /// errors of [`Reconciler::execute`] otherwise.
    pub async fn apply(&self, plan: &Plan) -> Result<ExecutionResult> {
        self.execute(plan).await?.into_result()
    }

    /// Plans and applies in one go.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::plan`] and [`Reconciler::apply`].
    pub async fn reconcile(&self) -> Result<ExecutionResult> {
        let plan = self.plan().await?;
        if plan.is_empty() {
            info!("No changes required - infrastructure is converged");
        }
        self.apply(&plan).await
    }

    /// Destroys every managed resource, dependents first.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::plan_destroy`] and [`Reconciler::apply`].
    pub async fn destroy_all(&self) -> Result<ExecutionResult> {
        let plan = self.plan_destroy().await?;
        self.apply(&plan).await
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.document.config.qualified_name());
        let plan = self.plan().await?;
        Ok(DriftReport::from_plan(&plan))
    }

    /// Removes a resource from the state without touching the resource.
    ///
    /// # Errors
    ///
    /// Returns `NotManaged` if the address is not in the state, or a lock
    /// or storage error.
    pub async fn remove_from_state(&self, address: &ResourceAddress) -> Result<ResourceRecord> {
        let operation = DeploymentOperation::StateRemove.to_string();
        let lock = self.store.acquire_lock(&self.holder, &operation).await?;

        let outcome = self.remove_locked(address).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn remove_locked(&self, address: &ResourceAddress) -> Result<ResourceRecord> {
        let mut state = self.load_state().await?;
        let record = state.remove_resource(address).ok_or_else(|| {
            StackError::State(StateError::NotManaged {
                address: address.to_string(),
            })
        })?;
        let entry = DeploymentHistoryEntry::new(
            DeploymentOperation::StateRemove,
            &state.config_hash,
            vec![address.to_string()],
        );
        state.add_history(entry);
        state.touch();
        self.store.save(&state).await?;
        info!(address = %address, "Removed from state");
        Ok(record)
    }
}

/// Report of drift detection.
#[derive(Debug, serde::Serialize)]
pub struct DriftReport {
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// Resources whose remote state differs from the configuration.
    pub drifted: Vec<PlannedChange>,
    /// Recorded resources that no longer exist remotely.
    pub missing: Vec<ResourceAddress>,
    /// Number of resources in sync.
    pub in_sync: usize,
}

impl DriftReport {
    /// Builds a report from a freshly computed plan.
    #[must_use]
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            checked_at: plan.created_at,
            drifted: plan
                .changes
                .iter()
                .filter(|c| c.action.is_change())
                .cloned()
                .collect(),
            missing: plan.forgotten.clone(),
            in_sync: plan.count(ChangeAction::NoOp),
        }
    }

    /// Returns true if anything differs.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.missing.is_empty()
    }

    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - {} resources in sync", self.in_sync);
        }
        writeln!(f, "Drift detected:")?;
        for change in &self.drifted {
            writeln!(f, "  {change}")?;
        }
        for address in &self.missing {
            writeln!(f, "  {address} no longer exists")?;
        }
        write!(f, "{} resources in sync", self.in_sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::planner::PlannedChange;
    use crate::provider::MemoryProvider;
    use crate::state::LocalStateStore;

    fn reconciler(dir: &std::path::Path) -> Reconciler {
        let document = ConfigParser::new()
            .parse_yaml("project:\n  name: shop\n  environment: prod\n", None)
            .expect("parse");
        Reconciler::new(
            document,
            VariableValues::default(),
            Arc::new(MemoryProvider::new()),
            Box::new(LocalStateStore::with_base_dir(dir)),
        )
        .expect("reconciler")
    }

    #[tokio::test]
    async fn test_state_of_other_project_is_rejected() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = LocalStateStore::with_base_dir(dir.path());
        store
            .save(&DeploymentState::new("shop", "dev"))
            .await
            .expect("save");

        let err = reconciler(dir.path()).load_state().await.expect_err("mismatch");
        assert!(matches!(
            err,
            StackError::State(StateError::ProjectMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_run_starts_from_empty_state() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let state = reconciler(dir.path()).load_state().await.expect("load");
        assert_eq!(state.qualified_name(), "shop/prod");
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_drift_report_lists_changes() {
        let mut plan = Plan::new(PlanKind::Apply, "shop", "prod", "h", 3);
        plan.changes.push(PlannedChange {
            address: ResourceAddress::new("bucket", "assets"),
            action: ChangeAction::Update,
            rank: 1,
            provider_id: Some(String::from("bucket-1")),
            reason: String::from("changed: acl"),
            changes: Vec::new(),
            after: Vec::new(),
        });
        plan.forgotten.push(ResourceAddress::new("role", "reader"));

        let report = DriftReport::from_plan(&plan);
        assert!(report.has_drift());
        let text = report.to_string();
        assert!(text.contains("bucket.assets"));
        assert!(text.contains("role.reader no longer exists"));

        let converged = DriftReport::from_plan(&Plan::new(PlanKind::Apply, "shop", "prod", "h", 3));
        assert!(converged.is_converged());
    }
}
