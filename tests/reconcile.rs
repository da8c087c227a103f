//! End-to-end reconciliation against the in-memory provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stackwright::config::{ConfigParser, EnvSource, ResourceAddress, VariableResolver};
use stackwright::error::{GraphError, ReconcileError, StackError};
use stackwright::planner::{ChangeAction, ExecutionOptions, ResourceStatus};
use stackwright::provider::{MemoryProvider, ProviderClient, RetryPolicy};
use stackwright::reconciler::Reconciler;
use stackwright::state::{DeploymentState, LocalStateStore};

fn addr(s: &str) -> ResourceAddress {
    s.parse().expect("address")
}

struct Fixture {
    dir: TempDir,
    provider: Arc<MemoryProvider>,
    env: BTreeMap<String, String>,
    options: ExecutionOptions,
}

impl Fixture {
    fn new() -> Self {
        Self::with_provider(MemoryProvider::new())
    }

    fn with_provider(provider: MemoryProvider) -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            provider: Arc::new(provider),
            env: BTreeMap::new(),
            options: ExecutionOptions {
                max_concurrency: 4,
                fail_fast: false,
                retry: RetryPolicy::none(),
            },
        }
    }

    fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn reconciler(&self, yaml: &str) -> Reconciler {
        self.try_reconciler(yaml).expect("reconciler")
    }

    fn try_reconciler(&self, yaml: &str) -> stackwright::Result<Reconciler> {
        let document = ConfigParser::new().parse_yaml(yaml, None)?;
        let values = VariableResolver::new()
            .with_env(EnvSource::Fixed(self.env.clone()))
            .resolve(&document.desired)?;
        let provider: Arc<dyn ProviderClient> = self.provider.clone();
        let store = Box::new(LocalStateStore::with_base_dir(self.dir.path()));
        Ok(Reconciler::new(document, values, provider, store)?.with_options(self.options))
    }

    fn state_text(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("state.json")).expect("state file")
    }

    fn state(&self) -> DeploymentState {
        DeploymentState::from_json(&self.state_text()).expect("state")
    }
}

const BUCKET_AND_ROLE: &str = r"
project:
  name: web
resources:
  - type: role
    name: reader
    attributes:
      policy_target: { ref: bucket.assets.arn }
  - type: bucket
    name: assets
    attributes:
      acl: private
";

const CHAIN_OF_FIVE: &str = r"
project:
  name: chain
resources:
  - type: step
    name: one
    attributes: { n: 1 }
  - type: step
    name: two
    attributes: { prev: { ref: step.one.id } }
  - type: step
    name: three
    attributes: { prev: { ref: step.two.id } }
  - type: step
    name: four
    attributes: { prev: { ref: step.three.id } }
  - type: step
    name: five
    attributes: { prev: { ref: step.four.id } }
";

const THIRD_OF_FIVE: &str = r"
project:
  name: fan
resources:
  - type: step
    name: one
    attributes: { n: 1 }
  - type: step
    name: two
    attributes: { n: 2 }
  - type: step
    name: three
    attributes: { n: 3 }
  - type: step
    name: four
    attributes: { prev: { ref: step.three.id } }
  - type: step
    name: five
    attributes: { prev: { ref: step.three.id } }
";

const DIAMOND: &str = r"
project:
  name: diamond
resources:
  - type: net
    name: top
    attributes: { cidr: 10.0.0.0/16 }
  - type: subnet
    name: left
    attributes: { vpc: { ref: net.top.id } }
  - type: subnet
    name: right
    attributes: { vpc: { ref: net.top.id } }
  - type: lb
    name: bottom
    attributes:
      subnets: [{ ref: subnet.left.id }, { ref: subnet.right.id }]
  - type: dns
    name: alone
    attributes: { zone: example.com }
";

#[tokio::test]
async fn test_every_dependency_finishes_before_its_dependent_starts() {
    let fx = Fixture::with_provider(MemoryProvider::new().with_delay(Duration::from_millis(10)));
    let reconciler = fx.reconciler(DIAMOND);

    let plan = reconciler.plan().await.expect("plan");
    assert_eq!(plan.create_count(), 5);
    reconciler.apply(&plan).await.expect("apply");

    let edges = reconciler.graph().edges();
    assert_eq!(edges.len(), 4);
    for (dependent, dependency) in edges {
        let before = fx.provider.mutation_of(dependency).expect("dependency created");
        let after = fx.provider.mutation_of(dependent).expect("dependent created");
        assert!(
            before.finished < after.started,
            "{dependency} must finish before {dependent} starts"
        );
    }
}

#[tokio::test]
async fn test_mutual_reference_is_rejected_before_any_call() {
    let fx = Fixture::new();
    let yaml = r"
project:
  name: loop
resources:
  - type: a
    name: x
    attributes: { peer: { ref: b.y.id } }
  - type: b
    name: y
    attributes: { peer: { ref: a.x.id } }
";

    let err = fx.try_reconciler(yaml).expect_err("cycle must fail");
    match err {
        StackError::Graph(GraphError::CyclicDependency { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"a.x".to_string()));
            assert!(cycle.contains(&"b.y".to_string()));
        }
        other => panic!("expected a cycle error, got {other}"),
    }
    assert!(fx.provider.operations().is_empty());
}

#[tokio::test]
async fn test_apply_then_replan_is_all_noop() {
    let fx = Fixture::new();
    let first = fx.reconciler(DIAMOND);
    let plan = first.plan().await.expect("plan");
    first.apply(&plan).await.expect("apply");

    fx.provider.reset_log();
    let second = fx.reconciler(DIAMOND);
    let replan = second.plan().await.expect("replan");

    assert!(replan.is_empty(), "unexpected changes:\n{replan}");
    assert!(replan.changes.iter().all(|c| c.action == ChangeAction::NoOp));
    assert_eq!(replan.unchanged_count(), 5);

    let result = second.apply(&replan).await.expect("noop apply");
    assert_eq!(result.applied_count(), 5);
    assert!(fx.provider.mutations().is_empty());
}

#[tokio::test]
async fn test_bucket_is_created_before_role_that_reads_its_arn() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);

    let plan = reconciler.plan().await.expect("plan");
    let bucket = plan.change_for(&addr("bucket.assets")).expect("bucket");
    let role = plan.change_for(&addr("role.reader")).expect("role");
    assert!(bucket.rank < role.rank);
    assert_eq!(role.after, vec![addr("bucket.assets")]);

    reconciler.apply(&plan).await.expect("apply");

    let role = fx.provider.find(&addr("role.reader")).expect("role exists");
    assert_eq!(
        role.attribute("policy_target"),
        Some(&json!("arn:stackwright:bucket:::assets"))
    );

    let bucket_done = fx.provider.mutation_of(&addr("bucket.assets")).expect("bucket");
    let role_done = fx.provider.mutation_of(&addr("role.reader")).expect("role");
    assert!(bucket_done.finished < role_done.started);
}

#[tokio::test]
async fn test_fatal_failure_on_third_of_five() {
    let fx = Fixture::new();
    fx.provider.fail_on(&addr("step.three"), "quota exceeded");
    let reconciler = fx.reconciler(THIRD_OF_FIVE);

    let plan = reconciler.plan().await.expect("plan");
    let result = reconciler.execute(&plan).await.expect("execute");

    let status = |s: &str| result.result_for(&addr(s)).expect("result").status;
    assert_eq!(status("step.one"), ResourceStatus::Applied);
    assert_eq!(status("step.two"), ResourceStatus::Applied);
    assert_eq!(status("step.three"), ResourceStatus::Failed);
    assert_eq!(status("step.four"), ResourceStatus::Skipped);
    assert_eq!(status("step.five"), ResourceStatus::Skipped);

    let state = fx.state();
    assert_eq!(state.resources.len(), 2);
    assert!(state.get_resource(&addr("step.one")).is_some());
    assert!(state.get_resource(&addr("step.two")).is_some());

    match result.into_result() {
        Err(StackError::Reconcile(ReconcileError::PartialApply(mut summary))) => {
            summary.applied.sort();
            summary.skipped.sort();
            assert_eq!(summary.applied, vec!["step.one", "step.two"]);
            assert_eq!(summary.failed.len(), 1);
            assert_eq!(summary.failed[0].0, "step.three");
            assert!(summary.failed[0].1.contains("quota exceeded"));
            assert_eq!(summary.skipped, vec!["step.five", "step.four"]);
        }
        other => panic!("expected PartialApply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failure_leaves_independent_branch_running() {
    let fx = Fixture::new();
    fx.provider.fail_on(&addr("subnet.left"), "no capacity");
    let reconciler = fx.reconciler(DIAMOND);

    let plan = reconciler.plan().await.expect("plan");
    let err = reconciler.apply(&plan).await.expect_err("partial");
    let StackError::Reconcile(ReconcileError::PartialApply(summary)) = err else {
        panic!("expected PartialApply, got {err}");
    };

    assert!(summary.applied.contains(&"subnet.right".to_string()));
    assert!(summary.applied.contains(&"dns.alone".to_string()));
    assert_eq!(summary.skipped, vec!["lb.bottom"]);
}

#[tokio::test]
async fn test_concurrency_stays_within_limit() {
    let mut fx = Fixture::with_provider(MemoryProvider::new().with_delay(Duration::from_millis(30)));
    fx.options.max_concurrency = 2;
    let yaml = r"
project:
  name: wide
resources:
  - { type: item, name: a, attributes: { n: 1 } }
  - { type: item, name: b, attributes: { n: 2 } }
  - { type: item, name: c, attributes: { n: 3 } }
  - { type: item, name: d, attributes: { n: 4 } }
  - { type: item, name: e, attributes: { n: 5 } }
  - { type: item, name: f, attributes: { n: 6 } }
";
    let reconciler = fx.reconciler(yaml);

    let plan = reconciler.plan().await.expect("plan");
    let result = reconciler.apply(&plan).await.expect("apply");

    assert_eq!(result.applied_count(), 6);
    assert_eq!(fx.provider.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_cancellation_before_start_applies_nothing() {
    let fx = Fixture::new();
    let cancel = CancellationToken::new();
    let reconciler = fx.reconciler(CHAIN_OF_FIVE).with_cancellation(cancel.clone());

    let plan = reconciler.plan().await.expect("plan");
    cancel.cancel();
    let result = reconciler.execute(&plan).await.expect("execute");

    assert!(result.cancelled);
    assert_eq!(result.skipped_count(), 5);
    assert!(fx.provider.mutations().is_empty());
}

#[tokio::test]
async fn test_cancellation_lets_in_flight_change_finish() {
    let fx = Fixture::with_provider(MemoryProvider::new().with_delay(Duration::from_millis(100)));
    let cancel = CancellationToken::new();
    let reconciler = fx.reconciler(CHAIN_OF_FIVE).with_cancellation(cancel.clone());
    let plan = reconciler.plan().await.expect("plan");

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let result = reconciler.execute(&plan).await.expect("execute");

    assert!(result.cancelled);
    assert_eq!(
        result.result_for(&addr("step.one")).map(|r| r.status),
        Some(ResourceStatus::Applied)
    );
    assert_eq!(result.skipped_count(), 4);
    assert!(fx.state().get_resource(&addr("step.one")).is_some());
}

#[tokio::test]
async fn test_secrets_never_reach_state_or_plan() {
    let yaml = r"
project:
  name: secrets
variables:
  - name: db_password
    sensitive: true
resources:
  - type: database
    name: main
    attributes:
      engine: postgres
      password: { var: db_password }
";
    let fx = Fixture::new().env("STACKWRIGHT_VAR_db_password", "hunter2-very-secret");
    let reconciler = fx.reconciler(yaml);

    let plan = reconciler.plan().await.expect("plan");
    assert!(!plan.to_json().expect("json").contains("hunter2-very-secret"));
    reconciler.apply(&plan).await.expect("apply");

    let text = fx.state_text();
    assert!(!text.contains("hunter2-very-secret"));
    let record = fx.state().get_resource(&addr("database.main")).cloned().expect("record");
    assert!(record.sensitive.contains_key("password"));
    assert!(!record.attributes.contains_key("password"));

    let rotated = Fixture {
        dir: fx.dir,
        provider: fx.provider,
        env: BTreeMap::from([(
            "STACKWRIGHT_VAR_db_password".to_string(),
            "rotated-secret-value".to_string(),
        )]),
        options: fx.options,
    };
    let replan = rotated.reconciler(yaml).plan().await.expect("replan");
    let change = replan.change_for(&addr("database.main")).expect("change");
    assert_eq!(change.action, ChangeAction::Update);

    let json = replan.to_json().expect("json");
    assert!(!json.contains("rotated-secret-value"));
    assert!(!json.contains("hunter2-very-secret"));
    assert!(!format!("{replan}").contains("rotated-secret-value"));
}

#[tokio::test]
async fn test_out_of_band_change_is_reported_as_drift() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    let report = reconciler.check_drift().await.expect("drift");
    assert!(report.is_converged());
    assert_eq!(report.in_sync, 2);

    let bucket = fx.provider.find(&addr("bucket.assets")).expect("bucket");
    fx.provider.set_attribute(&bucket.id, "acl", json!("public-read"));

    let report = reconciler.check_drift().await.expect("drift");
    assert!(report.has_drift());
    assert_eq!(report.drifted[0].address, addr("bucket.assets"));
    assert_eq!(report.drifted[0].action, ChangeAction::Update);
    assert_eq!(report.drifted[0].changes[0].attribute, "acl");

    // The role reads the bucket's arn, which is unknown until the update lands.
    let role = report
        .drifted
        .iter()
        .find(|c| c.address == addr("role.reader"))
        .expect("role follows the bucket");
    assert_eq!(role.reason, "changed: policy_target");
}

#[tokio::test]
async fn test_deleted_resource_is_recreated() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    let bucket = fx.provider.find(&addr("bucket.assets")).expect("bucket");
    fx.provider.remove(&bucket.id);

    let plan = reconciler.plan().await.expect("replan");
    assert_eq!(plan.forgotten, vec![addr("bucket.assets")]);
    assert_eq!(
        plan.change_for(&addr("bucket.assets")).map(|c| c.action),
        Some(ChangeAction::Create)
    );
    reconciler.apply(&plan).await.expect("apply");

    let recreated = fx.provider.find(&addr("bucket.assets")).expect("bucket");
    assert_ne!(recreated.id, bucket.id);
    assert!(reconciler.plan().await.expect("plan").is_empty());
}

#[tokio::test]
async fn test_destroy_all_removes_dependents_first() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(DIAMOND);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");
    fx.provider.reset_log();

    let result = reconciler.destroy_all().await.expect("destroy");
    assert_eq!(result.applied_count(), 5);
    assert!(fx.provider.is_empty());
    assert!(fx.state().resources.is_empty());

    let net = fx.provider.mutation_of(&addr("net.top")).expect("net deleted");
    let lb = fx.provider.mutation_of(&addr("lb.bottom")).expect("lb deleted");
    assert!(lb.finished < net.started);
}

#[tokio::test]
async fn test_stale_plan_is_refused() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);
    let first = reconciler.plan().await.expect("plan");
    let stale = reconciler.plan().await.expect("plan");

    reconciler.apply(&first).await.expect("apply");
    fx.provider.reset_log();

    let err = reconciler.apply(&stale).await.expect_err("stale");
    assert!(matches!(
        err,
        StackError::Reconcile(ReconcileError::Aborted { .. })
    ));
    assert!(fx.provider.mutations().is_empty());
}

#[tokio::test]
async fn test_removed_declaration_is_destroyed() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    let only_bucket = r"
project:
  name: web
resources:
  - type: bucket
    name: assets
    attributes:
      acl: private
";
    let reconciler = fx.reconciler(only_bucket);
    let plan = reconciler.plan().await.expect("plan");
    assert_eq!(plan.destroy_count(), 1);
    assert_eq!(
        plan.change_for(&addr("role.reader")).map(|c| c.action),
        Some(ChangeAction::Destroy)
    );

    reconciler.apply(&plan).await.expect("apply");
    assert!(fx.provider.find(&addr("role.reader")).is_none());
    assert!(fx.provider.find(&addr("bucket.assets")).is_some());
}

#[tokio::test]
async fn test_state_rm_forgets_without_deleting() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    let record = reconciler
        .remove_from_state(&addr("role.reader"))
        .await
        .expect("rm");
    assert!(fx.provider.get(&record.provider_id).is_some());
    assert!(fx.state().get_resource(&addr("role.reader")).is_none());

    let err = reconciler
        .remove_from_state(&addr("role.reader"))
        .await
        .expect_err("already gone");
    assert!(err.to_string().contains("not managed"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut fx = Fixture::new();
    fx.options.retry = RetryPolicy {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    };
    fx.provider.fail_transiently(&addr("bucket.assets"), 2);
    let reconciler = fx.reconciler(BUCKET_AND_ROLE);

    let plan = reconciler.plan().await.expect("plan");
    let result = reconciler.apply(&plan).await.expect("apply");
    let bucket = result.result_for(&addr("bucket.assets")).expect("bucket");
    assert_eq!(bucket.attempts, 3);
    assert_eq!(bucket.status, ResourceStatus::Applied);
}

const X_AND_Y: &str = r"
project:
  name: pair
resources:
  - type: t
    name: x
    attributes: { n: 1 }
  - type: t
    name: y
    attributes: { peer: { ref: t.x.id } }
";

const ONLY_Y: &str = r"
project:
  name: pair
resources:
  - type: t
    name: y
    attributes: { n: 2 }
";

#[tokio::test]
async fn test_orphan_survives_failed_update_of_its_last_dependent() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(X_AND_Y);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    fx.provider.fail_on(&addr("t.y"), "update rejected");
    let reconciler = fx.reconciler(ONLY_Y);
    let plan = reconciler.plan().await.expect("plan");
    let x = plan.change_for(&addr("t.x")).expect("x");
    assert_eq!(x.action, ChangeAction::Destroy);
    assert_eq!(x.after, vec![addr("t.y")]);

    let result = reconciler.execute(&plan).await.expect("execute");
    let y = result.result_for(&addr("t.y")).expect("y");
    assert_eq!(y.status, ResourceStatus::Failed);
    let x = result.result_for(&addr("t.x")).expect("x");
    assert_eq!(x.status, ResourceStatus::Skipped);
    assert_eq!(x.error.as_deref(), Some("depends on failed t.y"));

    assert!(fx.provider.find(&addr("t.x")).is_some());
    assert!(fx.state().get_resource(&addr("t.x")).is_some());
}

#[tokio::test]
async fn test_orphan_is_destroyed_after_its_last_dependent_lets_go() {
    let fx = Fixture::new();
    let reconciler = fx.reconciler(X_AND_Y);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");
    fx.provider.reset_log();

    let reconciler = fx.reconciler(ONLY_Y);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    let y = fx.provider.mutation_of(&addr("t.y")).expect("y updated");
    let x = fx.provider.mutation_of(&addr("t.x")).expect("x deleted");
    assert!(y.finished < x.started);

    let y = fx.provider.find(&addr("t.y")).expect("y");
    assert_eq!(y.attribute("n"), Some(&json!(2)));
    assert!(y.attribute("peer").is_none());
    assert!(fx.provider.find(&addr("t.x")).is_none());
}

#[tokio::test]
async fn test_attribute_removed_from_config_is_cleared() {
    let fx = Fixture::new();
    let with_policy = r"
project:
  name: policy
resources:
  - type: bucket
    name: b
    attributes:
      acl: private
      public_policy: allow-all
";
    let reconciler = fx.reconciler(with_policy);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");

    let without_policy = r"
project:
  name: policy
resources:
  - type: bucket
    name: b
    attributes:
      acl: private
";
    let reconciler = fx.reconciler(without_policy);
    let plan = reconciler.plan().await.expect("plan");
    let change = plan.change_for(&addr("bucket.b")).expect("bucket");
    assert_eq!(change.action, ChangeAction::Update);
    assert_eq!(change.reason, "changed: public_policy");

    reconciler.apply(&plan).await.expect("apply");
    let bucket = fx.provider.find(&addr("bucket.b")).expect("bucket");
    assert!(bucket.attribute("public_policy").is_none());
    assert_eq!(bucket.attribute("acl"), Some(&json!("private")));
    assert!(reconciler.plan().await.expect("replan").is_empty());
}

#[tokio::test]
async fn test_reference_to_unchanged_declared_attribute_stays_noop() {
    let small = r"
project:
  name: refs
resources:
  - type: disk
    name: data
    attributes: { label: data-volume, size: 10 }
  - type: vm
    name: app
    attributes: { volume_label: { ref: disk.data.label } }
";
    let fx = Fixture::new();
    let reconciler = fx.reconciler(small);
    let plan = reconciler.plan().await.expect("plan");
    reconciler.apply(&plan).await.expect("apply");
    fx.provider.reset_log();

    let large = small.replace("size: 10", "size: 20");
    let reconciler = fx.reconciler(&large);
    let plan = reconciler.plan().await.expect("plan");
    assert_eq!(
        plan.change_for(&addr("disk.data")).map(|c| c.action),
        Some(ChangeAction::Update)
    );
    assert_eq!(
        plan.change_for(&addr("vm.app")).map(|c| c.action),
        Some(ChangeAction::NoOp)
    );

    reconciler.apply(&plan).await.expect("apply");
    assert_eq!(fx.provider.mutations().len(), 1);
}
