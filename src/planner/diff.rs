//! Diff engine comparing desired and observed state.
//!
//! Declared resources are visited in apply order. A resource with no
//! observed state is created. Otherwise its resolved attributes are compared
//! with what the provider reports. Attributes the configuration never
//! declared are ignored and secrets are compared by fingerprint. An
//! attribute declared at the last apply but dropped since is cleared.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::{ConfigHasher, DesiredState, ResourceAddress, VariableValues};
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::provider::Attributes;
use crate::state::{DeploymentState, ResourceRecord};

use super::plan::{AttributeChange, ChangeAction, DisplayValue, Plan, PlanKind, PlannedChange};
use super::resolve::{AttributeResolver, DesiredAttribute, RemoteCache, ResolvedAttributes};

/// Engine for computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine {
    hasher: ConfigHasher,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the plan converging `state` on `desired`.
    ///
    /// `observed` holds the refreshed remote state of every recorded
    /// resource that still exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute cannot be resolved or recorded
    /// dependencies form a cycle.
    pub fn plan(
        &self,
        desired: &DesiredState,
        graph: &DependencyGraph,
        values: &VariableValues,
        state: &DeploymentState,
        observed: RemoteCache,
        config_hash: &str,
    ) -> Result<Plan> {
        let mut plan = Plan::new(
            PlanKind::Apply,
            &state.project,
            &state.environment,
            config_hash,
            state.serial,
        );
        let mut pending = BTreeSet::new();

        for (position, address) in graph.apply_order().into_iter().enumerate() {
            let Some(declaration) = desired.resource(address) else {
                continue;
            };
            let record = state.get_resource(address);
            let after = declaration.dependencies();

            let Some(remote) = observed.get(address) else {
                let resolver = AttributeResolver::new(desired, values, &observed, &pending);
                let resolved = resolver.resolve(declaration)?;
                let reason = if record.is_some() {
                    "no longer exists remotely"
                } else {
                    "not yet created"
                };
                debug!(address = %address, "create: {reason}");
                plan.changes.push(PlannedChange {
                    address: address.clone(),
                    action: ChangeAction::Create,
                    rank: position + 1,
                    provider_id: None,
                    reason: reason.to_string(),
                    changes: resolved
                        .iter()
                        .map(|(key, value)| AttributeChange {
                            attribute: key.clone(),
                            old: None,
                            new: DisplayValue::from(value),
                        })
                        .collect(),
                    after,
                });
                pending.insert(address.clone());
                continue;
            };

            let resolver = AttributeResolver::new(desired, values, &observed, &pending);
            let resolved = resolver.resolve(declaration)?;
            let changes = self.compare(&resolved, &remote.attributes, record);

            let (action, reason) = if changes.is_empty() {
                (ChangeAction::NoOp, String::from("up to date"))
            } else {
                pending.insert(address.clone());
                let names: Vec<&str> = changes.iter().map(|c| c.attribute.as_str()).collect();
                (ChangeAction::Update, format!("changed: {}", names.join(", ")))
            };
            debug!(address = %address, "{action}: {reason}");

            plan.changes.push(PlannedChange {
                address: address.clone(),
                action,
                rank: position + 1,
                provider_id: Some(remote.id.clone()),
                reason,
                changes,
                after,
            });
        }

        let orphans: Vec<ResourceAddress> = state
            .addresses()
            .into_iter()
            .filter(|a| desired.resource(a).is_none())
            .collect();
        self.plan_destroys(&mut plan, state, &orphans, &observed, "no longer declared")?;

        plan.forgotten = state
            .addresses()
            .into_iter()
            .filter(|a| !observed.contains(a))
            .collect();
        plan.observed = observed;
        Ok(plan)
    }

    /// Computes a plan removing every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if recorded dependencies form a cycle.
    pub fn plan_destroy(
        &self,
        state: &DeploymentState,
        observed: RemoteCache,
        config_hash: &str,
    ) -> Result<Plan> {
        let mut plan = Plan::new(
            PlanKind::Destroy,
            &state.project,
            &state.environment,
            config_hash,
            state.serial,
        );
        self.plan_destroys(
            &mut plan,
            state,
            &state.addresses(),
            &observed,
            "destroy requested",
        )?;
        plan.forgotten = state
            .addresses()
            .into_iter()
            .filter(|a| !observed.contains(a))
            .collect();
        plan.observed = observed;
        Ok(plan)
    }

    /// Appends destroys for `targets` that still exist, dependents first.
    ///
    /// A destroy also waits on every planned survivor whose recorded
    /// dependencies still name it, so it only runs once the survivor no
    /// longer points at it.
    fn plan_destroys(
        &self,
        plan: &mut Plan,
        state: &DeploymentState,
        targets: &[ResourceAddress],
        observed: &RemoteCache,
        reason: &str,
    ) -> Result<()> {
        let existing: Vec<ResourceAddress> = targets
            .iter()
            .filter(|a| observed.contains(a))
            .cloned()
            .collect();
        let graph = DependencyGraph::from_edges(existing, &state.dependency_edges())?;

        for (position, address) in graph.destroy_order().into_iter().enumerate() {
            let provider_id = state.get_resource(address).map(|r| r.provider_id.clone());
            let mut after: Vec<ResourceAddress> =
                graph.dependents_of(address).into_iter().cloned().collect();
            after.extend(
                state
                    .resources
                    .values()
                    .filter(|r| r.dependencies.contains(address) && !targets.contains(&r.address))
                    .filter(|r| plan.change_for(&r.address).is_some())
                    .map(|r| r.address.clone()),
            );
            debug!(address = %address, "destroy: {reason}");
            plan.changes.push(PlannedChange {
                address: address.clone(),
                action: ChangeAction::Destroy,
                rank: position + 1,
                provider_id,
                reason: reason.to_string(),
                changes: vec![],
                after,
            });
        }
        Ok(())
    }

    /// Lists the declared attributes that differ from the observed ones.
    fn compare(
        &self,
        resolved: &ResolvedAttributes,
        observed: &Attributes,
        record: Option<&ResourceRecord>,
    ) -> Vec<AttributeChange> {
        let mut changes = Vec::new();
        for (key, desired) in resolved {
            let current = observed.get(key);
            let recorded_secret = record.and_then(|r| r.sensitive.get(key));
            let differs = match desired {
                DesiredAttribute::Known(value) => current != Some(value),
                DesiredAttribute::Secret(value) => {
                    recorded_secret != Some(&self.hasher.fingerprint(value.expose()))
                }
                DesiredAttribute::Unknown => true,
            };
            if !differs {
                continue;
            }

            let hide = desired.is_secret() || recorded_secret.is_some();
            let old = match current {
                Some(_) if hide => Some(DisplayValue::Sensitive),
                Some(value) => Some(DisplayValue::Known(value.clone())),
                None if recorded_secret.is_some() => Some(DisplayValue::Sensitive),
                None => None,
            };
            changes.push(AttributeChange {
                attribute: key.clone(),
                old,
                new: DisplayValue::from(desired),
            });
        }

        // Attributes dropped from the configuration are cleared remotely.
        let dropped = record
            .into_iter()
            .flat_map(|r| &r.declared)
            .filter(|key| !resolved.contains_key(*key));
        for key in dropped {
            let current = observed.get(key).filter(|v| !v.is_null());
            let was_secret = record.is_some_and(|r| r.sensitive.contains_key(key));
            let old = match current {
                Some(_) if was_secret => DisplayValue::Sensitive,
                Some(value) => DisplayValue::Known(value.clone()),
                None => continue,
            };
            changes.push(AttributeChange {
                attribute: key.clone(),
                old: Some(old),
                new: DisplayValue::Known(Value::Null),
            });
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, VariableValue};
    use crate::provider::RemoteState;
    use crate::sensitive::Sensitive;
    use serde_json::json;

    const DOC: &str = r"
project:
  name: demo
provider:
  endpoint: http://localhost:9000
variables:
  - name: db_password
    sensitive: true
resources:
  - type: aws_s3_bucket
    name: artifacts
    attributes:
      acl: private
  - type: aws_iam_role
    name: pipeline
    attributes:
      bucket_arn: { ref: aws_s3_bucket.artifacts.arn }
      password: { var: db_password }
";

    struct Fixture {
        desired: DesiredState,
        graph: DependencyGraph,
        values: VariableValues,
    }

    fn fixture(password: &str) -> Fixture {
        let doc = ConfigParser::new().parse_yaml(DOC, None).expect("parse");
        let graph = DependencyGraph::build(&doc.desired).expect("graph");
        let mut values = VariableValues::default();
        values.insert(
            "db_password",
            VariableValue::Secret(Sensitive::new(json!(password))),
        );
        Fixture {
            desired: doc.desired,
            graph,
            values,
        }
    }

    fn addr(s: &str) -> ResourceAddress {
        s.parse().expect("address")
    }

    fn remote(id: &str, resource_type: &str, attributes: serde_json::Value) -> RemoteState {
        let attributes = serde_json::from_value(attributes).expect("attributes");
        RemoteState {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            attributes,
        }
    }

    /// State and observations for both resources already applied.
    fn applied(password: &str) -> (DeploymentState, RemoteCache) {
        let hasher = ConfigHasher::new();
        let mut state = DeploymentState::new("demo", "dev");
        let mut cache = RemoteCache::new();

        state.set_resource(ResourceRecord::new(addr("aws_s3_bucket.artifacts"), "b-1"));
        cache.insert(
            addr("aws_s3_bucket.artifacts"),
            remote("b-1", "aws_s3_bucket", json!({"acl": "private", "arn": "arn:b-1"})),
        );

        let mut role = ResourceRecord::new(addr("aws_iam_role.pipeline"), "r-1");
        role.sensitive
            .insert(String::from("password"), hasher.fingerprint(&json!(password)));
        role.dependencies.push(addr("aws_s3_bucket.artifacts"));
        state.set_resource(role);
        cache.insert(
            addr("aws_iam_role.pipeline"),
            remote("r-1", "aws_iam_role", json!({"bucket_arn": "arn:b-1", "id": "r-1"})),
        );
        (state, cache)
    }

    #[test]
    fn test_fresh_state_creates_in_order() {
        let f = fixture("hunter2");
        let state = DeploymentState::new("demo", "dev");
        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, RemoteCache::new(), "h")
            .expect("plan");

        assert_eq!(plan.create_count(), 2);
        assert_eq!(plan.changes[0].address, addr("aws_s3_bucket.artifacts"));
        assert_eq!(plan.changes[0].rank, 1);
        assert_eq!(plan.changes[1].rank, 2);
        assert_eq!(plan.changes[1].after, vec![addr("aws_s3_bucket.artifacts")]);

        let role = &plan.changes[1].changes;
        let arn = role.iter().find(|c| c.attribute == "bucket_arn").expect("arn");
        assert_eq!(arn.new, DisplayValue::Unknown);
        let password = role.iter().find(|c| c.attribute == "password").expect("pw");
        assert_eq!(password.new, DisplayValue::Sensitive);
    }

    #[test]
    fn test_converged_state_is_noop() {
        let f = fixture("hunter2");
        let (state, cache) = applied("hunter2");
        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        assert!(plan.is_empty(), "{plan}");
        assert_eq!(plan.unchanged_count(), 2);
        assert_eq!(plan.changes[1].provider_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_changed_secret_is_update_without_value() {
        let f = fixture("correct-horse");
        let (state, cache) = applied("hunter2");
        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        let change = plan
            .change_for(&addr("aws_iam_role.pipeline"))
            .expect("role change");
        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.changes.len(), 1);
        assert_eq!(change.changes[0].old, Some(DisplayValue::Sensitive));
        assert_eq!(change.changes[0].new, DisplayValue::Sensitive);

        let json = plan.to_json().expect("json");
        assert!(!json.contains("correct-horse"));
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_drifted_attribute_and_dependent() {
        let f = fixture("hunter2");
        let (state, mut cache) = applied("hunter2");
        cache.insert(
            addr("aws_s3_bucket.artifacts"),
            remote("b-1", "aws_s3_bucket", json!({"acl": "public-read", "arn": "arn:b-1"})),
        );
        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        let bucket = &plan.changes[0];
        assert_eq!(bucket.action, ChangeAction::Update);
        assert_eq!(bucket.changes[0].old, Some(DisplayValue::Known(json!("public-read"))));
        assert_eq!(bucket.changes[0].new, DisplayValue::Known(json!("private")));

        // The role reads the bucket's arn, which is unknown until the update lands.
        assert_eq!(plan.changes[1].action, ChangeAction::Update);
        assert_eq!(plan.changes[1].changes[0].new, DisplayValue::Unknown);
    }

    #[test]
    fn test_vanished_resource_is_recreated_and_forgotten() {
        let f = fixture("hunter2");
        let (state, mut cache) = applied("hunter2");
        cache.remove(&addr("aws_iam_role.pipeline"));
        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        assert_eq!(plan.changes[0].action, ChangeAction::NoOp);
        assert_eq!(plan.changes[1].action, ChangeAction::Create);
        assert_eq!(plan.changes[1].reason, "no longer exists remotely");
        assert_eq!(plan.forgotten, vec![addr("aws_iam_role.pipeline")]);
    }

    #[test]
    fn test_undeclared_records_destroyed_dependents_first() {
        let f = fixture("hunter2");
        let (mut state, mut cache) = applied("hunter2");
        let mut instance = ResourceRecord::new(addr("aws_instance.old"), "i-1");
        instance.dependencies.push(addr("aws_security_group.old"));
        state.set_resource(instance);
        state.set_resource(ResourceRecord::new(addr("aws_security_group.old"), "sg-1"));
        cache.insert(addr("aws_instance.old"), remote("i-1", "aws_instance", json!({})));
        cache.insert(
            addr("aws_security_group.old"),
            remote("sg-1", "aws_security_group", json!({})),
        );

        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        let destroys: Vec<&PlannedChange> = plan
            .changes
            .iter()
            .filter(|c| c.action == ChangeAction::Destroy)
            .collect();
        assert_eq!(destroys.len(), 2);
        assert_eq!(destroys[0].address, addr("aws_instance.old"));
        assert_eq!(destroys[1].address, addr("aws_security_group.old"));
        assert_eq!(destroys[1].after, vec![addr("aws_instance.old")]);
        assert_eq!(destroys[1].provider_id.as_deref(), Some("sg-1"));
    }

    #[test]
    fn test_dropped_attribute_is_cleared() {
        let f = fixture("hunter2");
        let (mut state, mut cache) = applied("hunter2");
        let mut bucket = ResourceRecord::new(addr("aws_s3_bucket.artifacts"), "b-1");
        bucket.declared = BTreeSet::from([String::from("acl"), String::from("public_policy")]);
        state.set_resource(bucket);
        cache.insert(
            addr("aws_s3_bucket.artifacts"),
            remote(
                "b-1",
                "aws_s3_bucket",
                json!({"acl": "private", "arn": "arn:b-1", "public_policy": "allow-all"}),
            ),
        );

        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        let bucket = plan
            .change_for(&addr("aws_s3_bucket.artifacts"))
            .expect("bucket change");
        assert_eq!(bucket.action, ChangeAction::Update);
        assert_eq!(bucket.changes.len(), 1);
        assert_eq!(bucket.changes[0].attribute, "public_policy");
        assert_eq!(bucket.changes[0].old, Some(DisplayValue::Known(json!("allow-all"))));
        assert_eq!(bucket.changes[0].new, DisplayValue::Known(Value::Null));
    }

    #[test]
    fn test_undeclared_attribute_is_left_alone() {
        let f = fixture("hunter2");
        let (state, mut cache) = applied("hunter2");
        cache.insert(
            addr("aws_s3_bucket.artifacts"),
            remote(
                "b-1",
                "aws_s3_bucket",
                json!({"acl": "private", "arn": "arn:b-1", "tags": {"team": "ops"}}),
            ),
        );

        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");
        assert!(plan.is_empty(), "{plan}");
    }

    #[test]
    fn test_destroy_waits_for_survivor_dropping_its_reference() {
        let f = fixture("hunter2");
        let (mut state, mut cache) = applied("hunter2");
        let mut role = state
            .get_resource(&addr("aws_iam_role.pipeline"))
            .cloned()
            .expect("role");
        role.dependencies.push(addr("aws_kms_key.old"));
        state.set_resource(role);
        state.set_resource(ResourceRecord::new(addr("aws_kms_key.old"), "k-1"));
        cache.insert(addr("aws_kms_key.old"), remote("k-1", "aws_kms_key", json!({})));

        let plan = DiffEngine::new()
            .plan(&f.desired, &f.graph, &f.values, &state, cache, "h")
            .expect("plan");

        let key = plan.change_for(&addr("aws_kms_key.old")).expect("key");
        assert_eq!(key.action, ChangeAction::Destroy);
        assert_eq!(key.after, vec![addr("aws_iam_role.pipeline")]);
    }

    #[test]
    fn test_destroy_plan_covers_every_record() {
        let (state, cache) = applied("hunter2");
        let plan = DiffEngine::new()
            .plan_destroy(&state, cache, "h")
            .expect("plan");

        assert_eq!(plan.kind, PlanKind::Destroy);
        let order: Vec<String> = plan.changes.iter().map(|c| c.address.to_string()).collect();
        assert_eq!(order, vec!["aws_iam_role.pipeline", "aws_s3_bucket.artifacts"]);
    }
}
