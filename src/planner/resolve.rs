//! Resolution of declared attributes into concrete values.
//!
//! A declared attribute may mention variables and attributes of other
//! resources. Resolving it yields a [`DesiredAttribute`]: a known value, a
//! secret value, or `Unknown` when it reads a computed attribute of a
//! resource that will only be known after that resource has been applied.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::{
    AttributeValue, DesiredState, ReferenceExpr, ResourceAddress, ResourceDeclaration,
    VariableValue, VariableValues,
};
use crate::error::{ConfigError, Result, StackError};
use crate::provider::{Attributes, RemoteState};
use crate::sensitive::Sensitive;

/// The resolved value of one declared attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredAttribute {
    /// Fully known value.
    Known(Value),
    /// Known value containing a sensitive part.
    Secret(Sensitive<Value>),
    /// Depends on an attribute not known until apply.
    Unknown,
}

impl DesiredAttribute {
    /// Returns true if the value is known (plain or secret).
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Returns true if the value is secret.
    #[must_use]
    pub const fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }
}

/// Resolved attributes of one resource, keyed by attribute name.
pub type ResolvedAttributes = BTreeMap<String, DesiredAttribute>;

/// Observed remote states keyed by address.
///
/// Attribute values may include secrets, so `Debug` lists addresses only.
#[derive(Clone, Default)]
pub struct RemoteCache {
    entries: BTreeMap<ResourceAddress, RemoteState>,
}

impl RemoteCache {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Looks up the observed state of a resource.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&RemoteState> {
        self.entries.get(address)
    }

    /// Records the observed state of a resource.
    pub fn insert(&mut self, address: ResourceAddress, remote: RemoteState) {
        self.entries.insert(address, remote);
    }

    /// Forgets a resource.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<RemoteState> {
        self.entries.remove(address)
    }

    /// Returns true if a state is cached for `address`.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.entries.contains_key(address)
    }

    /// Number of cached states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Resolves declarations against variables and observed states.
#[derive(Debug)]
pub struct AttributeResolver<'a> {
    desired: &'a DesiredState,
    values: &'a VariableValues,
    remote: &'a RemoteCache,
    pending: &'a BTreeSet<ResourceAddress>,
}

impl<'a> AttributeResolver<'a> {
    /// Creates a resolver. References to computed attributes of resources in
    /// `pending` resolve to [`DesiredAttribute::Unknown`].
    #[must_use]
    pub const fn new(
        desired: &'a DesiredState,
        values: &'a VariableValues,
        remote: &'a RemoteCache,
        pending: &'a BTreeSet<ResourceAddress>,
    ) -> Self {
        Self {
            desired,
            values,
            remote,
            pending,
        }
    }

    /// Resolves every attribute of `declaration`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a variable has no value or a
    /// referenced resource has no such attribute.
    pub fn resolve(&self, declaration: &ResourceDeclaration) -> Result<ResolvedAttributes> {
        declaration
            .attributes
            .iter()
            .map(|(key, value)| {
                let field = format!("{}.{key}", declaration.address);
                self.resolve_value(value, &field)
                    .map(|resolved| (key.clone(), resolved))
            })
            .collect()
    }

    fn resolve_value(&self, value: &AttributeValue, field: &str) -> Result<DesiredAttribute> {
        match value {
            AttributeValue::Literal(v) => Ok(DesiredAttribute::Known(v.clone())),
            AttributeValue::Variable(name) => match self.values.get(name) {
                Some(VariableValue::Plain(v)) => Ok(DesiredAttribute::Known(v.clone())),
                Some(VariableValue::Secret(v)) => Ok(DesiredAttribute::Secret(v.clone())),
                None => Err(StackError::Config(ConfigError::validation(
                    format!("Variable '{name}' has no value"),
                    field,
                ))),
            },
            AttributeValue::Reference(expr) => self.resolve_reference(expr, field),
            AttributeValue::List(items) => {
                let parts = items
                    .iter()
                    .map(|item| self.resolve_value(item, field))
                    .collect::<Result<Vec<_>>>()?;
                Ok(combine(parts, |values| Value::Array(values.collect())))
            }
            AttributeValue::Map(entries) => {
                let keys: Vec<&String> = entries.keys().collect();
                let parts = entries
                    .values()
                    .map(|item| self.resolve_value(item, field))
                    .collect::<Result<Vec<_>>>()?;
                Ok(combine(parts, |values| {
                    Value::Object(keys.iter().map(|k| (*k).clone()).zip(values).collect())
                }))
            }
        }
    }

    fn resolve_reference(&self, expr: &ReferenceExpr, field: &str) -> Result<DesiredAttribute> {
        if self.pending.contains(&expr.target) {
            // Declared attributes take their declared value; computed ones
            // are only known once the change lands.
            let declared = self
                .desired
                .resource(&expr.target)
                .and_then(|decl| decl.attributes.get(&expr.attribute));
            return match declared {
                Some(value) => self.resolve_value(value, field),
                None => Ok(DesiredAttribute::Unknown),
            };
        }

        let Some(remote) = self.remote.get(&expr.target) else {
            return Err(StackError::Config(ConfigError::validation(
                format!("{} has not been created", expr.target),
                field,
            )));
        };

        let Some(value) = remote.attribute(&expr.attribute) else {
            return Err(StackError::Config(ConfigError::validation(
                format!("{} has no attribute '{}'", expr.target, expr.attribute),
                field,
            )));
        };

        if self.is_sensitive_attribute(&expr.target, &expr.attribute) {
            Ok(DesiredAttribute::Secret(Sensitive::new(value.clone())))
        } else {
            Ok(DesiredAttribute::Known(value.clone()))
        }
    }

    /// Returns true if the declared attribute of `target` carries a secret,
    /// directly or through a chain of references.
    #[must_use]
    pub fn is_sensitive_attribute(&self, target: &ResourceAddress, attribute: &str) -> bool {
        let Some(value) = self
            .desired
            .resource(target)
            .and_then(|decl| decl.attributes.get(attribute))
        else {
            return false;
        };

        let mut sensitive = false;
        value.walk(&mut |v| match v {
            AttributeValue::Variable(name) => {
                sensitive |= self.values.get(name).is_some_and(VariableValue::is_sensitive);
            }
            AttributeValue::Reference(expr) => {
                sensitive |= self.is_sensitive_attribute(&expr.target, &expr.attribute);
            }
            _ => {}
        });
        sensitive
    }
}

/// Merges resolved parts. Unknown wins over secret, secret over known.
fn combine(
    parts: Vec<DesiredAttribute>,
    build: impl FnOnce(std::vec::IntoIter<Value>) -> Value,
) -> DesiredAttribute {
    if parts.iter().any(|p| !p.is_known()) {
        return DesiredAttribute::Unknown;
    }
    let secret = parts.iter().any(DesiredAttribute::is_secret);
    let values: Vec<Value> = parts
        .into_iter()
        .map(|p| match p {
            DesiredAttribute::Known(v) => v,
            DesiredAttribute::Secret(v) => v.into_inner(),
            DesiredAttribute::Unknown => Value::Null,
        })
        .collect();
    let value = build(values.into_iter());
    if secret {
        DesiredAttribute::Secret(Sensitive::new(value))
    } else {
        DesiredAttribute::Known(value)
    }
}

/// Builds the payload sent to the provider.
///
/// Returns the name of the first attribute still unknown as the error.
pub fn provider_payload(resolved: &ResolvedAttributes) -> std::result::Result<Attributes, String> {
    resolved
        .iter()
        .map(|(key, value)| match value {
            DesiredAttribute::Known(v) => Ok((key.clone(), v.clone())),
            DesiredAttribute::Secret(v) => Ok((key.clone(), v.expose().clone())),
            DesiredAttribute::Unknown => Err(key.clone()),
        })
        .collect()
}

/// Names of the secret attributes.
#[must_use]
pub fn secret_keys(resolved: &ResolvedAttributes) -> BTreeSet<&str> {
    resolved
        .iter()
        .filter(|(_, value)| value.is_secret())
        .map(|(key, _)| key.as_str())
        .collect()
}
