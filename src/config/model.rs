//! Typed desired-state model produced by the loader.
//!
//! Attribute values are tagged variants: a literal, a reference to another
//! resource's attribute, a variable, or a container of those. Dependency
//! extraction is therefore a structural walk, never text parsing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::spec::DeployConfig;

/// Identity of a resource: its type and logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Resource type, e.g. `aws_s3_bucket`.
    pub resource_type: String,
    /// Logical name, unique per type within a document.
    pub name: String,
}

impl ResourceAddress {
    /// Creates an address.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((ty, name)) if !ty.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Self::new(ty, name))
            }
            _ => Err(format!("invalid resource address '{s}', expected TYPE.NAME")),
        }
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(addr: ResourceAddress) -> Self {
        addr.to_string()
    }
}

/// A reference to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceExpr {
    /// Referenced resource.
    pub target: ResourceAddress,
    /// Attribute read from the target.
    pub attribute: String,
}

impl ReferenceExpr {
    /// Parses `type.name.attribute`.
    #[must_use]
    pub fn parse(expr: &str) -> Option<Self> {
        let mut parts = expr.split('.');
        let (ty, name, attribute) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || ty.is_empty() || name.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(Self {
            target: ResourceAddress::new(ty, name),
            attribute: attribute.to_string(),
        })
    }
}

impl fmt::Display for ReferenceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// A value with no expressions inside.
    Literal(serde_json::Value),
    /// An attribute of another resource.
    Reference(ReferenceExpr),
    /// A declared variable.
    Variable(String),
    /// A list containing at least one expression.
    List(Vec<AttributeValue>),
    /// A map containing at least one expression.
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Converts a YAML value, recognizing `{ ref: ... }` and `{ var: ... }`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for malformed expressions,
    /// non-string map keys, tagged values, or non-finite numbers.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, String> {
        match value {
            serde_yaml::Value::Mapping(map) => {
                if map.len() == 1
                    && let Some((serde_yaml::Value::String(key), inner)) = map.iter().next()
                {
                    match key.as_str() {
                        "ref" => {
                            let expr = inner
                                .as_str()
                                .ok_or_else(|| String::from("'ref' must be a string"))?;
                            return ReferenceExpr::parse(expr)
                                .map(Self::Reference)
                                .ok_or_else(|| {
                                    format!("invalid reference '{expr}', expected TYPE.NAME.ATTRIBUTE")
                                });
                        }
                        "var" => {
                            let name = inner
                                .as_str()
                                .ok_or_else(|| String::from("'var' must be a string"))?;
                            return Ok(Self::Variable(name.to_string()));
                        }
                        _ => {}
                    }
                }

                let mut entries = BTreeMap::new();
                for (key, inner) in map {
                    let key = key
                        .as_str()
                        .ok_or_else(|| format!("map keys must be strings, found {key:?}"))?;
                    entries.insert(key.to_string(), Self::from_yaml(inner)?);
                }
                Ok(Self::collapse_map(entries))
            }
            serde_yaml::Value::Sequence(items) => {
                let items = items
                    .iter()
                    .map(Self::from_yaml)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::collapse_list(items))
            }
            serde_yaml::Value::Tagged(tagged) => {
                Err(format!("YAML tag {} is not supported", tagged.tag))
            }
            scalar => serde_json::to_value(scalar)
                .map(Self::Literal)
                .map_err(|e| format!("unsupported value: {e}")),
        }
    }

    fn collapse_list(items: Vec<Self>) -> Self {
        if items.iter().all(|i| matches!(i, Self::Literal(_))) {
            Self::Literal(serde_json::Value::Array(
                items.into_iter().filter_map(Self::into_literal).collect(),
            ))
        } else {
            Self::List(items)
        }
    }

    fn collapse_map(entries: BTreeMap<String, Self>) -> Self {
        if entries.values().all(|v| matches!(v, Self::Literal(_))) {
            Self::Literal(serde_json::Value::Object(
                entries
                    .into_iter()
                    .filter_map(|(k, v)| v.into_literal().map(|v| (k, v)))
                    .collect(),
            ))
        } else {
            Self::Map(entries)
        }
    }

    fn into_literal(self) -> Option<serde_json::Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Calls `f` on this value and every nested value.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        match self {
            Self::List(items) => {
                for item in items {
                    item.walk(f);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.walk(f);
                }
            }
            Self::Literal(_) | Self::Reference(_) | Self::Variable(_) => {}
        }
    }

    /// Returns every reference expression inside this value.
    #[must_use]
    pub fn references(&self) -> Vec<&ReferenceExpr> {
        let mut found = Vec::new();
        self.walk(&mut |v| {
            if let Self::Reference(r) = v {
                found.push(r);
            }
        });
        found
    }

    /// Returns every variable name used inside this value.
    #[must_use]
    pub fn variables(&self) -> Vec<&str> {
        let mut found = Vec::new();
        self.walk(&mut |v| {
            if let Self::Variable(name) = v {
                found.push(name.as_str());
            }
        });
        found
    }
}

/// A resource declared in the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDeclaration {
    /// Resource identity.
    pub address: ResourceAddress,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Explicit dependencies from `depends_on`.
    pub depends_on: Vec<ResourceAddress>,
    /// Position in the document.
    pub index: usize,
}

impl ResourceDeclaration {
    /// Returns every reference made by the attributes, in attribute order.
    #[must_use]
    pub fn references(&self) -> Vec<&ReferenceExpr> {
        self.attributes
            .values()
            .flat_map(AttributeValue::references)
            .collect()
    }

    /// Explicit and inferred dependencies, de-duplicated, first seen first.
    #[must_use]
    pub fn dependencies(&self) -> Vec<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut deps = Vec::new();
        let inferred = self.references().into_iter().map(|r| &r.target);
        for addr in self.depends_on.iter().chain(inferred) {
            if seen.insert(addr.clone()) {
                deps.push(addr.clone());
            }
        }
        deps
    }

    /// Names of the declared attributes.
    #[must_use]
    pub fn attribute_names(&self) -> BTreeSet<String> {
        self.attributes.keys().cloned().collect()
    }

    /// Names of variables used by this resource.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<&str> {
        self.attributes
            .values()
            .flat_map(AttributeValue::variables)
            .collect()
    }
}

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// A string.
    #[default]
    String,
    /// A number.
    Number,
    /// A boolean.
    Bool,
    /// A list.
    List,
    /// A map.
    Map,
    /// Any JSON value.
    Any,
}

impl VariableType {
    /// Returns true if `value` has this type.
    #[must_use]
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        write!(f, "{s}")
    }
}

/// A declared input variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    /// Variable name.
    pub name: String,
    /// Declared type.
    pub var_type: VariableType,
    /// Default value, if any.
    pub default: Option<serde_json::Value>,
    /// Whether the value must never be displayed or persisted.
    pub sensitive: bool,
    /// Human description.
    pub description: Option<String>,
}

/// The declarations of one document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DesiredState {
    /// Declared resources.
    pub resources: Vec<ResourceDeclaration>,
    /// Declared variables.
    pub variables: Vec<Variable>,
}

impl DesiredState {
    /// Looks up a resource by address.
    #[must_use]
    pub fn resource(&self, address: &ResourceAddress) -> Option<&ResourceDeclaration> {
        self.resources.iter().find(|r| &r.address == address)
    }

    /// Looks up a variable by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Names of all variables referenced by any resource.
    #[must_use]
    pub fn referenced_variables(&self) -> BTreeSet<&str> {
        self.resources
            .iter()
            .flat_map(ResourceDeclaration::variables)
            .collect()
    }
}

/// A fully loaded configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDocument {
    /// Project, state, provider and engine settings.
    pub config: DeployConfig,
    /// Resource and variable declarations.
    pub desired: DesiredState,
}
