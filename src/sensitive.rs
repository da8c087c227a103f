//! Redaction of sensitive values.
//!
//! Values marked sensitive in the configuration travel through the engine
//! wrapped in [`Sensitive`], which never prints or serializes its content.
//! Provider error messages are additionally scrubbed by a [`Redactor`]
//! before they reach logs or reports.

use serde::{Serialize, Serializer};
use std::fmt;

/// Placeholder shown wherever a sensitive value would appear.
pub const REDACTED: &str = "(sensitive)";

/// A value that must never be displayed, logged, or persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    /// Wraps a value.
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns the wrapped value. Callers must not log the result.
    pub const fn expose(&self) -> &T {
        &self.0
    }

    /// Unwraps the value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// Scrubs known secret values out of free-form text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<Sensitive<String>>,
}

impl Redactor {
    /// Creates an empty redactor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            secrets: Vec::new(),
        }
    }

    /// Registers a secret JSON value. Strings are matched verbatim, other
    /// values by their compact JSON text. Every nested string is registered
    /// as well.
    pub fn register(&mut self, value: &serde_json::Value) {
        match value {
            serde_json::Value::Null => {}
            serde_json::Value::String(s) => self.push(s.clone()),
            serde_json::Value::Array(items) => {
                for item in items {
                    self.register(item);
                }
            }
            serde_json::Value::Object(map) => {
                for item in map.values() {
                    self.register(item);
                }
            }
            other => self.push(other.to_string()),
        }
    }

    /// Registers a secret string.
    pub fn register_str(&mut self, value: &str) {
        self.push(value.to_string());
    }

    fn push(&mut self, secret: String) {
        if secret.is_empty() || self.secrets.iter().any(|s| *s.expose() == secret) {
            return;
        }
        self.secrets.push(Sensitive::new(secret));
        // Longest first so a secret containing another is replaced whole.
        self.secrets
            .sort_by(|a, b| b.expose().len().cmp(&a.expose().len()));
    }

    /// Returns `text` with every registered secret replaced by [`REDACTED`].
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.expose().as_str()) {
                out = out.replace(secret.expose().as_str(), REDACTED);
            }
        }
        out
    }

    /// Returns true if no secrets are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}
