//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of loaded documents, recorded
//! in state to notice configuration changes between runs, and fingerprints
//! of secret values so state can detect a changed secret without storing it.

use sha2::{Digest, Sha256};

use super::model::StackDocument;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole document.
    ///
    /// Maps are ordered, so the hash changes only when content changes.
    #[must_use]
    pub fn hash_document(&self, document: &StackDocument) -> String {
        let mut hasher = Sha256::new();

        hasher.update(document.config.project.name.as_bytes());
        hasher.update(document.config.project.environment.as_bytes());
        if let Some(region) = &document.config.project.region {
            hasher.update(region.as_bytes());
        }

        for resource in &document.desired.resources {
            hasher.update(resource.address.to_string().as_bytes());
            for dep in &resource.depends_on {
                hasher.update(dep.to_string().as_bytes());
            }
            if let Ok(attrs) = serde_json::to_vec(&resource.attributes) {
                hasher.update(&attrs);
            }
        }

        for variable in &document.desired.variables {
            hasher.update(variable.name.as_bytes());
            hasher.update(variable.var_type.to_string().as_bytes());
            hasher.update(if variable.sensitive { [1u8] } else { [0u8] });
            if let Some(default) = &variable.default {
                hasher.update(default.to_string().as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Fingerprints a value. Equal values yield equal fingerprints.
    #[must_use]
    pub fn fingerprint(&self, value: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant time over equal lengths.
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
