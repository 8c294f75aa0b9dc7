use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::GameVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub requires: Vec<String>,
    pub conflicts: Vec<String>,
    /// Version id -> expected executable hash. Empty means any version.
    pub supported_versions: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(id: &str) -> Self {
        Manifest {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            author: String::new(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            supported_versions: BTreeMap::new(),
        }
    }

    pub fn requires(mut self, ids: &[&str]) -> Self {
        self.requires = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn conflicts(mut self, ids: &[&str]) -> Self {
        self.conflicts = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn supports(mut self, version_id: &str, hash: &str) -> Self {
        self.supported_versions
            .insert(version_id.to_string(), hash.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(Error::InvalidManifest {
                id: self.id.clone(),
                reason,
            })
        };

        if self.id.trim().is_empty() {
            return invalid("id is empty".to_string());
        }
        if self.requires.iter().any(|r| r == &self.id) {
            return invalid("patch requires itself".to_string());
        }
        if self.conflicts.iter().any(|c| c == &self.id) {
            return invalid("patch conflicts with itself".to_string());
        }
        if let Some(both) = self.requires.iter().find(|r| self.conflicts.contains(r)) {
            return invalid(format!("'{both}' is both required and conflicting"));
        }
        Ok(())
    }

    /// Whether this patch can be installed on `version` whose executable
    /// hashes to `hash`.
    pub fn supports_version(&self, version: &GameVersion, hash: &str) -> bool {
        if self.supported_versions.is_empty() {
            return true;
        }
        self.supported_versions
            .get(&version.id)
            .is_some_and(|expected| expected.eq_ignore_ascii_case(hash))
    }
}
