//! Mapping executable content hashes to known game versions.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameVersion {
    pub id: String,
    pub name: String,
}

impl GameVersion {
    pub fn new(id: &str, name: &str) -> Self {
        GameVersion {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

/// A version that was recognised from the executable's content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedVersion {
    pub hash: String,
    pub version: GameVersion,
}

/// Looks up a game version by executable hash (uppercase hex BLAKE3).
pub trait VersionProvider {
    fn lookup(&self, hash: &str) -> Option<GameVersion>;
}

/// Hash-keyed version table. Keys are normalised to uppercase.
#[derive(Debug, Clone, Default)]
pub struct VersionTable {
    entries: BTreeMap<String, GameVersion>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hash: &str, version: GameVersion) -> &mut Self {
        self.entries.insert(hash.to_ascii_uppercase(), version);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VersionProvider for VersionTable {
    fn lookup(&self, hash: &str) -> Option<GameVersion> {
        self.entries.get(&hash.to_ascii_uppercase()).cloned()
    }
}

impl<'a> FromIterator<(&'a str, GameVersion)> for VersionTable {
    fn from_iter<T: IntoIterator<Item = (&'a str, GameVersion)>>(iter: T) -> Self {
        let mut table = VersionTable::new();
        for (hash, version) in iter {
            table.register(hash, version);
        }
        table
    }
}

/// Hash the executable and identify its version.
pub fn detect_version(path: &Path, provider: &dyn VersionProvider) -> Result<DetectedVersion> {
    let hash = util::hash_file_hex(path)?;
    let version = provider
        .lookup(&hash)
        .ok_or_else(|| Error::UnsupportedVersion(format!("unknown executable hash {hash}")))?;
    info!(version = %version.id, %hash, "detected game version");
    Ok(DetectedVersion { hash, version })
}
