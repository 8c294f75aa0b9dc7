//! Patch bundle container: manifests, version-specific hook sets and payload
//! files, stored as a zstd-compressed bincode stream behind a magic header.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;

use crate::hook::RawHook;
use crate::manifest::Manifest;
use crate::resolver::ManifestMap;
use crate::util;
use crate::version::{GameVersion, VersionTable};

pub const MAGIC: &[u8; 8] = b"HKBNDV01";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchBundle {
    pub version: u32,
    /// Executable hashes this bundle knows how to name.
    pub versions: Vec<KnownVersion>,
    pub patches: Vec<PatchDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownVersion {
    pub hash: String,
    pub version: GameVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDefinition {
    pub manifest: Manifest,
    /// Executable hash -> hooks for that build.
    pub hooks: BTreeMap<String, Vec<RawHook>>,
    pub payloads: Vec<Payload>,
}

/// A file shipped with a patch, written relative to the game directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub path: String,
    pub data: Vec<u8>,
    pub blake3_hash: [u8; 32],
}

impl Payload {
    pub fn new(path: &str, data: &[u8]) -> Self {
        Payload {
            path: path.to_string(),
            data: data.to_vec(),
            blake3_hash: util::hash_bytes(data),
        }
    }
}

impl PatchDefinition {
    pub fn new(manifest: Manifest) -> Self {
        PatchDefinition {
            manifest,
            hooks: BTreeMap::new(),
            payloads: Vec::new(),
        }
    }

    pub fn with_hooks(mut self, executable_hash: &str, hooks: Vec<RawHook>) -> Self {
        self.hooks
            .insert(executable_hash.to_ascii_uppercase(), hooks);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Hooks for the build hashing to `executable_hash`; empty if none.
    pub fn hooks_for(&self, executable_hash: &str) -> &[RawHook] {
        self.hooks
            .get(&executable_hash.to_ascii_uppercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for PatchBundle {
    fn default() -> Self {
        PatchBundle {
            version: FORMAT_VERSION,
            versions: Vec::new(),
            patches: Vec::new(),
        }
    }
}

impl PatchBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, hash: &str, version: GameVersion) -> Self {
        self.versions.push(KnownVersion {
            hash: hash.to_ascii_uppercase(),
            version,
        });
        self
    }

    pub fn with_patch(mut self, patch: PatchDefinition) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn patch(&self, id: &str) -> Option<&PatchDefinition> {
        self.patches.iter().find(|p| p.manifest.id == id)
    }

    pub fn manifests(&self) -> ManifestMap {
        self.patches
            .iter()
            .map(|p| (p.manifest.id.clone(), p.manifest.clone()))
            .collect()
    }

    pub fn version_table(&self) -> VersionTable {
        self.versions
            .iter()
            .map(|k| (k.hash.as_str(), k.version.clone()))
            .collect()
    }

    /// Load a bundle file: check magic, then stream-decompress into bincode.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = util::mmap_file(path)?;

        if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
            bail!("Invalid patch bundle: missing magic header");
        }

        let decoder =
            zstd::Decoder::new(&raw[MAGIC.len()..]).context("Failed to create zstd decoder")?;
        let bundle: PatchBundle =
            bincode::deserialize_from(decoder).context("Failed to deserialize patch bundle")?;

        if bundle.version != FORMAT_VERSION {
            bail!(
                "Unsupported bundle version: {} (expected {})",
                bundle.version,
                FORMAT_VERSION
            );
        }

        let mut seen = HashSet::new();
        for patch in &bundle.patches {
            if !seen.insert(patch.manifest.id.as_str()) {
                bail!("Duplicate patch id in bundle: {}", patch.manifest.id);
            }
        }

        Ok(bundle)
    }

    /// Serialize, compress, write.
    pub fn write(&self, output: &Path) -> Result<()> {
        let encoded = bincode::serialize(self).context("Failed to serialize patch bundle")?;
        let compressed =
            zstd::bulk::compress(&encoded, 3).context("Failed to compress patch bundle")?;

        let mut file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create bundle file: {}", output.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(&compressed)?;
        file.flush()?;
        Ok(())
    }
}
