//! Pipeline steps that live outside the core engine: payload extraction,
//! config emission and support-file installation. Each is a trait so callers
//! can swap implementations; the stock ones here cover the common case.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::bundle::{PatchBundle, Payload};
use crate::hook::Hook;
use crate::runtime_config::{RuntimeConfig, DEFAULT_FILE_NAME};
use crate::undo::{self, WrittenFile};
use crate::util;
use crate::version::DetectedVersion;

/// What the config step gets to see of a finished install.
pub struct ConfigContext<'a> {
    pub game_dir: &'a Path,
    pub detected: &'a DetectedVersion,
    pub install_order: &'a [String],
    /// Validated hooks per patch, in install order.
    pub hooks: &'a [(String, Vec<Hook>)],
}

// Implementations report every file they wrote together with its prior
// contents, and undo their own partial work before returning an error.

pub trait PayloadExtractor {
    /// Write the payloads of `order` under `game_dir`.
    fn extract(
        &self,
        bundle: &PatchBundle,
        order: &[String],
        game_dir: &Path,
    ) -> Result<Vec<WrittenFile>>;

    fn remove(&self, bundle: &PatchBundle, patches: &[String], game_dir: &Path) -> Result<()>;
}

pub trait ConfigEmitter {
    fn emit(&self, ctx: &ConfigContext<'_>) -> Result<Vec<WrittenFile>>;

    fn remove(&self, game_dir: &Path) -> Result<()>;
}

pub trait SupportFileInstaller {
    fn install(&self, game_dir: &Path) -> Result<Vec<WrittenFile>>;

    fn remove(&self, game_dir: &Path) -> Result<()>;
}

/// Extracts payload files carried in the bundle.
#[derive(Debug, Default, Clone, Copy)]
pub struct BundlePayloads;

fn payload_target(game_dir: &Path, payload: &Payload) -> Result<PathBuf> {
    let rel = Path::new(&payload.path);
    if payload.path.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("Refusing payload path outside the game directory: {}", payload.path);
    }
    Ok(game_dir.join(rel))
}

fn write_payload(game_dir: &Path, payload: &Payload) -> Result<WrittenFile> {
    let full = payload_target(game_dir, payload)?;
    if util::hash_bytes(&payload.data) != payload.blake3_hash {
        bail!("Hash mismatch for payload: {}", payload.path);
    }
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let written = WrittenFile::capture(&full)?;
    if let Err(e) = std::fs::write(&full, &payload.data) {
        let _ = written.rollback();
        return Err(e).with_context(|| format!("Failed to write file: {}", full.display()));
    }
    Ok(written)
}

/// Undo `written`, then hand back `err`.
fn abandon(written: &[WrittenFile], err: anyhow::Error) -> anyhow::Error {
    if let Err(e) = undo::rollback_files(written) {
        return err.context(format!("cleanup after failure also failed: {e}"));
    }
    err
}

impl PayloadExtractor for BundlePayloads {
    fn extract(
        &self,
        bundle: &PatchBundle,
        order: &[String],
        game_dir: &Path,
    ) -> Result<Vec<WrittenFile>> {
        let mut written = Vec::new();
        for id in order {
            let Some(patch) = bundle.patch(id) else {
                continue;
            };
            for payload in &patch.payloads {
                match write_payload(game_dir, payload) {
                    Ok(file) => {
                        debug!(patch = %id, file = %file.path.display(), "extracted payload");
                        written.push(file);
                    }
                    Err(e) => {
                        let e = e.context(format!("Failed to extract payloads of '{id}'"));
                        return Err(abandon(&written, e));
                    }
                }
            }
        }
        Ok(written)
    }

    fn remove(&self, bundle: &PatchBundle, patches: &[String], game_dir: &Path) -> Result<()> {
        for id in patches {
            let Some(patch) = bundle.patch(id) else {
                continue;
            };
            for payload in &patch.payloads {
                let full = payload_target(game_dir, payload)?;
                util::remove_if_exists(&full)?;
            }
        }
        Ok(())
    }
}

/// Writes a [`RuntimeConfig`] into the game directory.
#[derive(Debug, Clone)]
pub struct RuntimeConfigWriter {
    pub file_name: String,
}

impl Default for RuntimeConfigWriter {
    fn default() -> Self {
        RuntimeConfigWriter {
            file_name: DEFAULT_FILE_NAME.to_string(),
        }
    }
}

impl ConfigEmitter for RuntimeConfigWriter {
    fn emit(&self, ctx: &ConfigContext<'_>) -> Result<Vec<WrittenFile>> {
        let config = RuntimeConfig::build(
            &ctx.detected.version,
            &ctx.detected.hash,
            ctx.install_order,
            ctx.hooks.iter().map(|(id, hooks)| (id.as_str(), hooks.as_slice())),
        );
        let path = ctx.game_dir.join(&self.file_name);
        let written = WrittenFile::capture(&path)?;
        if let Err(e) = config.write(&path) {
            return Err(abandon(std::slice::from_ref(&written), e));
        }
        Ok(vec![written])
    }

    fn remove(&self, game_dir: &Path) -> Result<()> {
        util::remove_if_exists(&game_dir.join(&self.file_name))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSupportFiles;

impl SupportFileInstaller for NoSupportFiles {
    fn install(&self, _game_dir: &Path) -> Result<Vec<WrittenFile>> {
        Ok(Vec::new())
    }

    fn remove(&self, _game_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Copies a fixed list of files (support library, loader) into the game directory.
#[derive(Debug, Clone, Default)]
pub struct CopySupportFiles {
    pub sources: Vec<PathBuf>,
}

impl CopySupportFiles {
    fn target(source: &Path, game_dir: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .with_context(|| format!("Support file has no name: {}", source.display()))?;
        Ok(game_dir.join(name))
    }

    fn copy_one(source: &Path, game_dir: &Path, copied: &mut Vec<WrittenFile>) -> Result<()> {
        let target = Self::target(source, game_dir)?;
        if !source.is_file() {
            bail!("Support file not found: {}", source.display());
        }
        let written = WrittenFile::capture(&target)?;
        let result = std::fs::copy(source, &target);
        // Even a failed copy may have truncated the target.
        copied.push(written);
        result.with_context(|| {
            format!(
                "Failed to copy support file {} to {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(())
    }
}

impl SupportFileInstaller for CopySupportFiles {
    fn install(&self, game_dir: &Path) -> Result<Vec<WrittenFile>> {
        let mut copied = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            if let Err(e) = Self::copy_one(source, game_dir, &mut copied) {
                return Err(abandon(&copied, e));
            }
        }
        Ok(copied)
    }

    fn remove(&self, game_dir: &Path) -> Result<()> {
        for source in &self.sources {
            util::remove_if_exists(&Self::target(source, game_dir)?)?;
        }
        Ok(())
    }
}
