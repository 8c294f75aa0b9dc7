//! Config artifact handed to the launcher: the install order and the hooks
//! that are applied at runtime rather than written into the executable.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::hook::{Hook, RawHook};
use crate::version::GameVersion;

pub const MAGIC: &[u8; 8] = b"HKCFGV01";
pub const FORMAT_VERSION: u32 = 1;
pub const DEFAULT_FILE_NAME: &str = "hookinstall.cfg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHook {
    pub patch: String,
    pub hook: RawHook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub version: u32,
    pub game_version: GameVersion,
    pub executable_hash: String,
    pub install_order: Vec<String>,
    pub hooks: Vec<RuntimeHook>,
}

impl RuntimeConfig {
    /// Collect the non-static hooks of each patch, in install order.
    pub fn build<'a, I>(
        game_version: &GameVersion,
        executable_hash: &str,
        install_order: &[String],
        hooks: I,
    ) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [Hook])>,
    {
        let hooks = hooks
            .into_iter()
            .flat_map(|(patch, hooks)| {
                hooks
                    .iter()
                    .filter(|h| h.as_static().is_none())
                    .map(move |h| RuntimeHook {
                        patch: patch.to_string(),
                        hook: RawHook::from(h),
                    })
            })
            .collect();

        RuntimeConfig {
            version: FORMAT_VERSION,
            game_version: game_version.clone(),
            executable_hash: executable_hash.to_string(),
            install_order: install_order.to_vec(),
            hooks,
        }
    }

    pub fn write(&self, output: &Path) -> Result<()> {
        let encoded = bincode::serialize(self).context("Failed to serialize runtime config")?;
        let compressed =
            zstd::bulk::compress(&encoded, 3).context("Failed to compress runtime config")?;

        let mut file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create config file: {}", output.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(&compressed)?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
            bail!("Invalid runtime config: missing magic header");
        }

        let decoder =
            zstd::Decoder::new(&raw[MAGIC.len()..]).context("Failed to create zstd decoder")?;
        let config: RuntimeConfig =
            bincode::deserialize_from(decoder).context("Failed to deserialize runtime config")?;
        if config.version != FORMAT_VERSION {
            bail!(
                "Unsupported config version: {} (expected {})",
                config.version,
                FORMAT_VERSION
            );
        }
        Ok(config)
    }
}
