//! Point-in-time copies of the executable, each with a sidecar record that
//! carries the content hash needed to verify it before restoring.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::util;
use crate::version::GameVersion;

pub const SIDECAR_MAGIC: &[u8; 8] = b"HKBAKV01";
pub const SIDECAR_EXTENSION: &str = "meta";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    /// Uppercase hex BLAKE3 of the backed-up bytes.
    pub hash: String,
    pub size: u64,
    pub created_at: NaiveDateTime,
    pub version: Option<GameVersion>,
    /// Patches that were being installed when the backup was taken.
    pub patches: Vec<String>,
}

impl BackupRecord {
    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_path(&self.backup_path)
    }
}

pub fn sidecar_path(backup: &Path) -> PathBuf {
    let mut name = backup.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

fn backup_prefix(original: &Path) -> Result<String> {
    let name = original
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::io(
                original,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no UTF-8 file name"),
            )
        })?;
    Ok(format!("{name}.backup."))
}

/// Copy `path` to `<name>.backup.<timestamp>` next to it and write the
/// sidecar record. Fails if a backup with the same timestamp exists.
pub fn create_backup(
    path: &Path,
    version: Option<&GameVersion>,
    patches: &[String],
) -> Result<BackupRecord> {
    create_backup_at(path, Local::now().naive_local(), version, patches)
}

pub(crate) fn create_backup_at(
    path: &Path,
    now: NaiveDateTime,
    version: Option<&GameVersion>,
    patches: &[String],
) -> Result<BackupRecord> {
    let created_at = now.with_nanosecond(0).unwrap_or(now);
    let stamp = created_at.format(TIMESTAMP_FORMAT).to_string();
    let backup_path = path.with_file_name(format!("{}{stamp}", backup_prefix(path)?));

    let hash = util::hash_file_hex(path)?;
    let size = std::fs::metadata(path)
        .map_err(|e| Error::io(path, e))?
        .len();

    let mut source = File::open(path).map_err(|e| Error::io(path, e))?;
    let dest = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&backup_path)
        .map_err(|e| Error::io(&backup_path, e))?;

    // From here on the backup file is ours; nothing half-written may stay
    // behind, or it would be picked up as the newest backup.
    let record = BackupRecord {
        original_path: path.to_path_buf(),
        backup_path,
        hash,
        size,
        created_at,
        version: version.cloned(),
        patches: patches.to_vec(),
    };
    if let Err(e) = fill_backup(&mut source, dest, &record).and_then(|()| save_record(&record)) {
        warn!(backup = %record.backup_path.display(), error = %e, "discarding incomplete backup");
        let _ = util::remove_if_exists(&record.backup_path);
        let _ = util::remove_if_exists(&record.sidecar_path());
        return Err(e);
    }

    info!(backup = %record.backup_path.display(), size, "created backup");
    Ok(record)
}

fn fill_backup(source: &mut File, mut dest: File, record: &BackupRecord) -> Result<()> {
    let path = &record.backup_path;
    std::io::copy(source, &mut dest).map_err(|e| Error::io(path, e))?;
    dest.sync_all().map_err(|e| Error::io(path, e))?;
    drop(dest);

    let copied = util::hash_file_hex(path)?;
    if copied != record.hash {
        return Err(Error::Integrity {
            path: path.clone(),
            expected: record.hash.clone(),
            actual: copied,
        });
    }
    Ok(())
}

/// Write the sidecar record beside the backup file.
pub fn save_record(record: &BackupRecord) -> Result<()> {
    let path = record.sidecar_path();
    let encoded = bincode::serialize(record).map_err(|e| {
        Error::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;

    let mut file = File::create(&path).map_err(|e| Error::io(&path, e))?;
    file.write_all(SIDECAR_MAGIC)
        .map_err(|e| Error::io(&path, e))?;
    file.write_all(&encoded).map_err(|e| Error::io(&path, e))?;
    file.flush().map_err(|e| Error::io(&path, e))
}

/// Read the sidecar record that belongs to `backup`.
pub fn load_record(backup: &Path) -> Result<BackupRecord> {
    let path = sidecar_path(backup);
    let raw = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
    let invalid = |msg: String| {
        Error::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
    };

    if raw.len() < SIDECAR_MAGIC.len() || &raw[..SIDECAR_MAGIC.len()] != SIDECAR_MAGIC {
        return Err(invalid("missing backup record header".to_string()));
    }
    bincode::deserialize(&raw[SIDECAR_MAGIC.len()..])
        .map_err(|e| invalid(format!("corrupt backup record: {e}")))
}

/// Recompute the backup's digest and compare it to the recorded one.
pub fn verify_backup(record: &BackupRecord) -> Result<()> {
    let actual = util::hash_file_hex(&record.backup_path)?;
    if !actual.eq_ignore_ascii_case(&record.hash) {
        return Err(Error::Integrity {
            path: record.backup_path.clone(),
            expected: record.hash.clone(),
            actual,
        });
    }
    debug!(backup = %record.backup_path.display(), "backup integrity verified");
    Ok(())
}

/// Copy the backup back over the original file. With `verify`, the backup's
/// digest is checked first and the original is left alone on mismatch.
pub fn restore_backup(record: &BackupRecord, verify: bool) -> Result<()> {
    if verify {
        verify_backup(record)?;
    }
    std::fs::copy(&record.backup_path, &record.original_path)
        .map_err(|e| Error::io(&record.original_path, e))?;
    info!(
        original = %record.original_path.display(),
        backup = %record.backup_path.display(),
        "restored backup"
    );
    Ok(())
}

/// Backups of `path` found next to it, oldest first. Sidecars are skipped.
pub fn list_backups(path: &Path) -> Result<Vec<PathBuf>> {
    Ok(dated_backups(path)?.into_iter().map(|(_, p)| p).collect())
}

fn dated_backups(path: &Path) -> Result<Vec<(NaiveDateTime, PathBuf)>> {
    let prefix = backup_prefix(path)?;
    let mut found: Vec<(NaiveDateTime, PathBuf)> = util::sibling_files(path)?
        .into_iter()
        .filter_map(|candidate| {
            let name = candidate.file_name()?.to_str()?;
            let stamp = name.strip_prefix(&prefix)?;
            let created = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
            Some((created, candidate))
        })
        .collect();
    found.sort();
    Ok(found)
}

/// The newest backup of `path`, if any. Without a sidecar, a minimal record
/// is rebuilt by hashing the backup file.
pub fn find_latest_backup(path: &Path) -> Result<Option<BackupRecord>> {
    let Some((created_at, backup_path)) = dated_backups(path)?.pop() else {
        return Ok(None);
    };

    if sidecar_path(&backup_path).exists() {
        return load_record(&backup_path).map(Some);
    }

    warn!(backup = %backup_path.display(), "backup has no record; rebuilding from file");
    let hash = util::hash_file_hex(&backup_path)?;
    let size = std::fs::metadata(&backup_path)
        .map_err(|e| Error::io(&backup_path, e))?
        .len();
    Ok(Some(BackupRecord {
        original_path: path.to_path_buf(),
        backup_path,
        hash,
        size,
        created_at,
        version: None,
        patches: Vec::new(),
    }))
}

/// Remove the backup file and its sidecar. Missing files are fine.
pub fn delete_backup(record: &BackupRecord) -> Result<()> {
    let file = util::remove_if_exists(&record.backup_path);
    let sidecar = util::remove_if_exists(&record.sidecar_path());
    file.and(sidecar)
}
