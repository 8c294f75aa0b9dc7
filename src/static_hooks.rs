//! Read-verify-write application of Static hooks to the executable file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::address;
use crate::error::{Error, Result};
use crate::hook::{BytePatch, Hook};
use crate::layout::{self, LayoutInfo};

/// A failed batch, with the hooks that were already written before the
/// failing one. Those writes are left in place.
#[derive(Debug)]
pub struct BatchFailure {
    pub written: Vec<BytePatch>,
    pub error: Error,
}

/// Apply every Static hook in `hooks`, in order, to the file at `path`.
///
/// The layout is parsed once so that every hook is checked against the same
/// snapshot. A hook whose on-disk bytes differ from its original bytes fails
/// without writing; earlier writes in the batch are not undone here.
pub fn apply_static_hooks(
    path: &Path,
    hooks: &[Hook],
) -> std::result::Result<Vec<BytePatch>, BatchFailure> {
    let statics: Vec<&BytePatch> = hooks.iter().filter_map(Hook::as_static).collect();
    if statics.is_empty() {
        return Ok(Vec::new());
    }

    let mut written = Vec::with_capacity(statics.len());
    let fail = |written: Vec<BytePatch>, error: Error| BatchFailure { written, error };

    let layout = match layout::read_layout(path) {
        Ok(l) => l,
        Err(e) => return Err(fail(written, e)),
    };
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) => return Err(fail(written, Error::io(path, e))),
    };

    for patch in statics {
        let result = swap_bytes(
            &mut file,
            path,
            &layout,
            patch.address,
            &patch.original,
            &patch.replacement,
        );
        if let Err(e) = result {
            return Err(fail(written, e));
        }
        debug!("wrote static hook at {:#010X}", patch.address);
        written.push(patch.clone());
    }

    if let Err(e) = file.sync_all() {
        return Err(fail(written, Error::io(path, e)));
    }
    info!(path = %path.display(), count = written.len(), "applied static hooks");
    Ok(written)
}

/// Write the original bytes of already-applied hooks back, newest first.
///
/// Each hook is verified to still hold its replacement bytes before the
/// original bytes are restored, so a revert never clobbers unrelated data.
pub fn revert_static_hooks(path: &Path, applied: &[BytePatch]) -> Result<()> {
    if applied.is_empty() {
        return Ok(());
    }

    let layout = layout::read_layout(path)?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;

    for patch in applied.iter().rev() {
        swap_bytes(
            &mut file,
            path,
            &layout,
            patch.address,
            &patch.replacement,
            &patch.original,
        )?;
        debug!("reverted static hook at {:#010X}", patch.address);
    }
    file.sync_all().map_err(|e| Error::io(path, e))
}

/// Check which of `hooks` currently hold their replacement bytes on disk.
pub fn applied_static_hooks(path: &Path, hooks: &[Hook]) -> Result<Vec<u32>> {
    let layout = layout::read_layout(path)?;
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;

    let mut applied = Vec::new();
    for patch in hooks.iter().filter_map(Hook::as_static) {
        let offset =
            address::resolve_span(&layout, patch.address as u64, patch.replacement.len())?;
        let current = read_at(&mut file, path, offset, patch.replacement.len())?;
        if current == patch.replacement {
            applied.push(patch.address);
        }
    }
    Ok(applied)
}

fn swap_bytes(
    file: &mut File,
    path: &Path,
    layout: &LayoutInfo,
    address: u32,
    expected: &[u8],
    replacement: &[u8],
) -> Result<()> {
    let offset = address::resolve_span(layout, address as u64, expected.len())?;

    let found = read_at(file, path, offset, expected.len())?;
    if found != expected {
        return Err(Error::VerificationMismatch {
            address,
            offset,
            expected: expected.to_vec(),
            found,
        });
    }

    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    file.write_all(replacement).map_err(|e| Error::io(path, e))
}

fn read_at(file: &mut File, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).map_err(|e| Error::io(path, e))?;
    Ok(buf)
}
