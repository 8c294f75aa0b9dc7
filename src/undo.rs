//! Compensating actions pushed by destructive install steps and run in
//! reverse order when a later step fails.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::backup::{self, BackupRecord};
use crate::error::{Error, Result};
use crate::hook::BytePatch;
use crate::static_hooks;
use crate::util;

/// A file written by an install step, with whatever sat at its path before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    /// Prior contents; `None` when the step created the file.
    pub previous: Option<Vec<u8>>,
}

impl WrittenFile {
    /// Snapshot `path` before it gets overwritten.
    pub fn capture(path: &Path) -> Result<Self> {
        let previous = match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(path, e)),
        };
        Ok(WrittenFile {
            path: path.to_path_buf(),
            previous,
        })
    }

    /// Put back the prior contents, or delete the file if there were none.
    pub fn rollback(&self) -> Result<()> {
        match &self.previous {
            Some(bytes) => {
                debug!(file = %self.path.display(), "restoring overwritten file");
                std::fs::write(&self.path, bytes).map_err(|e| Error::io(&self.path, e))
            }
            None => util::remove_if_exists(&self.path),
        }
    }
}

/// Roll back `files` newest first. Every file is attempted; the first error
/// is returned.
pub fn rollback_files(files: &[WrittenFile]) -> Result<()> {
    let mut first_err = None;
    for file in files.iter().rev() {
        if let Err(e) = file.rollback() {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[derive(Debug, Clone)]
pub enum UndoAction {
    RestoreBackup { record: BackupRecord, verify: bool },
    RevertStaticHooks { path: PathBuf, hooks: Vec<BytePatch> },
    RollbackFiles { files: Vec<WrittenFile> },
}

impl UndoAction {
    pub fn describe(&self) -> String {
        match self {
            UndoAction::RestoreBackup { record, .. } => {
                format!("restore backup {}", record.backup_path.display())
            }
            UndoAction::RevertStaticHooks { hooks, .. } => {
                format!("revert {} static hook(s)", hooks.len())
            }
            UndoAction::RollbackFiles { files } => format!("roll back {} file(s)", files.len()),
        }
    }

    pub fn run(&self) -> Result<()> {
        match self {
            UndoAction::RestoreBackup { record, verify } => backup::restore_backup(record, *verify),
            UndoAction::RevertStaticHooks { path, hooks } => {
                static_hooks::revert_static_hooks(path, hooks)
            }
            UndoAction::RollbackFiles { files } => rollback_files(files),
        }
    }
}

#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, newest first. Failures are reported through `log`
    /// and never stop the remaining actions. Returns whether all succeeded.
    pub fn unwind(&mut self, mut log: impl FnMut(String)) -> bool {
        let mut clean = true;
        while let Some(action) = self.actions.pop() {
            let what = action.describe();
            match action.run() {
                Ok(()) => log(format!("Rollback: {what}")),
                Err(e) => {
                    clean = false;
                    warn!(error = %e, "rollback step failed: {what}");
                    log(format!("Rollback step failed ({what}): {e}"));
                }
            }
        }
        clean
    }

    /// Forget all actions; called once the install has committed.
    pub fn commit(&mut self) {
        self.actions.clear();
    }
}
