//! Install and removal pipelines.
//!
//! An install walks a fixed sequence of steps. Every destructive step pushes
//! a compensating action; if any later step fails, those actions run in
//! reverse and the original error is what the caller sees.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::backup::{self, BackupRecord};
use crate::bundle::{PatchBundle, PatchDefinition};
use crate::collaborators::{
    BundlePayloads, ConfigContext, ConfigEmitter, NoSupportFiles, PayloadExtractor,
    RuntimeConfigWriter, SupportFileInstaller,
};
use crate::error::{DependencyError, Error, Result};
use crate::hook::{self, Hook};
use crate::layout;
use crate::resolver;
use crate::static_hooks::{self, BatchFailure};
use crate::undo::{UndoAction, UndoStack};
use crate::version::{self, DetectedVersion, VersionProvider};

/// Pipeline steps, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallState {
    Idle,
    Validating,
    DetectingVersion,
    ResolvingPatches,
    CreatingBackup,
    ApplyingStaticHooks,
    ExtractingPayloads,
    GeneratingConfig,
    InstallingSupportFiles,
    Done,
    Failed,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallState::Idle => "idle",
            InstallState::Validating => "validating",
            InstallState::DetectingVersion => "detecting version",
            InstallState::ResolvingPatches => "resolving patches",
            InstallState::CreatingBackup => "creating backup",
            InstallState::ApplyingStaticHooks => "applying static hooks",
            InstallState::ExtractingPayloads => "extracting payloads",
            InstallState::GeneratingConfig => "generating config",
            InstallState::InstallingSupportFiles => "installing support files",
            InstallState::Done => "done",
            InstallState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    /// Without a backup, a failure after hooks start landing has no full
    /// recovery path.
    pub create_backup: bool,
    pub verify_restore: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        InstallOptions {
            create_backup: true,
            verify_restore: true,
        }
    }
}

pub struct InstallRequest<'a> {
    pub executable: &'a Path,
    /// Where payloads, config and support files go. Defaults to the
    /// executable's directory.
    pub game_dir: Option<&'a Path>,
    pub bundle: &'a PatchBundle,
    pub selected: &'a [String],
    pub options: InstallOptions,
}

#[derive(Debug, Clone)]
pub struct InstallResult {
    pub success: bool,
    /// `Done` on success, `Failed` otherwise.
    pub state: InstallState,
    pub failed_step: Option<InstallState>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub messages: Vec<String>,
    pub backup: Option<BackupRecord>,
    pub detected_version: Option<DetectedVersion>,
    pub install_order: Vec<String>,
    pub installed_patches: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOptions {
    pub verify: bool,
    pub delete_backup: bool,
}

impl Default for RemovalOptions {
    fn default() -> Self {
        RemovalOptions {
            verify: true,
            delete_backup: false,
        }
    }
}

pub struct RemovalRequest<'a> {
    pub executable: &'a Path,
    pub game_dir: Option<&'a Path>,
    /// Needed to know which payload files belong to the removed patches.
    pub bundle: Option<&'a PatchBundle>,
    pub options: RemovalOptions,
}

#[derive(Debug, Clone)]
pub struct RemovalResult {
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub messages: Vec<String>,
    pub backup: Option<BackupRecord>,
    pub detected_version: Option<DetectedVersion>,
    pub removed_patches: Vec<String>,
}

fn default_game_dir(executable: &Path) -> PathBuf {
    match executable.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn patch<'a>(bundle: &'a PatchBundle, id: &str) -> Result<&'a PatchDefinition> {
    bundle
        .patch(id)
        .ok_or_else(|| DependencyError::UnknownPatch(id.to_string()).into())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Mutable state of one install call.
struct Run {
    state: InstallState,
    messages: Vec<String>,
    undo: UndoStack,
    backup: Option<BackupRecord>,
    detected: Option<DetectedVersion>,
    order: Vec<String>,
}

impl Run {
    fn new() -> Self {
        Run {
            state: InstallState::Idle,
            messages: Vec::new(),
            undo: UndoStack::new(),
            backup: None,
            detected: None,
            order: Vec::new(),
        }
    }

    fn enter(&mut self, state: InstallState) {
        self.state = state;
        self.log(format!("Step: {state}"));
    }

    fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.messages.push(message);
    }
}

pub struct Installer {
    versions: Box<dyn VersionProvider>,
    payloads: Box<dyn PayloadExtractor>,
    config: Box<dyn ConfigEmitter>,
    support: Box<dyn SupportFileInstaller>,
}

impl Installer {
    /// An installer with the stock collaborators: bundle payloads, the
    /// runtime config writer and no support files.
    pub fn new(versions: impl VersionProvider + 'static) -> Self {
        Installer {
            versions: Box::new(versions),
            payloads: Box::new(BundlePayloads),
            config: Box::new(RuntimeConfigWriter::default()),
            support: Box::new(NoSupportFiles),
        }
    }

    pub fn with_payloads(mut self, payloads: impl PayloadExtractor + 'static) -> Self {
        self.payloads = Box::new(payloads);
        self
    }

    pub fn with_config(mut self, config: impl ConfigEmitter + 'static) -> Self {
        self.config = Box::new(config);
        self
    }

    pub fn with_support_files(mut self, support: impl SupportFileInstaller + 'static) -> Self {
        self.support = Box::new(support);
        self
    }

    pub fn install(&self, request: &InstallRequest<'_>) -> InstallResult {
        let mut run = Run::new();
        info!(
            executable = %request.executable.display(),
            patches = ?request.selected,
            "starting install"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_install(request, &mut run)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some((e.category(), e.to_string())),
            Err(payload) => Some(("UnexpectedFault", panic_message(payload))),
        };

        let Some((kind, message)) = failure else {
            run.log("Install complete");
            return InstallResult {
                success: true,
                state: InstallState::Done,
                failed_step: None,
                error: None,
                error_kind: None,
                messages: run.messages,
                backup: run.backup,
                detected_version: run.detected,
                installed_patches: run.order.clone(),
                install_order: run.order,
            };
        };

        let failed_step = run.state;
        error!(step = %failed_step, kind, "install failed: {message}");
        run.state = InstallState::Failed;
        run.messages.push(format!("Failed while {failed_step}: {message}"));

        if run.backup.is_none() && failed_step >= InstallState::ApplyingStaticHooks {
            warn!("no backup was taken; the executable may be partially modified");
            run.messages
                .push("No backup was taken; the executable may be partially modified".to_string());
        }
        let messages = &mut run.messages;
        let restored = run.undo.unwind(|line| messages.push(line));

        // The executable is back to its pre-install state, so the kept backup
        // no longer stands for any installed patch.
        if let (true, Some(record)) = (restored, run.backup.as_mut()) {
            record.patches.clear();
            let kept = format!("Backup {} kept", record.backup_path.display());
            match backup::save_record(record) {
                Ok(()) => run.messages.push(format!("{kept}; it lists no installed patches")),
                Err(e) => {
                    warn!(error = %e, "could not update backup record");
                    run.messages
                        .push(format!("{kept}; its record still lists the failed patches: {e}"));
                }
            }
        }

        InstallResult {
            success: false,
            state: InstallState::Failed,
            failed_step: Some(failed_step),
            error: Some(message),
            error_kind: Some(kind),
            messages: run.messages,
            backup: run.backup,
            detected_version: run.detected,
            install_order: run.order,
            installed_patches: Vec::new(),
        }
    }

    fn run_install(&self, request: &InstallRequest<'_>, run: &mut Run) -> Result<()> {
        let exe = request.executable;
        let bundle = request.bundle;
        let selected = request.selected;
        let game_dir = request
            .game_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_game_dir(exe));

        run.enter(InstallState::Validating);
        if selected.is_empty() {
            return Err(Error::InvalidRequest("no patches selected".to_string()));
        }
        let mut seen = HashSet::new();
        for id in selected {
            if !seen.insert(id.as_str()) {
                return Err(Error::InvalidRequest(format!("patch '{id}' selected twice")));
            }
            patch(bundle, id)?.manifest.validate()?;
        }
        let meta = std::fs::metadata(exe).map_err(|e| Error::io(exe, e))?;
        if !meta.is_file() {
            return Err(Error::InvalidRequest(format!(
                "{} is not a file",
                exe.display()
            )));
        }
        let layout = layout::read_layout(exe)?;
        run.log(format!(
            "Executable {:?}, image base {:#X}, {} sections",
            layout.bitness,
            layout.image_base,
            layout.sections.len()
        ));

        run.enter(InstallState::DetectingVersion);
        let detected = version::detect_version(exe, self.versions.as_ref())?;
        run.log(format!(
            "Detected version {} ({})",
            detected.version.id, detected.version.name
        ));
        run.detected = Some(detected.clone());
        for id in selected {
            let manifest = &patch(bundle, id)?.manifest;
            if !manifest.supports_version(&detected.version, &detected.hash) {
                return Err(Error::UnsupportedVersion(format!(
                    "patch '{id}' does not support version {}",
                    detected.version.id
                )));
            }
        }

        run.enter(InstallState::ResolvingPatches);
        let manifests = bundle.manifests();
        resolver::validate_dependencies(&manifests, selected)?;
        resolver::validate_no_conflicts(&manifests, selected)?;
        resolver::detect_circular_dependencies(&manifests, selected)?;
        let order = resolver::calculate_install_order(&manifests, selected)?;
        run.log(format!("Install order: {}", order.join(", ")));
        run.order = order.clone();

        let mut hook_sets: Vec<(String, Vec<Hook>)> = Vec::with_capacity(order.len());
        for id in &order {
            let raw = patch(bundle, id)?.hooks_for(&detected.hash);
            hook_sets.push((id.clone(), hook::validate_all(raw)?));
        }
        hook::check_collisions(
            hook_sets
                .iter()
                .map(|(id, hooks)| (id.as_str(), hooks.as_slice())),
        )?;
        let all_hooks: Vec<Hook> = hook_sets
            .iter()
            .flat_map(|(_, hooks)| hooks.iter().cloned())
            .collect();
        let static_count = all_hooks.iter().filter(|h| h.as_static().is_some()).count();
        run.log(format!(
            "{} hook(s), {static_count} static",
            all_hooks.len()
        ));

        run.enter(InstallState::CreatingBackup);
        if request.options.create_backup {
            let record = backup::create_backup(exe, Some(&detected.version), &order)?;
            run.log(format!("Backup: {}", record.backup_path.display()));
            run.undo.push(UndoAction::RestoreBackup {
                record: record.clone(),
                verify: request.options.verify_restore,
            });
            run.backup = Some(record);
        } else {
            warn!("backup disabled by caller");
            run.log("Backup skipped");
        }

        run.enter(InstallState::ApplyingStaticHooks);
        match static_hooks::apply_static_hooks(exe, &all_hooks) {
            Ok(written) => {
                run.log(format!("Wrote {} static hook(s)", written.len()));
                self.track_written(run, exe, written);
            }
            Err(BatchFailure { written, error }) => {
                if !written.is_empty() {
                    run.log(format!(
                        "{} static hook(s) were written before the failure",
                        written.len()
                    ));
                }
                self.track_written(run, exe, written);
                return Err(error);
            }
        }

        run.enter(InstallState::ExtractingPayloads);
        let files = self
            .payloads
            .extract(bundle, &order, &game_dir)
            .map_err(|e| Error::collaborator("payload extraction", e))?;
        run.log(format!("Extracted {} payload file(s)", files.len()));
        run.undo.push(UndoAction::RollbackFiles { files });

        run.enter(InstallState::GeneratingConfig);
        let ctx = ConfigContext {
            game_dir: &game_dir,
            detected: &detected,
            install_order: &order,
            hooks: &hook_sets,
        };
        let files = self
            .config
            .emit(&ctx)
            .map_err(|e| Error::collaborator("config generation", e))?;
        run.log(format!("Wrote {} config file(s)", files.len()));
        run.undo.push(UndoAction::RollbackFiles { files });

        run.enter(InstallState::InstallingSupportFiles);
        let files = self
            .support
            .install(&game_dir)
            .map_err(|e| Error::collaborator("support file installation", e))?;
        run.log(format!("Installed {} support file(s)", files.len()));
        run.undo.push(UndoAction::RollbackFiles { files });

        run.undo.commit();
        run.enter(InstallState::Done);
        Ok(())
    }

    /// With a backup the restore covers these writes; without one, revert
    /// them hook by hook.
    fn track_written(&self, run: &mut Run, exe: &Path, written: Vec<hook::BytePatch>) {
        if run.backup.is_none() && !written.is_empty() {
            run.undo.push(UndoAction::RevertStaticHooks {
                path: exe.to_path_buf(),
                hooks: written,
            });
        }
    }

    /// Restore the newest backup and remove everything the install added.
    pub fn remove(&self, request: &RemovalRequest<'_>) -> RemovalResult {
        let mut messages = Vec::new();
        let mut log = |message: String| {
            info!("{message}");
            messages.push(message);
        };

        let mut result = RemovalResult {
            success: false,
            error: None,
            error_kind: None,
            messages: Vec::new(),
            backup: None,
            detected_version: None,
            removed_patches: Vec::new(),
        };

        let outcome = self.run_removal(request, &mut result, &mut log);
        if let Err(e) = outcome {
            error!(kind = e.category(), "removal failed: {e}");
            log(format!("Removal failed: {e}"));
            result.error_kind = Some(e.category());
            result.error = Some(e.to_string());
        } else {
            log("Removal complete".to_string());
            result.success = true;
        }
        result.messages = messages;
        result
    }

    fn run_removal(
        &self,
        request: &RemovalRequest<'_>,
        result: &mut RemovalResult,
        log: &mut impl FnMut(String),
    ) -> Result<()> {
        let exe = request.executable;
        let game_dir = request
            .game_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_game_dir(exe));

        let record = backup::find_latest_backup(exe)?.ok_or_else(|| {
            Error::InvalidRequest(format!("no backup found for {}", exe.display()))
        })?;
        log(format!("Using backup {}", record.backup_path.display()));
        result.backup = Some(record.clone());

        backup::restore_backup(&record, request.options.verify)?;
        log(format!("Restored {}", exe.display()));

        if let Ok(detected) = version::detect_version(exe, self.versions.as_ref()) {
            log(format!("Executable is version {}", detected.version.id));
            result.detected_version = Some(detected);
        }

        match request.bundle {
            Some(bundle) => self
                .payloads
                .remove(bundle, &record.patches, &game_dir)
                .map_err(|e| Error::collaborator("payload removal", e))?,
            None => log("No bundle given; payload files left in place".to_string()),
        }
        self.config
            .remove(&game_dir)
            .map_err(|e| Error::collaborator("config removal", e))?;
        self.support
            .remove(&game_dir)
            .map_err(|e| Error::collaborator("support file removal", e))?;
        result.removed_patches = record.patches.clone();
        log(format!("Removed patches: {}", record.patches.join(", ")));

        if request.options.delete_backup {
            backup::delete_backup(&record)?;
            log(format!("Deleted backup {}", record.backup_path.display()));
        }
        Ok(())
    }
}
