mod common;

use std::fs;
use std::path::Path;

use common::*;
use hookinstall::backup;
use hookinstall::bundle::{PatchBundle, PatchDefinition};
use hookinstall::collaborators::{ConfigContext, ConfigEmitter, CopySupportFiles};
use hookinstall::hook::{HookKind, RawHook};
use hookinstall::manifest::Manifest;
use hookinstall::runtime_config::{RuntimeConfig, DEFAULT_FILE_NAME};
use hookinstall::undo::WrittenFile;
use hookinstall::util;
use hookinstall::version::GameVersion;
use hookinstall::{
    InstallOptions, InstallRequest, InstallResult, InstallState, Installer, RemovalOptions,
    RemovalRequest,
};

fn install(
    installer: &Installer,
    exe: &Path,
    bundle: &PatchBundle,
    selected: &[&str],
    options: InstallOptions,
) -> InstallResult {
    let selected = ids(selected);
    installer.install(&InstallRequest {
        executable: exe,
        game_dir: None,
        bundle,
        selected: &selected,
        options,
    })
}

struct FailingConfig;

impl ConfigEmitter for FailingConfig {
    fn emit(&self, _ctx: &ConfigContext<'_>) -> anyhow::Result<Vec<WrittenFile>> {
        anyhow::bail!("disk full")
    }

    fn remove(&self, _game_dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

struct PanickingConfig;

impl ConfigEmitter for PanickingConfig {
    fn emit(&self, _ctx: &ConfigContext<'_>) -> anyhow::Result<Vec<WrittenFile>> {
        panic!("config writer exploded")
    }

    fn remove(&self, _game_dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_install_then_remove() {
    let (dir, exe) = game("install_remove");
    let original = fs::read(&exe).unwrap();
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["uncap", "core"], InstallOptions::default());
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.state, InstallState::Done);
    assert_eq!(result.install_order, ids(&["core", "uncap"]));
    assert_eq!(result.installed_patches, ids(&["core", "uncap"]));
    assert_eq!(result.detected_version.as_ref().unwrap().version.id, "1.9.32");
    assert!(result.messages.iter().any(|m| m == "Install complete"));

    let patched = fs::read(&exe).unwrap();
    assert_eq!(&patched[JUMP_OFFSET..JUMP_OFFSET + 2], &[0xEB, 0x05]);
    assert_eq!(&patched[CAP_OFFSET..CAP_OFFSET + 4], &250u32.to_le_bytes());
    let changed = patched.iter().zip(&original).filter(|(a, b)| a != b).count();
    assert_eq!(changed, 2);

    assert_eq!(fs::read(dir.join("core.dll")).unwrap(), b"MZ core");
    assert_eq!(fs::read(dir.join("Data/uncap.ini")).unwrap(), b"cap=250");

    let config = RuntimeConfig::load(&dir.join(DEFAULT_FILE_NAME)).unwrap();
    assert_eq!(config.install_order, ids(&["core", "uncap"]));
    assert_eq!(config.hooks.len(), 1);
    assert_eq!(config.hooks[0].patch, "uncap");
    assert_eq!(config.hooks[0].hook.kind, HookKind::Detour);

    let record = result.backup.unwrap();
    assert_eq!(record.patches, ids(&["core", "uncap"]));
    assert_eq!(fs::read(&record.backup_path).unwrap(), original);

    let removal = installer.remove(&RemovalRequest {
        executable: &exe,
        game_dir: None,
        bundle: Some(&bundle),
        options: RemovalOptions::default(),
    });
    assert!(removal.success, "{:?}", removal.error);
    assert_eq!(removal.removed_patches, ids(&["core", "uncap"]));
    assert_eq!(fs::read(&exe).unwrap(), original);
    assert!(!dir.join("core.dll").exists());
    assert!(!dir.join("Data/uncap.ini").exists());
    assert!(!dir.join(DEFAULT_FILE_NAME).exists());
    assert!(record.backup_path.exists());

    cleanup(&dir);
}

#[test]
fn test_conflict_fails_before_any_backup() {
    let (dir, exe) = game("conflict");
    let original = fs::read(&exe).unwrap();
    let bundle = PatchBundle::new()
        .with_version(&util::hash_file_hex(&exe).unwrap(), GameVersion::new("1.0", "Retail"))
        .with_patch(PatchDefinition::new(Manifest::new("a").conflicts(&["b"])))
        .with_patch(PatchDefinition::new(Manifest::new("b")));
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["a", "b"], InstallOptions::default());
    assert!(!result.success);
    assert_eq!(result.state, InstallState::Failed);
    assert_eq!(result.failed_step, Some(InstallState::ResolvingPatches));
    assert_eq!(result.error_kind, Some("DependencyError"));
    assert!(result.error.unwrap().contains("conflicts"));
    assert!(result.backup.is_none());
    assert!(backup_files(&exe).is_empty());
    assert_eq!(fs::read(&exe).unwrap(), original);

    cleanup(&dir);
}

#[test]
fn test_mismatch_restores_backup() {
    let (dir, exe) = game("mismatch_restore");
    let original = fs::read(&exe).unwrap();
    let hash = util::hash_file_hex(&exe).unwrap();
    let bundle = PatchBundle::new()
        .with_version(&hash, GameVersion::new("1.0", "Retail"))
        .with_patch(PatchDefinition::new(Manifest::new("p")).with_hooks(
            &hash,
            vec![
                RawHook::bytes(HookKind::Static, JUMP_ADDR, &[0x74, 0x05], &[0xEB, 0x05]),
                RawHook::bytes(HookKind::Static, CAP_ADDR, &[0xAA, 0xBB], &[0x00, 0x00]),
            ],
        ));
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["p"], InstallOptions::default());
    assert!(!result.success);
    assert_eq!(result.failed_step, Some(InstallState::ApplyingStaticHooks));
    assert_eq!(result.error_kind, Some("VerificationMismatchError"));
    assert!(result.messages.iter().any(|m| m.starts_with("Rollback: restore backup")));
    assert_eq!(fs::read(&exe).unwrap(), original);

    // The kept backup no longer claims the patch that never went in.
    let record = result.backup.unwrap();
    assert!(backup::load_record(&record.backup_path).unwrap().patches.is_empty());
    let removal = installer.remove(&RemovalRequest {
        executable: &exe,
        game_dir: None,
        bundle: Some(&bundle),
        options: RemovalOptions::default(),
    });
    assert!(removal.success, "{:?}", removal.error);
    assert!(removal.removed_patches.is_empty());

    cleanup(&dir);
}

#[test]
fn test_mismatch_without_backup_reverts_written_hooks() {
    let (dir, exe) = game("mismatch_revert");
    let original = fs::read(&exe).unwrap();
    let hash = util::hash_file_hex(&exe).unwrap();
    let bundle = PatchBundle::new()
        .with_version(&hash, GameVersion::new("1.0", "Retail"))
        .with_patch(PatchDefinition::new(Manifest::new("p")).with_hooks(
            &hash,
            vec![
                RawHook::bytes(HookKind::Static, JUMP_ADDR, &[0x74, 0x05], &[0xEB, 0x05]),
                RawHook::bytes(HookKind::Static, CAP_ADDR, &[0xAA, 0xBB], &[0x00, 0x00]),
            ],
        ));
    let installer = Installer::new(bundle.version_table());

    let result = install(
        &installer,
        &exe,
        &bundle,
        &["p"],
        InstallOptions {
            create_backup: false,
            ..InstallOptions::default()
        },
    );
    assert!(!result.success);
    assert!(result.backup.is_none());
    assert!(backup_files(&exe).is_empty());
    assert!(result
        .messages
        .iter()
        .any(|m| m == "Rollback: revert 1 static hook(s)"));
    assert_eq!(fs::read(&exe).unwrap(), original);

    cleanup(&dir);
}

#[test]
fn test_collision_between_patches_is_reported() {
    let (dir, exe) = game("collision");
    let hash = util::hash_file_hex(&exe).unwrap();
    let bundle = PatchBundle::new()
        .with_version(&hash, GameVersion::new("1.0", "Retail"))
        .with_patch(PatchDefinition::new(Manifest::new("a")).with_hooks(
            &hash,
            vec![RawHook::bytes(HookKind::Static, JUMP_ADDR, &[0x74, 0x05], &[0xEB, 0x05])],
        ))
        .with_patch(
            PatchDefinition::new(Manifest::new("b"))
                .with_hooks(&hash, vec![detour(JUMP_ADDR, "other")]),
        );
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["a", "b"], InstallOptions::default());
    assert!(!result.success);
    assert_eq!(result.failed_step, Some(InstallState::ResolvingPatches));
    assert_eq!(result.error_kind, Some("ValidationError"));
    let error = result.error.unwrap();
    assert!(error.contains("0x00401010"), "{error}");
    assert!(error.contains("a#0"), "{error}");
    assert!(error.contains("b#0"), "{error}");
    assert!(backup_files(&exe).is_empty());

    cleanup(&dir);
}

#[test]
fn test_unknown_executable_version() {
    let (dir, exe) = game("unknown_version");
    let bundle = PatchBundle::new()
        .with_version("00", GameVersion::new("1.0", "Retail"))
        .with_patch(PatchDefinition::new(Manifest::new("a")));
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["a"], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::DetectingVersion));
    assert_eq!(result.error_kind, Some("VersionError"));

    cleanup(&dir);
}

#[test]
fn test_patch_without_support_for_detected_version() {
    let (dir, exe) = game("unsupported_patch");
    let hash = util::hash_file_hex(&exe).unwrap();
    let bundle = PatchBundle::new()
        .with_version(&hash, GameVersion::new("1.0", "Retail"))
        .with_patch(PatchDefinition::new(Manifest::new("a").supports("2.0", "FFFF")));
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["a"], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::DetectingVersion));
    assert_eq!(result.error_kind, Some("VersionError"));
    assert!(result.detected_version.is_some());

    cleanup(&dir);
}

#[test]
fn test_request_validation() {
    let (dir, exe) = game("request_validation");
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &[], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::Validating));
    assert_eq!(result.error_kind, Some("ValidationError"));

    let result = install(&installer, &exe, &bundle, &["core", "core"], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::Validating));

    let result = install(&installer, &exe, &bundle, &["missing"], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::Validating));
    assert_eq!(result.error_kind, Some("DependencyError"));

    fs::write(&exe, b"not an executable at all, but long enough to pass the size check ......")
        .unwrap();
    let result = install(&installer, &exe, &bundle, &["core"], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::Validating));
    assert_eq!(result.error_kind, Some("FormatError"));

    cleanup(&dir);
}

#[test]
fn test_missing_dependency_in_batch() {
    let (dir, exe) = game("missing_dependency");
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["uncap"], InstallOptions::default());
    assert_eq!(result.failed_step, Some(InstallState::ResolvingPatches));
    assert_eq!(result.error_kind, Some("DependencyError"));
    assert!(result.error.unwrap().contains("requires 'core'"));

    cleanup(&dir);
}

#[test]
fn test_collaborator_failure_rolls_back_everything() {
    let (dir, exe) = game("collaborator_failure");
    let original = fs::read(&exe).unwrap();
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table()).with_config(FailingConfig);

    let result = install(&installer, &exe, &bundle, &["core", "uncap"], InstallOptions::default());
    assert!(!result.success);
    assert_eq!(result.failed_step, Some(InstallState::GeneratingConfig));
    assert_eq!(result.error_kind, Some("CollaboratorError"));
    assert!(result.error.unwrap().contains("disk full"));
    assert!(result.installed_patches.is_empty());

    assert_eq!(fs::read(&exe).unwrap(), original);
    assert!(!dir.join("core.dll").exists());
    assert!(!dir.join("Data/uncap.ini").exists());

    cleanup(&dir);
}

#[test]
fn test_panic_in_collaborator_is_contained() {
    let (dir, exe) = game("collaborator_panic");
    let original = fs::read(&exe).unwrap();
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table()).with_config(PanickingConfig);

    let result = install(&installer, &exe, &bundle, &["core"], InstallOptions::default());
    assert!(!result.success);
    assert_eq!(result.failed_step, Some(InstallState::GeneratingConfig));
    assert_eq!(result.error_kind, Some("UnexpectedFault"));
    assert!(result.error.unwrap().contains("exploded"));
    assert_eq!(fs::read(&exe).unwrap(), original);
    assert!(!dir.join("core.dll").exists());

    cleanup(&dir);
}

#[test]
fn test_remove_without_backup_fails() {
    let (dir, exe) = game("remove_no_backup");
    let installer = Installer::new(hookinstall::version::VersionTable::new());

    let result = installer.remove(&RemovalRequest {
        executable: &exe,
        game_dir: None,
        bundle: None,
        options: RemovalOptions::default(),
    });
    assert!(!result.success);
    assert_eq!(result.error_kind, Some("ValidationError"));
    assert!(result.error.unwrap().contains("no backup found"));

    cleanup(&dir);
}

#[test]
fn test_remove_refuses_tampered_backup() {
    let (dir, exe) = game("remove_tampered");
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table());

    let result = install(&installer, &exe, &bundle, &["core"], InstallOptions::default());
    assert!(result.success, "{:?}", result.error);
    let record = result.backup.unwrap();
    let patched = fs::read(&exe).unwrap();
    fs::write(&record.backup_path, b"tampered").unwrap();

    let removal = installer.remove(&RemovalRequest {
        executable: &exe,
        game_dir: None,
        bundle: Some(&bundle),
        options: RemovalOptions::default(),
    });
    assert!(!removal.success);
    assert_eq!(removal.error_kind, Some("IntegrityError"));
    assert_eq!(fs::read(&exe).unwrap(), patched);

    cleanup(&dir);
}

#[test]
fn test_failed_support_copy_leaves_no_support_files() {
    let (dir, exe) = game("support_copy_failure");
    let original = fs::read(&exe).unwrap();
    let src = dir.join("support");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("loader.dll"), b"loader").unwrap();
    let game_dir = dir.join("game");
    fs::create_dir_all(&game_dir).unwrap();

    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table()).with_support_files(CopySupportFiles {
        sources: vec![src.join("loader.dll"), src.join("missing.dll")],
    });
    let selected = ids(&["core"]);
    let result = installer.install(&InstallRequest {
        executable: &exe,
        game_dir: Some(&game_dir),
        bundle: &bundle,
        selected: &selected,
        options: InstallOptions::default(),
    });

    assert!(!result.success);
    assert_eq!(result.failed_step, Some(InstallState::InstallingSupportFiles));
    assert!(!game_dir.join("loader.dll").exists());
    assert!(!game_dir.join("core.dll").exists());
    assert!(!game_dir.join(DEFAULT_FILE_NAME).exists());
    assert_eq!(fs::read(&exe).unwrap(), original);

    cleanup(&dir);
}

#[test]
fn test_rollback_keeps_files_that_were_there_before() {
    let (dir, exe) = game("preexisting_payload");
    fs::write(dir.join("core.dll"), b"USER'S OWN FILE").unwrap();
    let bundle = standard_bundle(&exe);
    let installer = Installer::new(bundle.version_table()).with_config(FailingConfig);

    let result = install(&installer, &exe, &bundle, &["core"], InstallOptions::default());
    assert!(!result.success);
    assert_eq!(result.failed_step, Some(InstallState::GeneratingConfig));
    assert_eq!(fs::read(dir.join("core.dll")).unwrap(), b"USER'S OWN FILE");

    cleanup(&dir);
}
