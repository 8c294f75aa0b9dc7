#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use hookinstall::bundle::{PatchBundle, PatchDefinition, Payload};
use hookinstall::hook::{HookKind, RawHook};
use hookinstall::manifest::Manifest;
use hookinstall::util;
use hookinstall::version::GameVersion;

pub const IMAGE_BASE: u32 = 0x0040_0000;

/// VA 0x401010, file offset 0x210 in `.text`.
pub const JUMP_ADDR: u32 = 0x0040_1010;
pub const JUMP_OFFSET: usize = 0x210;
/// VA 0x402000, file offset 0x300 in `.data`.
pub const CAP_ADDR: u32 = 0x0040_2000;
pub const CAP_OFFSET: usize = 0x300;
pub const DETOUR_ADDR: u32 = 0x0040_1020;

/// 1000-byte PE32 image with `.text` (VA 0x1000, raw 0x200..0x300) and
/// `.data` (VA 0x2000, raw 0x300..0x380). Known bytes sit at
/// `JUMP_OFFSET` (74 05) and `CAP_OFFSET` (64 00 00 00).
pub fn pe32_image() -> Vec<u8> {
    let mut image = vec![0u8; 1000];
    image[0..2].copy_from_slice(b"MZ");
    image[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());

    let pe = 0x80;
    image[pe..pe + 4].copy_from_slice(b"PE\0\0");
    image[pe + 4..pe + 6].copy_from_slice(&0x014Cu16.to_le_bytes());
    image[pe + 6..pe + 8].copy_from_slice(&2u16.to_le_bytes());
    image[pe + 20..pe + 22].copy_from_slice(&0xE0u16.to_le_bytes());

    let opt = pe + 24;
    image[opt..opt + 2].copy_from_slice(&0x010Bu16.to_le_bytes());
    image[opt + 28..opt + 32].copy_from_slice(&IMAGE_BASE.to_le_bytes());

    let table = opt + 0xE0;
    let sections: [(&[u8], u32, u32, u32, u32); 2] = [
        (b".text", 0x1000, 0x200, 0x200, 0x100),
        (b".data", 0x2000, 0x80, 0x300, 0x80),
    ];
    for (i, (name, va, vsize, raw_ptr, raw_size)) in sections.iter().enumerate() {
        let at = table + i * 40;
        image[at..at + name.len()].copy_from_slice(name);
        image[at + 8..at + 12].copy_from_slice(&vsize.to_le_bytes());
        image[at + 12..at + 16].copy_from_slice(&va.to_le_bytes());
        image[at + 16..at + 20].copy_from_slice(&raw_size.to_le_bytes());
        image[at + 20..at + 24].copy_from_slice(&raw_ptr.to_le_bytes());
    }

    image[JUMP_OFFSET..JUMP_OFFSET + 2].copy_from_slice(&[0x74, 0x05]);
    image[CAP_OFFSET..CAP_OFFSET + 4].copy_from_slice(&100u32.to_le_bytes());
    image
}

/// Fresh directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hookinstall_it_{name}"));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// A game directory holding `game.exe` built from [`pe32_image`].
pub fn game(name: &str) -> (PathBuf, PathBuf) {
    let dir = temp_dir(name);
    let exe = dir.join("game.exe");
    fs::write(&exe, pe32_image()).unwrap();
    (dir, exe)
}

pub fn cleanup(dir: &Path) {
    let _ = fs::remove_dir_all(dir);
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub fn detour(address: u32, function: &str) -> RawHook {
    RawHook {
        address,
        kind: HookKind::Detour,
        original: vec![0x55, 0x8B, 0xEC, 0x51, 0x52],
        replacement: None,
        function: Some(function.to_string()),
        parameters: None,
        preserve_registers: true,
        preserve_flags: true,
        excluded_registers: Vec::new(),
    }
}

/// Two patches for the fixture executable:
/// `core` patches the jump at `JUMP_ADDR` and ships `core.dll`;
/// `uncap` requires `core`, raises the cap at `CAP_ADDR` and adds a detour.
pub fn standard_bundle(exe: &Path) -> PatchBundle {
    let hash = util::hash_file_hex(exe).unwrap();
    PatchBundle::new()
        .with_version(&hash, GameVersion::new("1.9.32", "Retail"))
        .with_patch(
            PatchDefinition::new(Manifest::new("core"))
                .with_hooks(
                    &hash,
                    vec![RawHook::bytes(HookKind::Static, JUMP_ADDR, &[0x74, 0x05], &[0xEB, 0x05])],
                )
                .with_payload(Payload::new("core.dll", b"MZ core")),
        )
        .with_patch(
            PatchDefinition::new(Manifest::new("uncap").requires(&["core"]))
                .with_hooks(
                    &hash,
                    vec![
                        RawHook::bytes(
                            HookKind::Static,
                            CAP_ADDR,
                            &100u32.to_le_bytes(),
                            &250u32.to_le_bytes(),
                        ),
                        detour(DETOUR_ADDR, "skill_cap"),
                    ],
                )
                .with_payload(Payload::new("Data/uncap.ini", b"cap=250")),
        )
}

/// Files named `<exe>.backup.*` next to `exe`, sidecars included.
pub fn backup_files(exe: &Path) -> Vec<PathBuf> {
    let prefix = format!("{}.backup.", exe.file_name().unwrap().to_str().unwrap());
    let mut found: Vec<PathBuf> = fs::read_dir(exe.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    found.sort();
    found
}
