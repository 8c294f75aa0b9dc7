//! Minimal PE header reader: just enough structure to map virtual addresses
//! to file offsets.

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::util;

pub const DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const OPTIONAL_MAGIC_PE32: u16 = 0x010B;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x020B;

const DOS_HEADER_LEN: usize = 64;
const E_LFANEW_OFFSET: usize = 0x3C;
const FILE_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    Pe32,
    Pe32Plus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_pointer: u32,
    pub raw_size: u32,
}

/// Snapshot of an executable's layout. Parsed fresh for every logical
/// operation so it always reflects what is on disk right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutInfo {
    pub sections: Vec<Section>,
    pub image_base: u64,
    pub bitness: Bitness,
}

impl LayoutInfo {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Read the layout of the executable at `path`.
pub fn read_layout(path: &Path) -> Result<LayoutInfo> {
    let len = std::fs::metadata(path)
        .map_err(|e| Error::io(path, e))?
        .len();
    if len < DOS_HEADER_LEN as u64 {
        return Err(Error::Format(format!(
            "{} is {len} bytes, too small for a DOS header",
            path.display()
        )));
    }

    // The mapping is dropped before returning so callers can write to the file.
    let layout = {
        let map = util::mmap_file(path)?;
        parse_layout(&map)?
    };
    debug!(
        path = %path.display(),
        sections = layout.sections.len(),
        "parsed executable layout, image base {:#X}",
        layout.image_base
    );
    Ok(layout)
}

/// Parse a layout out of an in-memory image of the file.
pub fn parse_layout(data: &[u8]) -> Result<LayoutInfo> {
    let dos_magic = read_u16(data, 0, "DOS signature")?;
    if dos_magic != DOS_SIGNATURE {
        return Err(Error::Format(format!(
            "bad DOS signature {dos_magic:#06X} (expected {DOS_SIGNATURE:#06X})"
        )));
    }

    let pe_offset = read_u32(data, E_LFANEW_OFFSET, "PE header offset")? as usize;
    let nt_magic = read_u32(data, pe_offset, "PE signature")?;
    if nt_magic != NT_SIGNATURE {
        return Err(Error::Format(format!(
            "bad PE signature {nt_magic:#010X} at offset {pe_offset:#X} (expected {NT_SIGNATURE:#010X})"
        )));
    }

    let file_header = pe_offset + 4;
    let machine = read_u16(data, file_header, "machine type")?;
    if machine != MACHINE_I386 && machine != MACHINE_AMD64 {
        return Err(Error::Format(format!(
            "unsupported machine type {machine:#06X}"
        )));
    }
    let section_count = read_u16(data, file_header + 2, "section count")? as usize;
    let optional_size = read_u16(data, file_header + 16, "optional header size")? as usize;

    let optional = file_header + FILE_HEADER_LEN;
    let magic = read_u16(data, optional, "optional header magic")?;
    let (bitness, image_base) = match magic {
        OPTIONAL_MAGIC_PE32 => (
            Bitness::Pe32,
            read_u32(data, optional + 28, "image base")? as u64,
        ),
        OPTIONAL_MAGIC_PE32_PLUS => (
            Bitness::Pe32Plus,
            read_u64(data, optional + 24, "image base")?,
        ),
        other => {
            return Err(Error::Format(format!(
                "unknown optional header magic {other:#06X}"
            )))
        }
    };

    let table = optional + optional_size;
    let mut sections = Vec::with_capacity(section_count);
    for i in 0..section_count {
        let at = table + i * SECTION_HEADER_LEN;
        let raw_name = slice(data, at, 8, "section name")?;
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&raw_name[..name_len]).trim().to_string();

        sections.push(Section {
            name,
            virtual_size: read_u32(data, at + 8, "section virtual size")?,
            virtual_address: read_u32(data, at + 12, "section virtual address")?,
            raw_size: read_u32(data, at + 16, "section raw size")?,
            raw_pointer: read_u32(data, at + 20, "section raw pointer")?,
        });
    }

    Ok(LayoutInfo {
        sections,
        image_base,
        bitness,
    })
}

fn slice<'a>(data: &'a [u8], at: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    at.checked_add(len)
        .and_then(|end| data.get(at..end))
        .ok_or_else(|| Error::Format(format!("file truncated while reading {what} at {at:#X}")))
}

fn read_u16(data: &[u8], at: usize, what: &str) -> Result<u16> {
    let b = slice(data, at, 2, what)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize, what: &str) -> Result<u32> {
    let b = slice(data, at, 4, what)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], at: usize, what: &str) -> Result<u64> {
    let b = slice(data, at, 8, what)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    Ok(u64::from_le_bytes(buf))
}
