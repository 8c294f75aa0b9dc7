use crate::error::{Error, Result};
use crate::layout::LayoutInfo;

/// Translate a virtual address into a file offset.
///
/// Addresses below the first section's mapped start live in the header
/// region, which is mapped 1:1 from the start of the file. Everything else
/// must fall inside a section's mapped range and, within it, inside the part
/// that is actually backed by file data.
pub fn resolve(layout: &LayoutInfo, address: u64) -> Result<u64> {
    let fail = |reason: String| Error::AddressResolution { address, reason };

    if address < layout.image_base {
        return Err(fail(format!(
            "below image base {:#X}",
            layout.image_base
        )));
    }

    let mapped = |rva: u32| layout.image_base.checked_add(rva as u64);

    match layout.sections.first() {
        None => return Ok(address - layout.image_base),
        Some(first) => match mapped(first.virtual_address) {
            Some(end) if address < end => return Ok(address - layout.image_base),
            Some(_) => {}
            None => {
                return Err(fail(format!(
                    "section '{}' maps past the end of the address space",
                    first.name
                )))
            }
        },
    }

    for section in &layout.sections {
        let range = mapped(section.virtual_address)
            .and_then(|start| Some((start, start.checked_add(section.virtual_size as u64)?)));
        let Some((start, end)) = range else {
            return Err(fail(format!(
                "section '{}' maps past the end of the address space",
                section.name
            )));
        };
        if address < start || address >= end {
            continue;
        }

        let within = address - start;
        if within >= section.raw_size as u64 {
            return Err(fail(format!(
                "virtual-only region of section '{}' (offset {within:#X} past raw size {:#X})",
                section.name, section.raw_size
            )));
        }
        return Ok(section.raw_pointer as u64 + within);
    }

    Err(fail("not inside any section".to_string()))
}

/// Translate the `len`-byte run starting at `address`. The whole run must
/// sit in file-backed bytes of the same region as its first byte.
pub fn resolve_span(layout: &LayoutInfo, address: u64, len: usize) -> Result<u64> {
    let offset = resolve(layout, address)?;
    if len <= 1 {
        return Ok(offset);
    }

    let tail = (len - 1) as u64;
    let contiguous = address
        .checked_add(tail)
        .and_then(|last| resolve(layout, last).ok())
        .is_some_and(|last| Some(last) == offset.checked_add(tail));
    if !contiguous {
        return Err(Error::AddressResolution {
            address,
            reason: format!("{len}-byte run does not fit in the file-backed part of its region"),
        });
    }
    Ok(offset)
}
