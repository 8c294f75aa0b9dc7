//! Hook model.
//!
//! Loaders hand us flat [`RawHook`] records; converting one into a [`Hook`]
//! is where shape validation happens. A `Hook` only carries the fields its
//! variant uses, so a Static hook with a function reference cannot exist.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bytes needed for a relative `jmp rel32`.
pub const JUMP_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    Detour,
    Simple,
    Replace,
    Static,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::Detour => "detour",
            HookKind::Simple => "simple",
            HookKind::Replace => "replace",
            HookKind::Static => "static",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

/// Where a detour routine reads one of its arguments from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterSource {
    Register(Register),
    /// Byte offset from the stack pointer at the hook site.
    Stack(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub source: ParameterSource,
}

impl Parameter {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("parameter name is empty".to_string());
        }
        if let ParameterSource::Stack(offset) = self.source {
            if offset < 0 || offset % 4 != 0 {
                return Err(format!(
                    "parameter '{}' has stack offset {offset}, expected a non-negative multiple of 4",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// A hook record as produced by the definition loader, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHook {
    pub address: u32,
    pub kind: HookKind,
    pub original: Vec<u8>,
    pub replacement: Option<Vec<u8>>,
    pub function: Option<String>,
    pub parameters: Option<Vec<Parameter>>,
    pub preserve_registers: bool,
    pub preserve_flags: bool,
    pub excluded_registers: Vec<Register>,
}

impl RawHook {
    /// A byte-for-byte hook of the given kind with no detour fields set.
    pub fn bytes(kind: HookKind, address: u32, original: &[u8], replacement: &[u8]) -> Self {
        RawHook {
            address,
            kind,
            original: original.to_vec(),
            replacement: Some(replacement.to_vec()),
            function: None,
            parameters: None,
            preserve_registers: false,
            preserve_flags: false,
            excluded_registers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetourHook {
    pub address: u32,
    pub original: Vec<u8>,
    pub function: String,
    pub parameters: Vec<Parameter>,
    pub preserve_registers: bool,
    pub preserve_flags: bool,
    /// Registers the routine may clobber; they are not restored on return.
    pub excluded_registers: Vec<Register>,
}

/// Replaces `original` with `replacement` at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePatch {
    pub address: u32,
    pub original: Vec<u8>,
    pub replacement: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    Detour(DetourHook),
    Simple(BytePatch),
    Replace(BytePatch),
    /// Written into the executable file at install time.
    Static(BytePatch),
}

impl Hook {
    pub fn address(&self) -> u32 {
        match self {
            Hook::Detour(d) => d.address,
            Hook::Simple(p) | Hook::Replace(p) | Hook::Static(p) => p.address,
        }
    }

    pub fn kind(&self) -> HookKind {
        match self {
            Hook::Detour(_) => HookKind::Detour,
            Hook::Simple(_) => HookKind::Simple,
            Hook::Replace(_) => HookKind::Replace,
            Hook::Static(_) => HookKind::Static,
        }
    }

    pub fn original(&self) -> &[u8] {
        match self {
            Hook::Detour(d) => &d.original,
            Hook::Simple(p) | Hook::Replace(p) | Hook::Static(p) => &p.original,
        }
    }

    pub fn as_static(&self) -> Option<&BytePatch> {
        match self {
            Hook::Static(p) => Some(p),
            _ => None,
        }
    }

    /// Check the per-variant size rules.
    pub fn validate(&self) -> Result<()> {
        let address = self.address();
        let invalid = |reason: String| Err(Error::Validation { address, reason });

        if address == 0 {
            return invalid("address is zero".to_string());
        }
        if self.original().is_empty() {
            return invalid("original bytes are empty".to_string());
        }

        match self {
            Hook::Detour(d) => {
                if d.original.len() < JUMP_LEN {
                    return invalid(format!(
                        "detour needs at least {JUMP_LEN} original bytes for a jump, has {}",
                        d.original.len()
                    ));
                }
                if d.function.trim().is_empty() {
                    return invalid("detour has no function reference".to_string());
                }
                for param in &d.parameters {
                    if let Err(reason) = param.validate() {
                        return invalid(reason);
                    }
                }
            }
            Hook::Simple(p) | Hook::Static(p) => {
                if p.replacement.len() != p.original.len() {
                    return invalid(format!(
                        "{} hook replaces {} bytes with {} bytes; lengths must match",
                        self.kind(),
                        p.original.len(),
                        p.replacement.len()
                    ));
                }
            }
            Hook::Replace(p) => {
                if p.original.len() < JUMP_LEN {
                    return invalid(format!(
                        "replace hook needs at least {JUMP_LEN} original bytes, has {}",
                        p.original.len()
                    ));
                }
                if p.replacement.is_empty() {
                    return invalid("replace hook has no replacement bytes".to_string());
                }
            }
        }
        Ok(())
    }
}

fn non_empty(function: &Option<String>) -> Option<&str> {
    function.as_deref().filter(|f| !f.trim().is_empty())
}

impl TryFrom<RawHook> for Hook {
    type Error = Error;

    fn try_from(raw: RawHook) -> Result<Self> {
        let address = raw.address;
        let invalid = |reason: String| Error::Validation { address, reason };

        let hook = match raw.kind {
            HookKind::Detour => {
                if raw.replacement.as_ref().is_some_and(|r| !r.is_empty()) {
                    return Err(invalid(
                        "detour hooks generate their own jump and take no replacement bytes"
                            .to_string(),
                    ));
                }
                let function = non_empty(&raw.function)
                    .ok_or_else(|| invalid("detour has no function reference".to_string()))?
                    .to_string();
                Hook::Detour(DetourHook {
                    address,
                    original: raw.original,
                    function,
                    parameters: raw.parameters.unwrap_or_default(),
                    preserve_registers: raw.preserve_registers,
                    preserve_flags: raw.preserve_flags,
                    excluded_registers: raw.excluded_registers,
                })
            }
            kind => {
                if non_empty(&raw.function).is_some() {
                    return Err(invalid(format!(
                        "{kind} hook must not reference a function"
                    )));
                }
                if raw.parameters.as_ref().is_some_and(|p| !p.is_empty()) {
                    return Err(invalid(format!("{kind} hook must not declare parameters")));
                }
                let replacement = raw
                    .replacement
                    .ok_or_else(|| invalid(format!("{kind} hook has no replacement bytes")))?;
                let patch = BytePatch {
                    address,
                    original: raw.original,
                    replacement,
                };
                match kind {
                    HookKind::Simple => Hook::Simple(patch),
                    HookKind::Replace => Hook::Replace(patch),
                    _ => Hook::Static(patch),
                }
            }
        };

        hook.validate()?;
        Ok(hook)
    }
}

impl From<&Hook> for RawHook {
    fn from(hook: &Hook) -> Self {
        match hook {
            Hook::Detour(d) => RawHook {
                address: d.address,
                kind: HookKind::Detour,
                original: d.original.clone(),
                replacement: None,
                function: Some(d.function.clone()),
                parameters: Some(d.parameters.clone()),
                preserve_registers: d.preserve_registers,
                preserve_flags: d.preserve_flags,
                excluded_registers: d.excluded_registers.clone(),
            },
            Hook::Simple(p) | Hook::Replace(p) | Hook::Static(p) => {
                RawHook::bytes(hook.kind(), p.address, &p.original, &p.replacement)
            }
        }
    }
}

/// Validate a whole list of raw records, stopping at the first bad one.
pub fn validate_all(raw: &[RawHook]) -> Result<Vec<Hook>> {
    raw.iter().cloned().map(Hook::try_from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOwner {
    pub patch: String,
    /// Position of the hook within its patch's hook list.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCollision {
    pub address: u32,
    pub owners: Vec<HookOwner>,
}

impl fmt::Display for AddressCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X} claimed by ", self.address)?;
        for (i, owner) in self.owners.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}#{}", owner.patch, owner.index)?;
        }
        Ok(())
    }
}

/// Every address claimed by more than one hook, within or across patches.
pub fn find_collisions<'a, I>(sets: I) -> Vec<AddressCollision>
where
    I: IntoIterator<Item = (&'a str, &'a [Hook])>,
{
    let mut by_address: BTreeMap<u32, Vec<HookOwner>> = BTreeMap::new();
    for (patch, hooks) in sets {
        for (index, hook) in hooks.iter().enumerate() {
            by_address.entry(hook.address()).or_default().push(HookOwner {
                patch: patch.to_string(),
                index,
            });
        }
    }

    by_address
        .into_iter()
        .filter(|(_, owners)| owners.len() > 1)
        .map(|(address, owners)| AddressCollision { address, owners })
        .collect()
}

/// Fail with [`Error::HookCollision`] if any address is claimed twice.
pub fn check_collisions<'a, I>(sets: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a [Hook])>,
{
    let collisions = find_collisions(sets);
    if collisions.is_empty() {
        Ok(())
    } else {
        Err(Error::HookCollision(collisions))
    }
}
