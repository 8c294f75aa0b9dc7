use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::hook::AddressCollision;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine reports. None of these are retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed hook shape, caught before any I/O.
    #[error("invalid hook at {address:#010X}: {reason}")]
    Validation { address: u32, reason: String },

    /// The caller asked for something the engine cannot act on.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid manifest '{id}': {reason}")]
    InvalidManifest { id: String, reason: String },

    #[error("hook address collision: {}", DisplayCollisions(.0))]
    HookCollision(Vec<AddressCollision>),

    /// Bad signature, unsupported architecture or truncated headers.
    #[error("unsupported executable format: {0}")]
    Format(String),

    #[error("cannot map address {address:#X} to a file offset: {reason}")]
    AddressResolution { address: u64, reason: String },

    /// On-disk bytes differ from what the hook expects: wrong version or already patched.
    #[error(
        "bytes at {address:#010X} (file offset {offset:#X}) do not match: expected {}, found {}",
        hex(.expected),
        hex(.found)
    )]
    VerificationMismatch {
        address: u32,
        offset: u64,
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("unsupported game version: {0}")]
    UnsupportedVersion(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Backup digest no longer matches the one recorded at creation time.
    #[error("backup {} failed integrity check: expected {expected}, found {actual}", .path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{step} failed: {message}")]
    Collaborator { step: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("unknown patch '{0}'")]
    UnknownPatch(String),

    #[error("patch '{patch}' requires '{requires}', which is not selected")]
    MissingDependency { patch: String, requires: String },

    #[error("patch '{patch}' conflicts with selected patch '{other}'")]
    Conflict { patch: String, other: String },

    /// `path` ends with the id that closed the cycle.
    #[error("circular dependency: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn collaborator(step: &'static str, err: anyhow::Error) -> Self {
        Error::Collaborator {
            step,
            message: format!("{err:#}"),
        }
    }

    /// Taxonomy name used in logs and result records.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. }
            | Error::InvalidRequest(_)
            | Error::InvalidManifest { .. }
            | Error::HookCollision(_) => "ValidationError",
            Error::Format(_) => "FormatError",
            Error::AddressResolution { .. } => "AddressResolutionError",
            Error::VerificationMismatch { .. } => "VerificationMismatchError",
            Error::Dependency(_) => "DependencyError",
            Error::UnsupportedVersion(_) => "VersionError",
            Error::Io { .. } => "IOError",
            Error::Integrity { .. } => "IntegrityError",
            Error::Collaborator { .. } => "CollaboratorError",
        }
    }
}

struct DisplayCollisions<'a>(&'a [AddressCollision]);

impl fmt::Display for DisplayCollisions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, collision) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{collision}")?;
        }
        Ok(())
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
