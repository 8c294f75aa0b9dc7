//! Installs hook patches into a PE executable: verifies the expected bytes,
//! writes the static hooks in place, and hands the remaining hooks to the
//! runtime loader through a config file. Every install is preceded by a
//! verified backup that can be restored.

pub mod address;
pub mod backup;
pub mod bundle;
pub mod collaborators;
pub mod error;
pub mod hook;
pub mod install;
pub mod layout;
pub mod manifest;
pub mod resolver;
pub mod runtime_config;
pub mod static_hooks;
pub mod undo;
pub mod util;
pub mod version;

pub use error::{DependencyError, Error, Result};
pub use install::{
    InstallOptions, InstallRequest, InstallResult, InstallState, Installer, RemovalOptions,
    RemovalRequest, RemovalResult,
};
