//! Startup checks on the source directory.
//!
//! The mount only protects what goes through it. If an unprivileged user
//! can write to the source directory directly, the protection is moot, so
//! the binary refuses to mount unless the source directory is owned by root
//! and not world-writable, and the process itself runs as root.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::config::AddFsConfig;

/// A reason the source directory is unsafe to mount.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("source directory {0} does not exist")]
    Missing(PathBuf),

    #[error("source {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error(
        "source directory {path} is owned by uid {uid}, not root; that user could write to it directly and bypass the protection"
    )]
    NotOwnedByRoot { path: PathBuf, uid: u32 },

    #[error(
        "source directory {path} is world-writable (mode {mode:o}); any user could bypass the protection"
    )]
    WorldWritable { path: PathBuf, mode: u32 },

    #[error(
        "not running as root (euid {euid}); only directories writable by this user could be mounted"
    )]
    NotRunningAsRoot { euid: u32 },

    #[error("cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Run every startup check for `config`.
pub fn validate_startup(config: &AddFsConfig) -> Result<(), ValidationError> {
    check_privileges()?;
    check_source_dir(&config.source_path)
}

/// The process must run with an effective uid of 0.
pub fn check_privileges() -> Result<(), ValidationError> {
    check_euid(rustix::process::geteuid().as_raw())
}

fn check_euid(euid: u32) -> Result<(), ValidationError> {
    if euid == 0 {
        Ok(())
    } else {
        Err(ValidationError::NotRunningAsRoot { euid })
    }
}

/// The source directory must exist, be owned by root, and not be
/// world-writable.
pub fn check_source_dir(path: &Path) -> Result<(), ValidationError> {
    let meta = std::fs::metadata(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ValidationError::Missing(path.to_path_buf()),
        _ => ValidationError::Stat {
            path: path.to_path_buf(),
            source,
        },
    })?;

    if !meta.is_dir() {
        return Err(ValidationError::NotADirectory(path.to_path_buf()));
    }

    check_attributes(path, meta.uid(), meta.mode())?;
    debug!(path = %path.display(), "source directory passed ownership checks");
    Ok(())
}

/// Ownership and permission rules, separated from the stat call.
pub fn check_attributes(path: &Path, uid: u32, mode: u32) -> Result<(), ValidationError> {
    if uid != 0 {
        return Err(ValidationError::NotOwnedByRoot {
            path: path.to_path_buf(),
            uid,
        });
    }
    if mode & 0o002 != 0 {
        return Err(ValidationError::WorldWritable {
            path: path.to_path_buf(),
            mode: mode & 0o7777,
        });
    }
    Ok(())
}
