//! Errors returned by [`VfsOps`](super::VfsOps) implementations.

use std::io;
use std::path::Path;
use thiserror::Error;

/// A failed filesystem operation.
///
/// Backend failures travel through the policy engine unchanged; only
/// `PermissionDenied` is produced by policy decisions. OS errors stay in
/// `Io` so their errno survives to the kernel.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: is a directory")]
    IsADirectory(String),

    #[error("{0}: directory not empty")]
    DirectoryNotEmpty(String),

    #[error("{0}: not a symbolic link")]
    NotASymlink(String),

    /// A `..` component would leave the backend root.
    #[error("{0}: path leaves the source directory")]
    PathEscapesRoot(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

fn shown(path: impl AsRef<Path>) -> String {
    path.as_ref().display().to_string()
}

impl VfsError {
    pub fn not_found(path: impl AsRef<Path>) -> Self {
        Self::NotFound(shown(path))
    }

    pub fn already_exists(path: impl AsRef<Path>) -> Self {
        Self::AlreadyExists(shown(path))
    }

    /// A refused operation; `what` names the operation and its target.
    pub fn permission_denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    pub fn not_a_directory(path: impl AsRef<Path>) -> Self {
        Self::NotADirectory(shown(path))
    }

    pub fn is_a_directory(path: impl AsRef<Path>) -> Self {
        Self::IsADirectory(shown(path))
    }

    pub fn directory_not_empty(path: impl AsRef<Path>) -> Self {
        Self::DirectoryNotEmpty(shown(path))
    }

    pub fn not_a_symlink(path: impl AsRef<Path>) -> Self {
        Self::NotASymlink(shown(path))
    }

    pub fn path_escapes_root(path: impl AsRef<Path>) -> Self {
        Self::PathEscapesRoot(shown(path))
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns true if access was refused, by policy or by the OS.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied(_) | Self::PathEscapesRoot(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
