//! # addfs-kernel
//!
//! Add-only access control over a directory tree.
//!
//! Callers may create new files and directories, but existing entries
//! cannot be truncated, renamed, removed or overwritten unless the caller
//! is exempt: uid 0 when root mutation is allowed, or any caller when the
//! path matches a configured mutable pattern.
//!
//! The crate is independent of FUSE. A [`PolicyEngine`] wraps any
//! [`VfsOps`] backend (usually a [`LocalBackend`] over the source directory)
//! and is itself a `VfsOps`, so the mount shim only has to translate
//! kernel requests into path-based calls.

pub mod config;
pub mod policy;
pub mod validate;
pub mod vfs;

pub use config::{AddFsConfig, ConfigError};
pub use policy::{MutableFileMatcher, Operation, PolicyEngine};
pub use validate::{validate_startup, ValidationError};
pub use vfs::{
    backends::{LocalBackend, MemoryBackend},
    Caller, DirEntry, FileAttr, FileType, OpenFlags, SetAttr, StatFs, VfsError, VfsOps, VfsResult,
};
