//! Virtual Filesystem abstraction.
//!
//! This module provides the path-based filesystem interface the policy
//! engine sits on. Key components:
//!
//! - [`VfsOps`] - Core trait for filesystem operations
//! - [`LocalBackend`] - Passthrough onto a real directory tree
//! - [`MemoryBackend`] - In-memory filesystem (for testing)
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: Operations use paths relative to the
//!   backend root. The FUSE shim handles inode ↔ path mapping.
//! - **Explicit offset/size**: Read/write take offset and size, so no
//!   handle state lives in the backend.
//! - **Caller on mutations**: Every operation that changes the tree takes
//!   the requesting [`Caller`], so wrappers can make decisions per identity.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use types::{Caller, DirEntry, FileAttr, FileType, OpenFlags, SetAttr, StatFs};
