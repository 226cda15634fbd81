//! Access policy for add-only mounts.
//!
//! - [`MutableFileMatcher`] - patterns naming paths exempt from protection
//! - [`PolicyEngine`] - [`VfsOps`](crate::vfs::VfsOps) wrapper that refuses
//!   destructive operations on existing entries

mod engine;
mod matcher;

pub use engine::{rooted, Operation, PolicyEngine};
pub use matcher::MutableFileMatcher;
