//! VFS backends.
//!
//! Backends implement [`VfsOps`](super::VfsOps) for different storage types:
//! a passthrough to a real directory, and an in-memory tree for tests.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
