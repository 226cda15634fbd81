//! The [`VfsOps`] trait.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::types::{Caller, DirEntry, FileAttr, OpenFlags, SetAttr, StatFs};
use super::VfsResult;

/// Path-based filesystem operations.
///
/// Paths are relative to the implementation's root; a leading `/` is
/// accepted and ignored. There are no inodes or handles: reads and writes
/// carry an explicit offset, so a stack of implementations needs no shared
/// state.
///
/// Every call that can change the tree receives the requesting [`Caller`].
/// Passthrough backends ignore it; the policy engine decides with it.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ------------------------------------------------------------------
    // Lookup and reading
    // ------------------------------------------------------------------

    /// Attributes of `path`. A symlink is reported as itself.
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Every entry of a directory, sorted by name, without `.` and `..`.
    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>>;

    /// Up to `size` bytes at `offset`; short at end of file.
    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>>;

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf>;

    // ------------------------------------------------------------------
    // Changing the tree
    // ------------------------------------------------------------------

    /// Write `data` at `offset`, returning the byte count.
    ///
    /// Writes only reach an implementation through a handle that `open` or
    /// `create` already granted, so no caller is passed.
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32>;

    /// Open an existing file. Flag side effects such as `O_TRUNC` are
    /// applied; the returned attributes reflect the file afterwards.
    async fn open(&self, path: &Path, flags: OpenFlags, caller: &Caller) -> VfsResult<FileAttr>;

    /// Create a file, or open it if it exists and `flags.exclusive` is
    /// unset.
    async fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: OpenFlags,
        caller: &Caller,
    ) -> VfsResult<FileAttr>;

    /// Make a directory. The parent must exist and `path` must not.
    async fn mkdir(&self, path: &Path, mode: u32, caller: &Caller) -> VfsResult<FileAttr>;

    async fn unlink(&self, path: &Path, caller: &Caller) -> VfsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path, caller: &Caller) -> VfsResult<()>;

    /// Move `from` to `to`, replacing `to` if it exists.
    async fn rename(&self, from: &Path, to: &Path, caller: &Caller) -> VfsResult<()>;

    async fn truncate(&self, path: &Path, size: u64, caller: &Caller) -> VfsResult<()>;

    async fn setattr(&self, path: &Path, attr: SetAttr, caller: &Caller) -> VfsResult<FileAttr>;

    /// Change owner and group of `path` itself, never a symlink's target.
    async fn chown(&self, path: &Path, uid: u32, gid: u32, caller: &Caller) -> VfsResult<()>;

    /// Create a symlink at `path` whose content is `target`.
    async fn symlink(&self, path: &Path, target: &Path, caller: &Caller) -> VfsResult<FileAttr>;

    /// Give the file at `oldpath` a second name, `newpath`.
    async fn link(&self, oldpath: &Path, newpath: &Path, caller: &Caller) -> VfsResult<FileAttr>;

    // ------------------------------------------------------------------
    // Filesystem-wide
    // ------------------------------------------------------------------

    async fn statfs(&self) -> VfsResult<StatFs>;

    async fn exists(&self, path: &Path) -> bool {
        self.getattr(path).await.is_ok()
    }
}
