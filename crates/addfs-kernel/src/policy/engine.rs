//! The add-only policy engine.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use strum::Display;
use tracing::{debug, info, warn};

use super::matcher::MutableFileMatcher;
use crate::config::{AddFsConfig, ConfigError};
use crate::vfs::{
    Caller, DirEntry, FileAttr, OpenFlags, SetAttr, StatFs, VfsError, VfsOps, VfsResult,
};

/// Mutating operations subject to a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Truncate,
    Rename,
    Rmdir,
    Unlink,
    Mkdir,
    Open,
    Create,
    Link,
}

/// Rooted form of a mount-relative path, as seen by mutable patterns.
///
/// `log/a.txt` and `/log/a.txt` both become `/log/a.txt`; the mount root
/// is `/`.
pub fn rooted(path: &Path) -> String {
    let mut out = String::from("/");
    for component in path.components() {
        if let Component::Normal(name) = component {
            if out.len() > 1 {
                out.push('/');
            }
            out.push_str(&name.to_string_lossy());
        }
    }
    out
}

/// Filesystem wrapper that lets callers add entries but not destroy or
/// overwrite existing ones.
///
/// `PolicyEngine` implements [`VfsOps`] over another `VfsOps`. Truncate,
/// rename, rmdir and unlink are refused unless the caller is permitted;
/// open and create are refused when they would modify an entry that
/// already exists. A hard link may not give a protected file a name the
/// caller is permitted to mutate, since writes through that name reach the
/// same inode. Everything else is forwarded untouched. Entries created
/// through the engine are handed to the caller's uid and gid.
///
/// A caller is permitted when root mutation is allowed and the caller is
/// uid 0, or when the target path matches a mutable pattern.
///
/// Existence is checked with a separate lookup before forwarding, so an
/// entry created concurrently between the two steps is not caught.
pub struct PolicyEngine {
    inner: Arc<dyn VfsOps>,
    matcher: MutableFileMatcher,
    allow_root_mutation: bool,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("matcher", &self.matcher)
            .field("allow_root_mutation", &self.allow_root_mutation)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Build an engine over `inner` from a configuration.
    ///
    /// Fails if any mutable pattern does not compile.
    pub fn new(inner: Arc<dyn VfsOps>, config: &AddFsConfig) -> Result<Self, ConfigError> {
        let matcher = MutableFileMatcher::new(&config.mutable_patterns)?;
        Ok(Self::from_parts(inner, matcher, config.allow_root_mutation))
    }

    /// Build an engine from an already compiled matcher.
    pub fn from_parts(
        inner: Arc<dyn VfsOps>,
        matcher: MutableFileMatcher,
        allow_root_mutation: bool,
    ) -> Self {
        Self {
            inner,
            matcher,
            allow_root_mutation,
        }
    }

    /// The compiled mutable-path patterns.
    pub fn matcher(&self) -> &MutableFileMatcher {
        &self.matcher
    }

    /// Whether uid 0 bypasses protection.
    pub fn allow_root_mutation(&self) -> bool {
        self.allow_root_mutation
    }

    /// Returns true if `caller` may mutate `path` regardless of whether it
    /// exists.
    pub fn permitted(&self, caller: &Caller, path: &Path) -> bool {
        (self.allow_root_mutation && caller.is_root()) || self.matcher.matches(&rooted(path))
    }

    /// Decide an unconditional mutation of `path`.
    pub fn authorize(&self, op: Operation, path: &Path, caller: &Caller) -> VfsResult<()> {
        if self.permitted(caller, path) {
            debug!(%op, path = %rooted(path), %caller, "allowed");
            Ok(())
        } else {
            Err(self.deny(op, path, caller))
        }
    }

    fn deny(&self, op: Operation, path: &Path, caller: &Caller) -> VfsError {
        let path = rooted(path);
        info!(%op, %path, %caller, "denied");
        VfsError::permission_denied(format!("{op} {path}"))
    }

    /// Hand a freshly created entry to the caller.
    async fn correct_ownership(
        &self,
        op: Operation,
        path: &Path,
        caller: &Caller,
        attr: FileAttr,
    ) -> VfsResult<FileAttr> {
        if let Err(e) = self.inner.chown(path, caller.uid, caller.gid, caller).await {
            warn!(%op, path = %rooted(path), %caller, error = %e, "ownership correction failed");
            return Err(e);
        }
        Ok(attr.with_owner(caller.uid, caller.gid))
    }
}

#[async_trait]
impl VfsOps for PolicyEngine {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        self.inner.getattr(path).await
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        self.inner.read(path, offset, size).await
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        self.inner.readlink(path).await
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32> {
        self.inner.write(path, offset, data).await
    }

    async fn open(&self, path: &Path, flags: OpenFlags, caller: &Caller) -> VfsResult<FileAttr> {
        if flags.is_mutating() && !self.permitted(caller, path) && self.inner.exists(path).await
        {
            return Err(self.deny(Operation::Open, path, caller));
        }
        debug!(op = %Operation::Open, path = %rooted(path), %caller, ?flags, "allowed");
        self.inner.open(path, flags, caller).await
    }

    async fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: OpenFlags,
        caller: &Caller,
    ) -> VfsResult<FileAttr> {
        if !self.permitted(caller, path) && self.inner.exists(path).await {
            return Err(self.deny(Operation::Create, path, caller));
        }
        debug!(op = %Operation::Create, path = %rooted(path), %caller, mode, "allowed");
        let attr = self.inner.create(path, mode, flags, caller).await?;
        self.correct_ownership(Operation::Create, path, caller, attr)
            .await
    }

    async fn mkdir(&self, path: &Path, mode: u32, caller: &Caller) -> VfsResult<FileAttr> {
        debug!(op = %Operation::Mkdir, path = %rooted(path), %caller, "allowed");
        let attr = self.inner.mkdir(path, mode, caller).await?;
        self.correct_ownership(Operation::Mkdir, path, caller, attr)
            .await
    }

    async fn unlink(&self, path: &Path, caller: &Caller) -> VfsResult<()> {
        self.authorize(Operation::Unlink, path, caller)?;
        self.inner.unlink(path, caller).await
    }

    async fn rmdir(&self, path: &Path, caller: &Caller) -> VfsResult<()> {
        self.authorize(Operation::Rmdir, path, caller)?;
        self.inner.rmdir(path, caller).await
    }

    async fn rename(&self, from: &Path, to: &Path, caller: &Caller) -> VfsResult<()> {
        // Only the source is checked; moving into a protected name is allowed.
        self.authorize(Operation::Rename, from, caller)?;
        self.inner.rename(from, to, caller).await
    }

    async fn truncate(&self, path: &Path, size: u64, caller: &Caller) -> VfsResult<()> {
        self.authorize(Operation::Truncate, path, caller)?;
        self.inner.truncate(path, size, caller).await
    }

    async fn setattr(&self, path: &Path, attr: SetAttr, caller: &Caller) -> VfsResult<FileAttr> {
        if attr.size.is_some() && !attr.via_handle {
            self.authorize(Operation::Truncate, path, caller)?;
        }
        self.inner.setattr(path, attr, caller).await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32, caller: &Caller) -> VfsResult<()> {
        self.inner.chown(path, uid, gid, caller).await
    }

    async fn symlink(&self, path: &Path, target: &Path, caller: &Caller) -> VfsResult<FileAttr> {
        self.inner.symlink(path, target, caller).await
    }

    async fn link(&self, oldpath: &Path, newpath: &Path, caller: &Caller) -> VfsResult<FileAttr> {
        if self.permitted(caller, newpath) && !self.permitted(caller, oldpath) {
            return Err(self.deny(Operation::Link, oldpath, caller));
        }
        debug!(op = %Operation::Link, path = %rooted(newpath), %caller, "allowed");
        self.inner.link(oldpath, newpath, caller).await
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        self.inner.statfs().await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }
}
