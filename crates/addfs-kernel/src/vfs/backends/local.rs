//! Passthrough onto a real directory tree.
//!
//! This is the layer addfs serves underneath the policy engine. It makes no
//! access decisions of its own.

use async_trait::async_trait;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::task;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::VfsOps;
use crate::vfs::types::{Caller, DirEntry, FileAttr, FileType, OpenFlags, SetAttr, StatFs};

/// Passthrough backend rooted at a source directory.
///
/// Every path is taken relative to `root`: with `root` at `/srv/archive`,
/// `read("2024/report.pdf")` reads `/srv/archive/2024/report.pdf`.
///
/// Paths are resolved lexically: `..` components are rejected, and the
/// final component is never followed, so operating on a symlink acts on
/// the link itself and opening one fails with `ELOOP`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Serve the directory at `root`, which must exist.
    ///
    /// The root is canonicalized here so the mount and the startup checks
    /// refer to the same directory.
    pub fn try_new(root: impl AsRef<Path>) -> VfsResult<Self> {
        let root = dunce::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(VfsError::not_a_directory(&root));
        }
        Ok(Self { root })
    }

    /// The canonical source directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Returns an error if the path tries to leave the root via `..`.
    fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        let mut full = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => full.push(name),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(VfsError::path_escapes_root(path));
                }
            }
        }
        Ok(full)
    }

    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        FileAttr {
            size: meta.len(),
            kind: FileType::from(meta.file_type()),
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            atime: meta.accessed().ok(),
            ctime: Some(unix_time(meta.ctime(), meta.ctime_nsec())),
            nlink: meta.nlink() as u32,
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }
    }
}

/// Run a blocking std call off the async worker threads.
async fn blocking<T, F>(f: F) -> VfsResult<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| VfsError::other(format!("blocking task failed: {e}")))?
        .map_err(VfsError::from)
}

/// `open(2)` options that never follow a symlink in the last component.
fn no_follow() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.custom_flags(libc::O_NOFOLLOW);
    options
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

#[async_trait]
impl VfsOps for LocalBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let full_path = self.resolve(path)?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: FileType::from(entry.file_type().await?),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let full_path = self.resolve(path)?;
        let mut file = fs::File::open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(size as usize);
        file.take(u64::from(size)).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        let full_path = self.resolve(path)?;
        Ok(fs::read_link(&full_path).await?)
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        let full_path = self.resolve(path)?;

        let mut file = no_follow().write(true).open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(data.len() as u32)
    }

    async fn open(&self, path: &Path, flags: OpenFlags, _caller: &Caller) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;

        let mut options = no_follow();
        options
            .read(flags.read || !(flags.write || flags.append))
            .write(flags.write)
            .append(flags.append);
        if flags.truncate {
            // std refuses truncate without write access; pass it through raw
            options.custom_flags(libc::O_NOFOLLOW | libc::O_TRUNC);
        }

        let file = options.open(&full_path).await?;
        let meta = file.metadata().await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: OpenFlags,
        _caller: &Caller,
    ) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;

        let mut options = no_follow();
        options.read(flags.read).write(true).mode(mode);
        if flags.exclusive {
            options.create_new(true);
        } else {
            options.create(true);
        }
        if flags.append {
            options.append(true);
        }
        if flags.truncate {
            options.custom_flags(libc::O_NOFOLLOW | libc::O_TRUNC);
        }

        let file = options.open(&full_path).await?;
        let meta = file.metadata().await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn mkdir(&self, path: &Path, mode: u32, _caller: &Caller) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;

        fs::DirBuilder::new().mode(mode).create(&full_path).await?;

        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn unlink(&self, path: &Path, _caller: &Caller) -> VfsResult<()> {
        let full_path = self.resolve(path)?;
        Ok(fs::remove_file(&full_path).await?)
    }

    async fn rmdir(&self, path: &Path, _caller: &Caller) -> VfsResult<()> {
        let full_path = self.resolve(path)?;
        Ok(fs::remove_dir(&full_path).await?)
    }

    async fn rename(&self, from: &Path, to: &Path, _caller: &Caller) -> VfsResult<()> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        Ok(fs::rename(&from_path, &to_path).await?)
    }

    async fn truncate(&self, path: &Path, size: u64, _caller: &Caller) -> VfsResult<()> {
        let full_path = self.resolve(path)?;

        let file = no_follow().write(true).open(&full_path).await?;
        Ok(file.set_len(size).await?)
    }

    async fn setattr(&self, path: &Path, attr: SetAttr, _caller: &Caller) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;

        if let Some(size) = attr.size {
            let file = no_follow().write(true).open(&full_path).await?;
            file.set_len(size).await?;
        }

        if let Some(perm) = attr.perm {
            let permissions = std::fs::Permissions::from_mode(perm);
            fs::set_permissions(&full_path, permissions).await?;
        }

        if attr.uid.is_some() || attr.gid.is_some() {
            let (target, uid, gid) = (full_path.clone(), attr.uid, attr.gid);
            blocking(move || std::os::unix::fs::lchown(target, uid, gid)).await?;
        }

        if attr.mtime.is_some() || attr.atime.is_some() {
            let mut times = std::fs::FileTimes::new();
            if let Some(atime) = attr.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = attr.mtime {
                times = times.set_modified(mtime);
            }
            blocking(move || std::fs::File::open(full_path)?.set_times(times)).await?;
        }

        self.getattr(path).await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32, _caller: &Caller) -> VfsResult<()> {
        let full_path = self.resolve(path)?;
        blocking(move || std::os::unix::fs::lchown(full_path, Some(uid), Some(gid))).await
    }

    async fn symlink(&self, path: &Path, target: &Path, _caller: &Caller) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;

        fs::symlink(target, &full_path).await?;

        self.getattr(path).await
    }

    async fn link(&self, oldpath: &Path, newpath: &Path, _caller: &Caller) -> VfsResult<FileAttr> {
        let old_full = self.resolve(oldpath)?;
        let new_full = self.resolve(newpath)?;

        fs::hard_link(&old_full, &new_full).await?;

        self.getattr(newpath).await
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        let root = self.root.clone();
        let stat = blocking(move || rustix::fs::statvfs(&root).map_err(io::Error::from)).await?;

        Ok(StatFs {
            blocks: stat.f_blocks,
            bfree: stat.f_bfree,
            bavail: stat.f_bavail,
            files: stat.f_files,
            ffree: stat.f_ffree,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::try_new(dir.path()).unwrap();
        (backend, dir)
    }

    fn caller() -> Caller {
        Caller::new(1000, 1000)
    }

    async fn create_with(backend: &LocalBackend, path: &str, data: &[u8]) {
        backend
            .create(Path::new(path), 0o644, OpenFlags::create(), &caller())
            .await
            .unwrap();
        backend.write(Path::new(path), 0, data).await.unwrap();
    }

    #[test]
    fn test_try_new_requires_directory() {
        let dir = TempDir::new().unwrap();
        assert!(LocalBackend::try_new(dir.path()).is_ok());

        let missing = LocalBackend::try_new(dir.path().join("missing"));
        assert!(matches!(missing, Err(VfsError::Io(_))));

        std::fs::write(dir.path().join("file"), b"").unwrap();
        let file = LocalBackend::try_new(dir.path().join("file"));
        assert!(matches!(file, Err(VfsError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"hello world").await;

        let data = backend.read(Path::new("test.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_partial_read() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"hello world").await;

        let data = backend.read(Path::new("test.txt"), 6, 5).await.unwrap();
        assert_eq!(data, b"world");
    }

    #[tokio::test]
    async fn test_leading_slash_is_mount_relative() {
        let (backend, dir) = setup();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let attr = backend.getattr(Path::new("/a.txt")).await.unwrap();
        assert!(attr.is_file());
        assert_eq!(attr.size, 1);
    }

    #[tokio::test]
    async fn test_mkdir_and_readdir() {
        let (backend, _dir) = setup();

        backend
            .mkdir(Path::new("subdir"), 0o755, &caller())
            .await
            .unwrap();
        create_with(&backend, "subdir/file.txt", b"").await;
        create_with(&backend, "root.txt", b"").await;

        let entries = backend.readdir(Path::new("")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);
        assert!(entries[1].kind.is_dir());
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent() {
        let (backend, _dir) = setup();
        let result = backend.mkdir(Path::new("a/b"), 0o755, &caller()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mkdir_existing_fails() {
        let (backend, _dir) = setup();
        backend.mkdir(Path::new("d"), 0o755, &caller()).await.unwrap();
        let err = backend.mkdir(Path::new("d"), 0o755, &caller()).await.unwrap_err();
        match err {
            VfsError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (backend, _dir) = setup();

        let result = backend.read(Path::new("../../../etc/passwd"), 0, 100).await;
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_is_not_followed() {
        let (backend, dir) = setup();
        create_with(&backend, "target.txt", b"content").await;

        backend
            .symlink(Path::new("link.txt"), Path::new("target.txt"), &caller())
            .await
            .unwrap();

        let target = backend.readlink(Path::new("link.txt")).await.unwrap();
        assert_eq!(target, Path::new("target.txt"));
        assert!(backend.getattr(Path::new("link.txt")).await.unwrap().is_symlink());

        backend.unlink(Path::new("link.txt"), &caller()).await.unwrap();
        assert!(dir.path().join("target.txt").exists());
    }

    #[tokio::test]
    async fn test_rename() {
        let (backend, _dir) = setup();
        create_with(&backend, "old.txt", b"content").await;

        backend
            .rename(Path::new("old.txt"), Path::new("new.txt"), &caller())
            .await
            .unwrap();

        assert!(!backend.exists(Path::new("old.txt")).await);
        let data = backend.read(Path::new("new.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"content");
    }

    #[tokio::test]
    async fn test_truncate() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"hello world").await;

        backend
            .truncate(Path::new("test.txt"), 5, &caller())
            .await
            .unwrap();

        let data = backend.read(Path::new("test.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_open_applies_truncate_flag() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"hello world").await;

        let flags = OpenFlags::from_raw(libc::O_WRONLY | libc::O_TRUNC);
        let attr = backend
            .open(Path::new("test.txt"), flags, &caller())
            .await
            .unwrap();
        assert_eq!(attr.size, 0);
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let (backend, _dir) = setup();
        let result = backend
            .open(Path::new("missing.txt"), OpenFlags::read(), &caller())
            .await;
        match result {
            Err(VfsError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_exclusive_on_existing_fails() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"keep").await;

        let result = backend
            .create(
                Path::new("test.txt"),
                0o644,
                OpenFlags::create_exclusive(),
                &caller(),
            )
            .await;
        assert!(result.is_err());
        let data = backend.read(Path::new("test.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"keep");
    }

    #[tokio::test]
    async fn test_create_applies_mode() {
        let (backend, _dir) = setup();
        let attr = backend
            .create(Path::new("m.txt"), 0o600, OpenFlags::create(), &caller())
            .await
            .unwrap();
        // umask can only remove bits
        assert_eq!(attr.perm & !0o600, 0);
    }

    #[tokio::test]
    async fn test_hard_link() {
        let (backend, _dir) = setup();
        create_with(&backend, "original.txt", b"shared content").await;

        backend
            .link(Path::new("original.txt"), Path::new("linked.txt"), &caller())
            .await
            .unwrap();

        let data = backend.read(Path::new("linked.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"shared content");

        let attr = backend.getattr(Path::new("original.txt")).await.unwrap();
        assert!(attr.nlink >= 2);
    }

    #[tokio::test]
    async fn test_setattr_perm_and_size() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"hello world").await;

        let attr = backend
            .setattr(
                Path::new("test.txt"),
                SetAttr::new().with_size(2).with_perm(0o640),
                &caller(),
            )
            .await
            .unwrap();
        assert_eq!(attr.size, 2);
        assert_eq!(attr.perm, 0o640);
    }

    #[tokio::test]
    async fn test_setattr_mtime() {
        let (backend, _dir) = setup();
        create_with(&backend, "test.txt", b"x").await;

        let when = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let attr = backend
            .setattr(Path::new("test.txt"), SetAttr::new().with_mtime(when), &caller())
            .await
            .unwrap();
        assert_eq!(attr.mtime, when);
    }

    #[tokio::test]
    async fn test_chown_as_root() {
        if !rustix::process::geteuid().is_root() {
            return;
        }
        let (backend, _dir) = setup();
        create_with(&backend, "owned.txt", b"").await;

        backend
            .chown(Path::new("owned.txt"), 4242, 4343, &caller())
            .await
            .unwrap();

        let attr = backend.getattr(Path::new("owned.txt")).await.unwrap();
        assert_eq!(attr.uid, Some(4242));
        assert_eq!(attr.gid, Some(4343));
    }

    #[tokio::test]
    async fn test_statfs() {
        let (backend, _dir) = setup();
        let stat = backend.statfs().await.unwrap();
        assert!(stat.bsize > 0);
        assert!(stat.namelen > 0);
    }

    #[tokio::test]
    async fn test_open_refuses_symlink_alias() {
        let (backend, dir) = setup();
        create_with(&backend, "target.txt", b"content").await;
        backend
            .symlink(Path::new("alias"), Path::new("target.txt"), &caller())
            .await
            .unwrap();

        let flags = OpenFlags::from_raw(libc::O_WRONLY | libc::O_TRUNC);
        let err = backend.open(Path::new("alias"), flags, &caller()).await.unwrap_err();
        match err {
            VfsError::Io(e) => assert_eq!(e.raw_os_error(), Some(libc::ELOOP)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(backend.write(Path::new("alias"), 0, b"x").await.is_err());
        assert_eq!(std::fs::read(dir.path().join("target.txt")).unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_chown_to_self() {
        let (backend, _dir) = setup();
        create_with(&backend, "mine.txt", b"").await;
        let uid = rustix::process::geteuid().as_raw();
        let gid = rustix::process::getegid().as_raw();

        backend
            .chown(Path::new("mine.txt"), uid, gid, &caller())
            .await
            .unwrap();
        let attr = backend.getattr(Path::new("mine.txt")).await.unwrap();
        assert_eq!((attr.uid, attr.gid), (Some(uid), Some(gid)));
    }

    #[test]
    fn test_unix_time() {
        assert_eq!(unix_time(0, 0), UNIX_EPOCH);
        assert_eq!(
            unix_time(10, 500),
            UNIX_EPOCH + Duration::from_secs(10) + Duration::from_nanos(500)
        );
        assert_eq!(unix_time(-10, 0), UNIX_EPOCH - Duration::from_secs(10));
    }
}
