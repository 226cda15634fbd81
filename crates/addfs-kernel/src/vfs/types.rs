//! Value types passed across [`VfsOps`](super::VfsOps).
//!
//! Everything here is addressed by path and knows nothing about FUSE, so
//! the policy engine can be driven directly in tests.

use std::fmt;
use std::time::SystemTime;

/// Kind of a directory entry. Devices, sockets and FIFOs are reported as
/// regular files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn is_file(self) -> bool {
        self == FileType::File
    }

    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }

    pub fn is_symlink(self) -> bool {
        self == FileType::Symlink
    }
}

impl From<std::fs::FileType> for FileType {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        }
    }
}

/// Metadata of one entry, as returned by `getattr` and by every call that
/// produces an entry.
#[derive(Debug, Clone)]
pub struct FileAttr {
    pub size: u64,
    pub kind: FileType,
    /// Permission bits including setuid/setgid/sticky (`& 0o7777`).
    pub perm: u32,
    pub mtime: SystemTime,
    pub atime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub nlink: u32,
    /// Owner, when the backend tracks one.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileAttr {
    /// Fresh attributes for a new, empty entry of `kind`, stamped now.
    pub fn new(kind: FileType, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size: 0,
            kind,
            perm: perm & 0o7777,
            mtime: now,
            atime: Some(now),
            ctime: Some(now),
            nlink: if kind.is_dir() { 2 } else { 1 },
            uid: None,
            gid: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// One name in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// Requested attribute changes. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// The change arrives through a file handle whose write access was
    /// already granted at open time (ftruncate), not through a path.
    pub via_handle: bool,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Mark the change as coming through an already-authorized file handle.
    pub fn via_handle(mut self) -> Self {
        self.via_handle = true;
        self
    }
}

/// Space and inode usage, in `statvfs(3)` terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Flags of an `open(2)`/`creat(2)` call that matter to addfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    /// `O_WRONLY` or `O_RDWR`.
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    /// Decode the raw flag word handed over by the kernel.
    pub fn from_raw(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
            exclusive: flags & libc::O_EXCL != 0,
        }
    }

    /// Returns true if opening with these flags can change existing
    /// content: any of `O_APPEND`, `O_WRONLY`, `O_RDWR` or `O_TRUNC`.
    pub fn is_mutating(&self) -> bool {
        self.write || self.append || self.truncate
    }

    /// `O_RDONLY`.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// `O_WRONLY | O_APPEND`.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            ..Self::default()
        }
    }

    /// `O_RDWR | O_CREAT`.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Self::default()
        }
    }

    /// `O_RDWR | O_CREAT | O_EXCL`.
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// `O_RDWR | O_CREAT | O_TRUNC`.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }
}

/// Identity of the process issuing a filesystem request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    /// Informational only; 0 when unknown.
    pub pid: u32,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid, pid: 0 }
    }

    /// The superuser.
    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} gid={}", self.uid, self.gid)?;
        if self.pid != 0 {
            write!(f, " pid={}", self.pid)?;
        }
        Ok(())
    }
}
