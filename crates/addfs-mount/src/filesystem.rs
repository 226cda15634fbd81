//! `fuser::Filesystem` adapter over a path-based [`VfsOps`].
//!
//! Each callback resolves its inodes to paths on the FUSE thread, then runs
//! the filesystem call on the tokio runtime and replies from there, so
//! slow operations do not hold up the session loop.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use addfs_kernel::{Caller, FileAttr, FileType, OpenFlags, SetAttr, VfsOps};
use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::errno::ToErrno;
use crate::handles::HandleTable;
use crate::inode::{InodeTable, ROOT_INO};

/// Attribute and entry cache timeout.
const TTL: Duration = Duration::from_secs(1);

/// Reported for directory entries the kernel has not looked up yet.
const UNKNOWN_INO: u64 = u64::MAX;

/// Preferred I/O size reported in attributes.
const BLOCK_SIZE: u32 = 4096;

/// The addfs FUSE filesystem.
pub struct AddFs {
    vfs: Arc<dyn VfsOps>,
    inodes: Arc<InodeTable>,
    handles: Arc<HandleTable>,
    runtime: Handle,
    unmounted: Arc<Notify>,
}

impl AddFs {
    /// Serve `vfs` (normally a policy engine), running operations on
    /// `runtime`.
    pub fn new(vfs: Arc<dyn VfsOps>, runtime: Handle) -> Self {
        Self {
            vfs,
            inodes: Arc::new(InodeTable::new()),
            handles: Arc::new(HandleTable::new()),
            runtime,
            unmounted: Arc::new(Notify::new()),
        }
    }

    /// Notified once the kernel tears the session down, whoever unmounted.
    pub fn unmount_signal(&self) -> Arc<Notify> {
        self.unmounted.clone()
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }
}

/// Identity of the process behind a request.
fn caller(req: &Request<'_>) -> Caller {
    Caller::new(req.uid(), req.gid()).with_pid(req.pid())
}

fn to_fuse_kind(kind: FileType) -> fuser::FileType {
    match kind {
        FileType::File => fuser::FileType::RegularFile,
        FileType::Directory => fuser::FileType::Directory,
        FileType::Symlink => fuser::FileType::Symlink,
    }
}

/// Convert backend attributes to the kernel's form.
pub fn to_fuse_attr(ino: u64, attr: &FileAttr) -> fuser::FileAttr {
    let atime = attr.atime.unwrap_or(attr.mtime);
    let ctime = attr.ctime.unwrap_or(attr.mtime);
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime,
        mtime: attr.mtime,
        ctime,
        crtime: ctime,
        kind: to_fuse_kind(attr.kind),
        perm: (attr.perm & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid.unwrap_or(0),
        gid: attr.gid.unwrap_or(0),
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn to_system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Mark `set` as arriving through `fh` when that handle was opened for
/// writing. A read-only handle leaves the change to the path policy.
fn through_handle(set: SetAttr, handles: &HandleTable, fh: Option<u64>) -> SetAttr {
    if fh.is_some_and(|fh| handles.is_writable(fh)) {
        set.via_handle()
    } else {
        set
    }
}

/// Reply with a new entry, counting the kernel's lookup.
fn reply_entry(inodes: &InodeTable, path: &Path, attr: &FileAttr, reply: ReplyEntry) {
    let ino = inodes.lookup(path);
    reply.entry(&TTL, &to_fuse_attr(ino, attr), 0);
}

impl Filesystem for AddFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("addfs filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            inodes = self.inodes.len(),
            open_handles = self.handles.len(),
            "addfs filesystem destroyed"
        );
        self.unmounted.notify_one();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        trace!(path = %path.display(), "lookup");

        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.getattr(&path).await {
                Ok(attr) => reply_entry(&inodes, &path, &attr, reply),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        trace!(inode = ino, "getattr");

        let vfs = self.vfs.clone();
        self.runtime.spawn(async move {
            match vfs.getattr(&path).await {
                Ok(attr) => reply.attr(&TTL, &to_fuse_attr(ino, &attr)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, ?fh, "setattr");

        let set = SetAttr {
            size,
            mtime: mtime.map(to_system_time),
            atime: atime.map(to_system_time),
            perm: mode.map(|m| m & 0o7777),
            uid,
            gid,
            via_handle: false,
        };
        let set = through_handle(set, &self.handles, fh);

        let caller = caller(req);
        let vfs = self.vfs.clone();
        self.runtime.spawn(async move {
            match vfs.setattr(&path, set, &caller).await {
                Ok(attr) => reply.attr(&TTL, &to_fuse_attr(ino, &attr)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let vfs = self.vfs.clone();
        self.runtime.spawn(async move {
            match vfs.readlink(&path).await {
                Ok(target) => reply.data(target.as_os_str().as_bytes()),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.mkdir(&path, mode & !umask, &caller).await {
                Ok(attr) => reply_entry(&inodes, &path, &attr, reply),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.unlink(&path, &caller).await {
                Ok(()) => {
                    inodes.remove(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.rmdir(&path, &caller).await {
                Ok(()) => {
                    inodes.remove(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let caller = caller(req);
        let target = target.to_path_buf();
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.symlink(&path, &target, &caller).await {
                Ok(attr) => reply_entry(&inodes, &path, &attr, reply),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE / RENAME_EXCHANGE are not passed through.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (Some(from), Some(to)) = (
            self.inodes.child_path(parent, name),
            self.inodes.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.rename(&from, &to, &caller).await {
                Ok(()) => {
                    inodes.rename(&from, &to);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(oldpath), Some(newpath)) = (
            self.inodes.path(ino),
            self.inodes.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match vfs.link(&oldpath, &newpath, &caller).await {
                Ok(attr) => reply_entry(&inodes, &newpath, &attr, reply),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let flags = OpenFlags::from_raw(flags);
        trace!(inode = ino, ?flags, "open");

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let handles = self.handles.clone();
        self.runtime.spawn(async move {
            match vfs.open(&path, flags, &caller).await {
                Ok(_) => reply.opened(handles.insert(ino, flags.is_mutating()), 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        trace!(inode = ino, fh, offset, size, "read");

        let vfs = self.vfs.clone();
        self.runtime.spawn(async move {
            match vfs.read(&path, offset.max(0) as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // The kernel only writes through handles the open callback granted.
        if !self.handles.is_writable(fh) {
            reply.error(libc::EBADF);
            return;
        }
        trace!(inode = ino, fh, offset, size = data.len(), "write");

        let data = data.to_vec();
        let vfs = self.vfs.clone();
        self.runtime.spawn(async move {
            match vfs.write(&path, offset.max(0) as u64, &data).await {
                Ok(n) => reply.written(n),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "release");
        self.handles.remove(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.peek(p))
            .unwrap_or(ROOT_INO);

        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            let entries = match vfs.readdir(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            };

            let mut listing: Vec<(u64, fuser::FileType, PathBuf)> = vec![
                (ino, fuser::FileType::Directory, PathBuf::from(".")),
                (parent_ino, fuser::FileType::Directory, PathBuf::from("..")),
            ];
            for entry in entries {
                let child = inodes
                    .peek(&path.join(&entry.name))
                    .unwrap_or(UNKNOWN_INO);
                listing.push((child, to_fuse_kind(entry.kind), PathBuf::from(entry.name)));
            }

            for (i, (child, kind, name)) in listing
                .into_iter()
                .enumerate()
                .skip(offset.max(0) as usize)
            {
                if reply.add(child, (i + 1) as i64, kind, name.as_os_str()) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let vfs = self.vfs.clone();
        self.runtime.spawn(async move {
            match vfs.statfs().await {
                Ok(st) => reply.statfs(
                    st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                    st.frsize,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let open_flags = OpenFlags::from_raw(flags);
        debug!(path = %path.display(), ?open_flags, "create");

        let caller = caller(req);
        let vfs = self.vfs.clone();
        let inodes = self.inodes.clone();
        let handles = self.handles.clone();
        self.runtime.spawn(async move {
            match vfs.create(&path, mode & !umask, open_flags, &caller).await {
                Ok(attr) => {
                    let ino = inodes.lookup(&path);
                    let fh = handles.insert(ino, open_flags.is_mutating());
                    reply.created(&TTL, &to_fuse_attr(ino, &attr), 0, fh, 0);
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }
}
