//! In-memory backend.
//!
//! Lets the policy engine be exercised without a real directory tree or
//! privileges. Names map to nodes, so hard links share content the way they
//! do on disk.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::VfsOps;
use crate::vfs::types::{Caller, DirEntry, FileAttr, FileType, OpenFlags, SetAttr, StatFs};

const BLOCK_SIZE: u64 = 4096;
const TOTAL_BLOCKS: u64 = 1 << 20;
const TOTAL_NODES: u64 = 1 << 20;

type NodeId = u64;

#[derive(Debug)]
enum Body {
    File(Vec<u8>),
    Dir,
    Symlink(PathBuf),
}

#[derive(Debug)]
struct Node {
    attr: FileAttr,
    body: Body,
}

fn os_error(code: i32) -> VfsError {
    VfsError::Io(io::Error::from_raw_os_error(code))
}

impl Node {
    fn data(&self, path: &Path) -> VfsResult<&Vec<u8>> {
        match &self.body {
            Body::File(data) => Ok(data),
            Body::Dir => Err(VfsError::is_a_directory(path)),
            Body::Symlink(_) => Err(os_error(libc::ELOOP)),
        }
    }

    fn data_mut(&mut self, path: &Path) -> VfsResult<&mut Vec<u8>> {
        match &mut self.body {
            Body::File(data) => Ok(data),
            Body::Dir => Err(VfsError::is_a_directory(path)),
            Body::Symlink(_) => Err(os_error(libc::ELOOP)),
        }
    }

    fn resize(&mut self, path: &Path, size: u64) -> VfsResult<()> {
        self.data_mut(path)?.resize(size as usize, 0);
        self.attr.size = size;
        self.attr.mtime = SystemTime::now();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tree {
    names: HashMap<PathBuf, NodeId>,
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
}

impl Tree {
    fn get(&self, path: &Path) -> VfsResult<&Node> {
        self.names
            .get(path)
            .and_then(|id| self.nodes.get(id))
            .ok_or_else(|| VfsError::not_found(path))
    }

    fn get_mut(&mut self, path: &Path) -> VfsResult<&mut Node> {
        let id = self
            .names
            .get(path)
            .ok_or_else(|| VfsError::not_found(path))?;
        self.nodes
            .get_mut(id)
            .ok_or_else(|| VfsError::not_found(path))
    }

    fn add(&mut self, path: PathBuf, attr: FileAttr, body: Body) -> FileAttr {
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(path, id);
        self.nodes.insert(
            id,
            Node {
                attr: attr.clone(),
                body,
            },
        );
        attr
    }

    /// Remove one name. The node goes away with its last name.
    fn drop_name(&mut self, path: &Path) {
        let Some(id) = self.names.remove(path) else {
            return;
        };
        if self.names.values().any(|&other| other == id) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.attr.nlink = node.attr.nlink.saturating_sub(1);
            }
        } else {
            self.nodes.remove(&id);
        }
    }

    fn children<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = (&'a PathBuf, NodeId)> + 'a {
        self.names
            .iter()
            .filter(move |(name, _)| name.parent() == Some(dir))
            .map(|(name, &id)| (name, id))
    }

    fn require_parent_dir(&self, path: &Path) -> VfsResult<()> {
        let parent = path.parent().unwrap_or(Path::new(""));
        match self.get(parent)?.body {
            Body::Dir => Ok(()),
            _ => Err(VfsError::not_a_directory(parent)),
        }
    }

    fn require_vacant(&self, path: &Path) -> VfsResult<()> {
        if self.names.contains_key(path) {
            Err(VfsError::already_exists(path))
        } else {
            Ok(())
        }
    }
}

/// Canonical key for a mount-relative path. `..` is refused, as in
/// [`LocalBackend`](super::LocalBackend).
fn key(path: &Path) -> VfsResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(VfsError::path_escapes_root(path));
            }
        }
    }
    Ok(out)
}

/// In-memory filesystem. Everything is lost on drop.
///
/// New entries are owned by the backend's owner identity (root by
/// default), the way a privileged mount process would own them, so
/// ownership changes made on top of it stay observable.
#[derive(Debug)]
pub struct MemoryBackend {
    tree: RwLock<Tree>,
    owner: (u32, u32),
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty tree owned by root.
    pub fn new() -> Self {
        Self::with_owner(0, 0)
    }

    /// An empty tree whose entries are created with the given owner.
    pub fn with_owner(uid: u32, gid: u32) -> Self {
        let mut tree = Tree::default();
        tree.add(
            PathBuf::new(),
            FileAttr::new(FileType::Directory, 0o755).with_owner(uid, gid),
            Body::Dir,
        );
        Self {
            tree: RwLock::new(tree),
            owner: (uid, gid),
        }
    }

    /// Seed a file directly, creating missing parent directories and
    /// replacing any existing file of that name. Used for fixtures.
    pub fn insert_file(&self, path: impl AsRef<Path>, data: &[u8]) -> VfsResult<()> {
        let path = key(path.as_ref())?;
        let mut tree = self.tree.write();

        let mut dir = PathBuf::new();
        for name in path.parent().into_iter().flat_map(Path::components) {
            dir.push(name);
            match tree.get(&dir) {
                Ok(Node { body: Body::Dir, .. }) => {}
                Ok(_) => return Err(VfsError::not_a_directory(&dir)),
                Err(_) => {
                    let attr = self.stamp(FileAttr::new(FileType::Directory, 0o755));
                    tree.add(dir.clone(), attr, Body::Dir);
                }
            }
        }

        tree.drop_name(&path);
        let attr = self.stamp(FileAttr::new(FileType::File, 0o644).with_size(data.len() as u64));
        tree.add(path, attr, Body::File(data.to_vec()));
        Ok(())
    }

    fn stamp(&self, attr: FileAttr) -> FileAttr {
        attr.with_owner(self.owner.0, self.owner.1)
    }
}

#[async_trait]
impl VfsOps for MemoryBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let path = key(path)?;
        Ok(self.tree.read().get(&path)?.attr.clone())
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let path = key(path)?;
        let tree = self.tree.read();
        if !matches!(tree.get(&path)?.body, Body::Dir) {
            return Err(VfsError::not_a_directory(&path));
        }

        let mut entries: Vec<DirEntry> = tree
            .children(&path)
            .filter_map(|(name, id)| {
                Some(DirEntry {
                    name: name.file_name()?.to_string_lossy().into_owned(),
                    kind: tree.nodes.get(&id)?.attr.kind,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let path = key(path)?;
        let tree = self.tree.read();
        let data = tree.get(&path)?.data(&path)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        let path = key(path)?;
        match &self.tree.read().get(&path)?.body {
            Body::Symlink(target) => Ok(target.clone()),
            _ => Err(VfsError::not_a_symlink(&path)),
        }
    }

    async fn write(&self, path: &Path, offset: u64, bytes: &[u8]) -> VfsResult<u32> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        let node = tree.get_mut(&path)?;

        let data = node.data_mut(&path)?;
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        let len = data.len() as u64;

        node.attr.size = len;
        node.attr.mtime = SystemTime::now();
        Ok(bytes.len() as u32)
    }

    async fn open(&self, path: &Path, flags: OpenFlags, _caller: &Caller) -> VfsResult<FileAttr> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        let node = tree.get_mut(&path)?;

        match node.body {
            Body::Dir if flags.is_mutating() => return Err(VfsError::is_a_directory(&path)),
            Body::Symlink(_) => return Err(os_error(libc::ELOOP)),
            _ => {}
        }
        if flags.truncate {
            node.resize(&path, 0)?;
        }
        Ok(node.attr.clone())
    }

    async fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: OpenFlags,
        _caller: &Caller,
    ) -> VfsResult<FileAttr> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        tree.require_parent_dir(&path)?;

        if tree.names.contains_key(&path) {
            if flags.exclusive {
                return Err(VfsError::already_exists(&path));
            }
            let node = tree.get_mut(&path)?;
            node.data(&path)?;
            if flags.truncate {
                node.resize(&path, 0)?;
            }
            return Ok(node.attr.clone());
        }

        let attr = self.stamp(FileAttr::new(FileType::File, mode));
        Ok(tree.add(path, attr, Body::File(Vec::new())))
    }

    async fn mkdir(&self, path: &Path, mode: u32, _caller: &Caller) -> VfsResult<FileAttr> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        tree.require_parent_dir(&path)?;
        tree.require_vacant(&path)?;

        let attr = self.stamp(FileAttr::new(FileType::Directory, mode));
        Ok(tree.add(path, attr, Body::Dir))
    }

    async fn unlink(&self, path: &Path, _caller: &Caller) -> VfsResult<()> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        if tree.get(&path)?.attr.is_dir() {
            return Err(VfsError::is_a_directory(&path));
        }
        tree.drop_name(&path);
        Ok(())
    }

    async fn rmdir(&self, path: &Path, _caller: &Caller) -> VfsResult<()> {
        let path = key(path)?;
        if path.as_os_str().is_empty() {
            return Err(os_error(libc::EBUSY));
        }

        let mut tree = self.tree.write();
        if !tree.get(&path)?.attr.is_dir() {
            return Err(VfsError::not_a_directory(&path));
        }
        if tree.children(&path).next().is_some() {
            return Err(VfsError::directory_not_empty(&path));
        }
        tree.drop_name(&path);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path, _caller: &Caller) -> VfsResult<()> {
        let from = key(from)?;
        let to = key(to)?;
        let mut tree = self.tree.write();

        tree.get(&from)?;
        tree.require_parent_dir(&to)?;
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(os_error(libc::EINVAL));
        }
        if let Ok(target) = tree.get(&to) {
            if target.attr.is_dir() && tree.children(&to).next().is_some() {
                return Err(VfsError::directory_not_empty(&to));
            }
            tree.drop_name(&to);
        }

        // A directory carries every name below it.
        let moved: Vec<(PathBuf, NodeId)> = tree
            .names
            .iter()
            .filter(|(name, _)| name.starts_with(&from))
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        for (old, id) in moved {
            tree.names.remove(&old);
            let rest = old.strip_prefix(&from).unwrap_or(Path::new(""));
            let new = if rest.as_os_str().is_empty() {
                to.clone()
            } else {
                to.join(rest)
            };
            tree.names.insert(new, id);
        }
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64, _caller: &Caller) -> VfsResult<()> {
        let path = key(path)?;
        self.tree.write().get_mut(&path)?.resize(&path, size)
    }

    async fn setattr(&self, path: &Path, set: SetAttr, _caller: &Caller) -> VfsResult<FileAttr> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        let node = tree.get_mut(&path)?;

        if let Some(size) = set.size {
            node.resize(&path, size)?;
        }
        let attr = &mut node.attr;
        if let Some(mtime) = set.mtime {
            attr.mtime = mtime;
        }
        if let Some(atime) = set.atime {
            attr.atime = Some(atime);
        }
        if let Some(perm) = set.perm {
            attr.perm = perm & 0o7777;
        }
        if let Some(uid) = set.uid {
            attr.uid = Some(uid);
        }
        if let Some(gid) = set.gid {
            attr.gid = Some(gid);
        }
        Ok(attr.clone())
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32, _caller: &Caller) -> VfsResult<()> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        let attr = &mut tree.get_mut(&path)?.attr;
        attr.uid = Some(uid);
        attr.gid = Some(gid);
        attr.ctime = Some(SystemTime::now());
        Ok(())
    }

    async fn symlink(&self, path: &Path, target: &Path, _caller: &Caller) -> VfsResult<FileAttr> {
        let path = key(path)?;
        let mut tree = self.tree.write();
        tree.require_parent_dir(&path)?;
        tree.require_vacant(&path)?;

        let len = target.as_os_str().len() as u64;
        let attr = self.stamp(FileAttr::new(FileType::Symlink, 0o777).with_size(len));
        Ok(tree.add(path, attr, Body::Symlink(target.to_path_buf())))
    }

    async fn link(&self, oldpath: &Path, newpath: &Path, _caller: &Caller) -> VfsResult<FileAttr> {
        let oldpath = key(oldpath)?;
        let newpath = key(newpath)?;
        let mut tree = self.tree.write();
        tree.require_parent_dir(&newpath)?;
        tree.require_vacant(&newpath)?;

        let id = *tree
            .names
            .get(&oldpath)
            .ok_or_else(|| VfsError::not_found(&oldpath))?;
        let node = tree
            .nodes
            .get_mut(&id)
            .ok_or_else(|| VfsError::not_found(&oldpath))?;
        if node.attr.is_dir() {
            return Err(os_error(libc::EPERM));
        }
        node.attr.nlink += 1;
        node.attr.ctime = Some(SystemTime::now());
        let attr = node.attr.clone();

        tree.names.insert(newpath, id);
        Ok(attr)
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        let tree = self.tree.read();
        let used: u64 = tree
            .nodes
            .values()
            .map(|node| node.attr.size.div_ceil(BLOCK_SIZE))
            .sum();
        let free = TOTAL_BLOCKS.saturating_sub(used);
        Ok(StatFs {
            blocks: TOTAL_BLOCKS,
            bfree: free,
            bavail: free,
            files: TOTAL_NODES,
            ffree: TOTAL_NODES.saturating_sub(tree.nodes.len() as u64),
            bsize: BLOCK_SIZE as u32,
            namelen: 255,
            frsize: BLOCK_SIZE as u32,
        })
    }
}
