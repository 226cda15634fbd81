//! Inode number ↔ path mapping.
//!
//! The kernel talks in inode numbers; the policy engine and backends talk
//! in mount-relative paths. The root directory is inode 1 with the empty
//! path. Other inodes are allocated on first lookup and released when the
//! kernel forgets them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Inode number of the mount root.
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

#[derive(Debug)]
struct Node {
    path: PathBuf,
    lookups: u64,
}

#[derive(Debug)]
struct Inner {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

/// Thread-safe inode table with kernel lookup counts.
#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                path: PathBuf::new(),
                lookups: 1,
            },
        );
        by_path.insert(PathBuf::new(), ROOT_INO);
        Self {
            inner: RwLock::new(Inner {
                nodes,
                by_path,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// Path of an inode.
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inner.read().nodes.get(&ino).map(|n| n.path.clone())
    }

    /// Path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inner
            .read()
            .nodes
            .get(&parent)
            .map(|n| n.path.join(name))
    }

    /// Inode currently assigned to `path`, without counting a lookup.
    pub fn peek(&self, path: &Path) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Inode for `path`, allocating one if needed, and count one kernel
    /// lookup against it.
    ///
    /// Call exactly once for every entry handed to the kernel.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }

        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.nodes.insert(
            ino,
            Node {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        inner.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the inode is released at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups > 0 {
            return;
        }
        if let Some(node) = inner.nodes.remove(&ino) {
            if inner.by_path.get(&node.path) == Some(&ino) {
                inner.by_path.remove(&node.path);
            }
        }
    }

    /// Detach `path` after it was removed. Its inode lives on until
    /// forgotten, but the name can be reused by a new entry.
    pub fn remove(&self, path: &Path) {
        self.inner.write().by_path.remove(path);
    }

    /// Move `from` and everything beneath it to `to`.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inner = self.inner.write();
        let Inner { nodes, by_path, .. } = &mut *inner;

        // Whatever was at the destination has been replaced.
        by_path.retain(|p, _| !p.starts_with(to));

        let moved: Vec<(PathBuf, u64)> = by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        for (old, ino) in moved {
            let Ok(rest) = old.strip_prefix(from) else {
                continue;
            };
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            by_path.remove(&old);
            if let Some(node) = nodes.get_mut(&ino) {
                node.path = new.clone();
            }
            by_path.insert(new, ino);
        }
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::new()));
        assert_eq!(
            table.child_path(ROOT_INO, OsStr::new("log")),
            Some(PathBuf::from("log"))
        );
        table.forget(ROOT_INO, 100);
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::new()));
    }

    #[test]
    fn test_lookup_reuses_inode() {
        let table = InodeTable::new();
        let a = table.lookup(Path::new("log/a.txt"));
        let b = table.lookup(Path::new("log/a.txt"));
        assert_eq!(a, b);
        assert_ne!(a, ROOT_INO);
        assert_eq!(table.peek(Path::new("log/a.txt")), Some(a));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_forget_releases_at_zero() {
        let table = InodeTable::new();
        let ino = table.lookup(Path::new("a"));
        table.lookup(Path::new("a"));

        table.forget(ino, 1);
        assert!(table.path(ino).is_some());

        table.forget(ino, 1);
        assert!(table.path(ino).is_none());
        assert!(table.peek(Path::new("a")).is_none());
    }

    #[test]
    fn test_remove_keeps_inode_until_forget() {
        let table = InodeTable::new();
        let old = table.lookup(Path::new("a"));
        table.remove(Path::new("a"));
        assert_eq!(table.path(old), Some(PathBuf::from("a")));

        let new = table.lookup(Path::new("a"));
        assert_ne!(old, new);

        // Forgetting the stale inode must not unmap the new one.
        table.forget(old, 1);
        assert_eq!(table.peek(Path::new("a")), Some(new));
    }

    #[test]
    fn test_rename_moves_descendants() {
        let table = InodeTable::new();
        let dir = table.lookup(Path::new("old"));
        let file = table.lookup(Path::new("old/a.txt"));
        let other = table.lookup(Path::new("older/b.txt"));

        table.rename(Path::new("old"), Path::new("new"));

        assert_eq!(table.path(dir), Some(PathBuf::from("new")));
        assert_eq!(table.path(file), Some(PathBuf::from("new/a.txt")));
        assert_eq!(table.path(other), Some(PathBuf::from("older/b.txt")));
        assert_eq!(table.peek(Path::new("new/a.txt")), Some(file));
        assert!(table.peek(Path::new("old/a.txt")).is_none());
    }

    #[test]
    fn test_rename_over_existing_target() {
        let table = InodeTable::new();
        let src = table.lookup(Path::new("a"));
        let dst = table.lookup(Path::new("b"));

        table.rename(Path::new("a"), Path::new("b"));

        assert_eq!(table.peek(Path::new("b")), Some(src));
        assert_eq!(table.path(dst), Some(PathBuf::from("b")));
        table.forget(dst, 1);
        assert_eq!(table.peek(Path::new("b")), Some(src));
    }
}
