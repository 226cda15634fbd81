//! Open file handle tracking.
//!
//! I/O is path-based, so a handle carries no file descriptor. It only
//! remembers which inode it was opened on and whether write access was
//! granted at open time, which later decides whether a truncate issued
//! through the handle needs a fresh policy decision.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
pub struct OpenHandle {
    pub ino: u64,
    pub writable: bool,
}

/// Concurrent table of open handles.
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Register a newly opened file and return its handle number.
    pub fn insert(&self, ino: u64, writable: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, OpenHandle { ino, writable });
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.get(&fh).map(|h| *h)
    }

    /// True if `fh` is open and was granted write access.
    pub fn is_writable(&self, fh: u64) -> bool {
        self.get(fh).is_some_and(|h| h.writable)
    }

    pub fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let table = HandleTable::new();
        let a = table.insert(2, false);
        let b = table.insert(2, true);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_writable_tracking() {
        let table = HandleTable::new();
        let ro = table.insert(5, false);
        let rw = table.insert(5, true);

        assert!(!table.is_writable(ro));
        assert!(table.is_writable(rw));
        assert!(!table.is_writable(999));

        assert_eq!(table.remove(rw).map(|h| h.ino), Some(5));
        assert!(!table.is_writable(rw));
        assert_eq!(table.len(), 1);
    }
}
