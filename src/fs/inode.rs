//! Inode numbering
//!
//! The kernel addresses entries by inode number while the dispatcher works
//! on virtual paths. Numbers are handed out on first sight of a path and
//! follow the path through renames. Every entry reply counts as a kernel
//! lookup; a number is dropped once the kernel forgets all of them.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::vpath::VirtualPath;

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

/// Reported in listings for entries the kernel has not looked up yet
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

struct Inner {
    next_ino: u64,
    paths: HashMap<u64, VirtualPath>,
    inos: HashMap<VirtualPath, u64>,
    lookups: HashMap<u64, u64>,
}

impl Inner {
    fn assign(&mut self, path: &VirtualPath) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.clone());
        self.inos.insert(path.clone(), ino);
        ino
    }

    fn drop_ino(&mut self, ino: u64) {
        if let Some(path) = self.paths.remove(&ino) {
            self.inos.remove(&path);
        }
        self.lookups.remove(&ino);
    }
}

/// Bidirectional inode number <-> virtual path map
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl InodeTable {
    pub fn new() -> Self {
        let root = VirtualPath::root();
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, root.clone());
        inos.insert(root, ROOT_INO);
        Self {
            inner: RwLock::new(Inner {
                next_ino: ROOT_INO + 1,
                paths,
                inos,
                lookups: HashMap::new(),
            }),
        }
    }

    pub fn path(&self, ino: u64) -> Option<VirtualPath> {
        self.inner.read().paths.get(&ino).cloned()
    }

    /// Inode number for `path`, allocating one on first use
    pub fn ino_for(&self, path: &VirtualPath) -> u64 {
        if let Some(ino) = self.inner.read().inos.get(path) {
            return *ino;
        }
        self.inner.write().assign(path)
    }

    /// Number already assigned to `path`, without allocating one
    pub fn peek(&self, path: &VirtualPath) -> Option<u64> {
        self.inner.read().inos.get(path).copied()
    }

    /// Inode number for `path`, counted as one kernel lookup
    pub fn lookup(&self, path: &VirtualPath) -> u64 {
        let mut inner = self.inner.write();
        let ino = inner.assign(path);
        *inner.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    /// Drop `nlookup` kernel lookups of `ino`, releasing the number when
    /// none are left. The root is never released.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.inner.write();
        let remaining = match inner.lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            inner.drop_ino(ino);
        }
    }

    /// Outstanding kernel lookups of `ino`
    pub fn lookup_count(&self, ino: u64) -> u64 {
        self.inner.read().lookups.get(&ino).copied().unwrap_or(0)
    }

    /// Forget `path` and everything below it
    pub fn remove_subtree(&self, path: &VirtualPath) {
        if path.is_root() {
            return;
        }
        let mut inner = self.inner.write();
        let doomed: Vec<VirtualPath> = inner
            .inos
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = inner.inos.get(&p).copied() {
                inner.drop_ino(ino);
            }
        }
    }

    /// Move `from` and its descendants to `to`, keeping their numbers.
    /// Whatever was known at `to` before is forgotten.
    pub fn rename_subtree(&self, from: &VirtualPath, to: &VirtualPath) {
        self.remove_subtree(to);
        let mut inner = self.inner.write();
        let moved: Vec<(VirtualPath, u64)> = inner
            .inos
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            if let Some(new) = old.rebase(from, to) {
                inner.inos.remove(&old);
                inner.inos.insert(new.clone(), ino);
                inner.paths.insert(ino, new);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
