//! Open file handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::layer::LayerId;
use crate::vpath::VirtualPath;

/// An open file: the descriptor resolved at open time plus bookkeeping.
///
/// The descriptor is never re-resolved, so a rebind or a later copy-up does
/// not redirect a handle that is already open.
#[derive(Debug)]
pub struct OpenFileHandle {
    /// Dispatcher-issued handle id
    pub fh: u64,
    /// Virtual path, kept current across renames
    path: RwLock<VirtualPath>,
    file: File,
    /// Open flags
    pub flags: i32,
    /// Layer the descriptor was opened in
    pub layer: LayerId,
    pub rank: usize,
    /// Opened after the entry was materialized in the writable layer
    pub post_copy_up: bool,
    dirty: AtomicBool,
}

impl OpenFileHandle {
    pub fn path(&self) -> VirtualPath {
        self.path.read().clone()
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn read_at(&self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.write_all_at(data, offset)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(data.len())
    }

    /// Flush to stable storage; clears the dirty flag
    pub fn sync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Table of open handles for one dispatcher
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenFileHandle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open descriptor and return its handle id
    pub fn insert(
        &self,
        path: VirtualPath,
        file: File,
        flags: i32,
        layer: LayerId,
        rank: usize,
        post_copy_up: bool,
    ) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = OpenFileHandle {
            fh,
            path: RwLock::new(path),
            file,
            flags,
            layer,
            rank,
            post_copy_up,
            dirty: AtomicBool::new(false),
        };
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<OpenFileHandle>> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::BadHandle(fh))
    }

    /// Close handle and return it
    pub fn remove(&self, fh: u64) -> Result<Arc<OpenFileHandle>> {
        self.handles.write().remove(&fh).ok_or(Error::BadHandle(fh))
    }

    /// Follow a rename of `from` (and anything below it) to `to`
    pub fn rename_subtree(&self, from: &VirtualPath, to: &VirtualPath) {
        for handle in self.handles.read().values() {
            let mut path = handle.path.write();
            if let Some(moved) = path.rebase(from, to) {
                *path = moved;
            }
        }
    }

    /// Handles currently open on `path`
    pub fn handles_for_path(&self, path: &VirtualPath) -> Vec<u64> {
        self.handles
            .read()
            .values()
            .filter(|h| &*h.path.read() == path)
            .map(|h| h.fh)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
