//! Filesystem operation dispatcher
//!
//! Routes each filesystem request for one mount point through the resolver,
//! the copy-up engine and the whiteout tracker to physical I/O. Requests are
//! only served while the mount point is bound in the namespace.
//!
//! Read-only requests (`lookup`, `getattr`, `access`) may be answered from
//! the stack's resolution cache. Every mutation takes the per-path lock,
//! resolves fresh, and invalidates the cache before returning.

mod handle;

pub use handle::{HandleTable, OpenFileHandle};

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};

use crate::copyup::{CopyMode, CopyUpEngine};
use crate::error::{Error, Result};
use crate::layer::{EntryAttr, EntryKind, FsStats, LayerStack};
use crate::lock::PathLocks;
use crate::namespace::Namespace;
use crate::resolver::{MergedEntry, PathResolver, Resolution};
use crate::vpath::{is_reserved, validate_name, VirtualPath};
use crate::whiteout::WhiteoutTracker;

/// Attribute changes requested by `setattr`
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    /// Handle the change was issued through, if any
    pub fh: Option<u64>,
}

impl SetAttr {
    fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}

/// Only the replacing form of rename is supported
const RENAME_NOREPLACE: u32 = 1;

fn accmode_writes(flags: i32) -> bool {
    let accmode = flags & libc::O_ACCMODE;
    accmode == libc::O_WRONLY || accmode == libc::O_RDWR
}

fn errno(code: i32) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(code))
}

/// Request router for one mount point
pub struct Dispatcher {
    namespace: Namespace,
    mount_point: PathBuf,
    handles: HandleTable,
    locks: PathLocks,
}

impl Dispatcher {
    pub fn new(namespace: Namespace, mount_point: &Path, locks: PathLocks) -> Self {
        Self {
            namespace,
            mount_point: Namespace::canonical(mount_point),
            handles: HandleTable::new(),
            locks,
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Whether requests are currently accepted
    pub fn is_mounted(&self) -> bool {
        self.namespace.stack(&self.mount_point).is_ok()
    }

    fn stack(&self) -> Result<Arc<LayerStack>> {
        self.namespace.stack(&self.mount_point)
    }

    fn child(parent: &VirtualPath, name: &OsStr) -> Result<VirtualPath> {
        if is_reserved(name) {
            return Err(Error::NotFound(VirtualPath::parse(parent.as_path().join(name))?));
        }
        parent.join(name)
    }

    /// Require `dir` to resolve to a directory
    fn require_dir(stack: &LayerStack, dir: &VirtualPath) -> Result<()> {
        let found = PathResolver::new(stack).resolve(dir)?.into_found(dir)?;
        if !found.kind.is_dir() {
            return Err(Error::NotDirectory(dir.clone()));
        }
        Ok(())
    }

    fn writable_attr(stack: &LayerStack, path: &VirtualPath) -> Result<EntryAttr> {
        stack
            .writable()
            .backend()
            .stat(path.as_path())?
            .ok_or_else(|| Error::NotFound(path.clone()))
    }

    fn invalidate(stack: &LayerStack, path: &VirtualPath) {
        if let Some(cache) = stack.cache() {
            cache.invalidate_tree(path);
        }
    }

    // ---- read-only requests ----

    pub fn lookup(&self, parent: &VirtualPath, name: &OsStr) -> Result<(VirtualPath, EntryAttr)> {
        let stack = self.stack()?;
        let path = Self::child(parent, name)?;
        let found = PathResolver::new(&stack)
            .resolve_cached(&path)?
            .into_found(&path)?;
        Ok((path, found.attr))
    }

    pub fn getattr(&self, path: &VirtualPath) -> Result<EntryAttr> {
        let stack = self.stack()?;
        let found = PathResolver::new(&stack)
            .resolve_cached(path)?
            .into_found(path)?;
        Ok(found.attr)
    }

    /// Permission bits are enforced by the kernel; this only checks that
    /// the entry resolves
    pub fn access(&self, path: &VirtualPath, mask: i32) -> Result<()> {
        let stack = self.stack()?;
        PathResolver::new(&stack)
            .resolve_cached(path)?
            .into_found(path)?;
        debug!("access {} mask={:#o}", path, mask);
        Ok(())
    }

    pub fn readdir(&self, dir: &VirtualPath) -> Result<Vec<MergedEntry>> {
        let stack = self.stack()?;
        PathResolver::new(&stack).readdir(dir)
    }

    pub fn readlink(&self, path: &VirtualPath) -> Result<PathBuf> {
        let stack = self.stack()?;
        let found = PathResolver::new(&stack).resolve(path)?.into_found(path)?;
        if found.kind != EntryKind::Symlink {
            return Err(errno(libc::EINVAL));
        }
        Ok(stack.layers()[found.rank]
            .backend()
            .read_link(path.as_path())?)
    }

    pub fn statfs(&self) -> Result<FsStats> {
        let stack = self.stack()?;
        Ok(stack.writable().backend().statfs()?)
    }

    // ---- handles ----

    /// Open an existing file. Write modes and `O_TRUNC` copy the file up
    /// first; read-only opens use whichever layer it resolves to.
    pub fn open(&self, path: &VirtualPath, flags: i32) -> Result<u64> {
        let stack = self.stack()?;
        let truncate = flags & libc::O_TRUNC != 0;

        if !accmode_writes(flags) && !truncate {
            let found = PathResolver::new(&stack).resolve(path)?.into_found(path)?;
            if found.kind.is_dir() {
                return Err(Error::IsDirectory(path.clone()));
            }
            let file = stack.layers()[found.rank]
                .backend()
                .open(path.as_path(), OpenOptions::new().read(true))?;
            let fh = self
                .handles
                .insert(path.clone(), file, flags, found.layer, found.rank, found.rank == 0);
            debug!("open {} fh={} read-only from rank {}", path, fh, found.rank);
            return Ok(fh);
        }

        let _guard = self.locks.lock(path)?;
        let found = PathResolver::new(&stack).resolve(path)?.into_found(path)?;
        if found.kind.is_dir() {
            return Err(Error::IsDirectory(path.clone()));
        }
        let mode = if truncate { CopyMode::MetadataOnly } else { CopyMode::Full };
        CopyUpEngine::new(&stack).ensure_writable_with(path, mode)?;

        let accmode = flags & libc::O_ACCMODE;
        let mut options = OpenOptions::new();
        options
            .read(accmode != libc::O_WRONLY)
            .write(accmode != libc::O_RDONLY || truncate)
            .truncate(truncate)
            .custom_flags(flags & libc::O_APPEND);
        let writable = stack.writable();
        let file = writable.backend().open(path.as_path(), &options)?;
        Self::invalidate(&stack, path);

        let fh = self
            .handles
            .insert(path.clone(), file, flags, writable.id.clone(), 0, true);
        debug!("open {} fh={} writable", path, fh);
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let handle = self.handles.get(fh)?;
        Ok(handle.read_at(offset, size)?)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handles.get(fh)?;
        if !handle.is_writable() {
            return Err(Error::BadHandle(fh));
        }
        let path = handle.path();
        let _guard = self.locks.lock(&path)?;
        let written = handle.write_at(offset, data)?;
        if let Ok(stack) = self.stack() {
            Self::invalidate(&stack, &path);
        }
        Ok(written)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        self.handles.get(fh).map(|_| ())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.handles.get(fh)?;
        Ok(handle.sync(datasync)?)
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        debug!(
            "release fh={} path={} dirty={}",
            fh,
            handle.path(),
            handle.is_dirty()
        );
        Ok(())
    }

    // ---- mutations ----

    pub fn setattr(&self, path: &VirtualPath, changes: &SetAttr) -> Result<EntryAttr> {
        let stack = self.stack()?;
        if changes.is_empty() {
            return Ok(PathResolver::new(&stack).resolve(path)?.into_found(path)?.attr);
        }

        let _guard = self.locks.lock(path)?;
        let found = PathResolver::new(&stack).resolve(path)?.into_found(path)?;
        if changes.size.is_some() && found.kind.is_dir() {
            return Err(Error::IsDirectory(path.clone()));
        }
        let mode = if changes.size == Some(0) && found.kind == EntryKind::RegularFile {
            CopyMode::MetadataOnly
        } else {
            CopyMode::Full
        };
        CopyUpEngine::new(&stack).ensure_writable_with(path, mode)?;

        let backend = stack.writable().backend();
        let rel = path.as_path();
        if let Some(size) = changes.size {
            match changes.fh.and_then(|fh| self.handles.get(fh).ok()) {
                Some(handle) if handle.is_writable() => handle.set_len(size)?,
                _ => backend.truncate(rel, size)?,
            }
        }
        if let Some(mode) = changes.mode {
            backend.set_mode(rel, mode & 0o7777)?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            backend.set_owner(rel, changes.uid, changes.gid)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            let current = Self::writable_attr(&stack, path)?;
            backend.set_times(
                rel,
                changes.atime.unwrap_or(current.atime),
                changes.mtime.unwrap_or(current.mtime),
            )?;
        }

        Self::invalidate(&stack, path);
        Self::writable_attr(&stack, path)
    }

    /// Create and open a regular file
    pub fn create(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(VirtualPath, EntryAttr, u64)> {
        let stack = self.stack()?;
        let path = self.prepare_new(&stack, parent, name)?;
        let _guard = self.locks.lock(&path)?;
        let reused = self.claim_name(&stack, &path)?;

        let writable = stack.writable();
        let file = writable
            .backend()
            .create_file(path.as_path(), mode & 0o7777)?;
        Self::invalidate(&stack, &path);
        let attr = Self::writable_attr(&stack, &path)?;

        // The descriptor is always read-write; the handle keeps the caller's flags
        let fh = self
            .handles
            .insert(path.clone(), file, flags, writable.id.clone(), 0, true);
        info!("Created {} (over whiteout: {})", path, reused);
        Ok((path, attr, fh))
    }

    pub fn mkdir(&self, parent: &VirtualPath, name: &OsStr, mode: u32) -> Result<(VirtualPath, EntryAttr)> {
        let stack = self.stack()?;
        let path = self.prepare_new(&stack, parent, name)?;
        let _guard = self.locks.lock(&path)?;
        let reused = self.claim_name(&stack, &path)?;

        stack
            .writable()
            .backend()
            .create_dir(path.as_path(), mode & 0o7777)?;
        if reused {
            // Old lower-layer children stay deleted
            WhiteoutTracker::new(&stack).mark_opaque(&path)?;
        }
        Self::invalidate(&stack, &path);
        info!("Created directory {}", path);
        Ok((path.clone(), Self::writable_attr(&stack, &path)?))
    }

    pub fn symlink(&self, parent: &VirtualPath, name: &OsStr, target: &Path) -> Result<(VirtualPath, EntryAttr)> {
        let stack = self.stack()?;
        let path = self.prepare_new(&stack, parent, name)?;
        let _guard = self.locks.lock(&path)?;
        self.claim_name(&stack, &path)?;

        stack
            .writable()
            .backend()
            .create_symlink(target, path.as_path())?;
        Self::invalidate(&stack, &path);
        debug!("symlink {} -> {:?}", path, target);
        Ok((path.clone(), Self::writable_attr(&stack, &path)?))
    }

    pub fn unlink(&self, parent: &VirtualPath, name: &OsStr) -> Result<()> {
        let stack = self.stack()?;
        let path = Self::child(parent, name)?;
        let _guard = self.locks.lock(&path)?;

        let found = PathResolver::new(&stack).resolve(&path)?.into_found(&path)?;
        if found.kind.is_dir() {
            return Err(Error::IsDirectory(path));
        }
        WhiteoutTracker::new(&stack).record_delete(&path)?;
        Self::invalidate(&stack, &path);
        info!("Removed {}", path);
        Ok(())
    }

    pub fn rmdir(&self, parent: &VirtualPath, name: &OsStr) -> Result<()> {
        let stack = self.stack()?;
        let path = Self::child(parent, name)?;
        let _guard = self.locks.lock(&path)?;

        let resolver = PathResolver::new(&stack);
        let found = resolver.resolve(&path)?.into_found(&path)?;
        if !found.kind.is_dir() {
            return Err(Error::NotDirectory(path));
        }
        if !resolver.is_empty_dir(&path)? {
            return Err(Error::NotEmpty(path));
        }
        WhiteoutTracker::new(&stack).record_delete(&path)?;
        Self::invalidate(&stack, &path);
        info!("Removed directory {}", path);
        Ok(())
    }

    /// Rename within the mount. Directories with lower-layer content are
    /// materialized in full before the move.
    pub fn rename(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        new_parent: &VirtualPath,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        let stack = self.stack()?;
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(errno(libc::EINVAL));
        }
        let from = Self::child(parent, name)?;
        validate_name(new_name)?;
        let to = new_parent.join(new_name)?;
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(Error::InvalidPath(format!("cannot move {} into itself", from)));
        }

        let _guards = self.locks.lock_many(&[&from, &to])?;
        let resolver = PathResolver::new(&stack);
        let source = resolver.resolve(&from)?.into_found(&from)?;
        Self::require_dir(&stack, new_parent)?;

        if let Resolution::Found(dest) = resolver.resolve(&to)? {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(Error::AlreadyExists(to));
            }
            match (source.kind.is_dir(), dest.kind.is_dir()) {
                (true, false) => return Err(Error::NotDirectory(to)),
                (false, true) => return Err(Error::IsDirectory(to)),
                (true, true) if !resolver.is_empty_dir(&to)? => return Err(Error::NotEmpty(to)),
                _ => {}
            }
        }

        let engine = CopyUpEngine::new(&stack);
        let whiteouts = WhiteoutTracker::new(&stack);
        let backend = stack.writable().backend();

        if source.kind.is_dir() {
            engine.copy_up_tree(&from)?;
        } else {
            engine.ensure_writable(&from)?;
        }
        engine.ensure_parent(&to)?;

        if let Some(existing) = backend.stat(to.as_path())? {
            if existing.kind.is_dir() {
                whiteouts.purge_reserved(&to)?;
            }
        }
        whiteouts.clear_whiteout(&to)?;

        backend.rename(from.as_path(), to.as_path())?;

        if source.kind.is_dir() && resolver.resolve_below(&to, 1)?.is_found() {
            whiteouts.mark_opaque(&to)?;
        }
        whiteouts.hide(&from)?;

        Self::invalidate(&stack, &from);
        Self::invalidate(&stack, &to);
        self.handles.rename_subtree(&from, &to);
        info!("Renamed {} -> {}", from, to);
        Ok(())
    }

    /// Validate a new entry's name and parent before taking its lock
    fn prepare_new(&self, stack: &LayerStack, parent: &VirtualPath, name: &OsStr) -> Result<VirtualPath> {
        validate_name(name)?;
        let path = parent.join(name)?;
        Self::require_dir(stack, parent)?;
        Ok(path)
    }

    /// Make `path` ready to be created in the writable layer. Returns true
    /// if the name was whited out before.
    fn claim_name(&self, stack: &LayerStack, path: &VirtualPath) -> Result<bool> {
        match PathResolver::new(stack).resolve(path)? {
            Resolution::Found(_) => return Err(Error::AlreadyExists(path.clone())),
            Resolution::Whiteout { .. } | Resolution::NotFound => {}
        }
        CopyUpEngine::new(stack).ensure_parent(path)?;
        WhiteoutTracker::new(stack).clear_whiteout(path)
    }
}
