//! Copy-up engine
//!
//! Materializes lower-layer entries into the writable layer before they are
//! mutated. Content is written under a reserved temporary name in the target
//! directory and renamed into place, so a reader sees either the lower entry
//! or the complete copy and never a partial file. Every missing ancestor is
//! first created as a shadow directory carrying the lower directory's mode,
//! ownership and timestamps. A shadow directory without owner write access
//! (say a 0555 copy of a read-only lower directory) is opened up to the owner
//! only while a copy is placed into it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layer::{EntryAttr, EntryKind, Layer, LayerStack};
use crate::resolver::{Found, PathResolver, Resolution};
use crate::vpath::VirtualPath;

/// Prefix of copy-up temporaries, hidden from listings as a reserved name
pub const TEMP_PREFIX: &str = ".wh..wh.tmp.";

/// How much of a regular file to carry into the writable layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Content and metadata
    Full,
    /// Metadata only; the caller is about to truncate
    MetadataOnly,
}

fn temp_name() -> OsString {
    OsString::from(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()))
}

fn temp_path_for(path: &VirtualPath) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.as_path().join(temp_name()),
        None => PathBuf::from(temp_name()),
    }
}

fn is_exists_error(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EEXIST) | Some(libc::ENOTEMPTY))
        || e.kind() == io::ErrorKind::AlreadyExists
}

/// Directories currently opened up for copy-up, by physical path:
/// number of holders and the mode to put back
fn opened() -> &'static Mutex<HashMap<PathBuf, (usize, u32)>> {
    static OPENED: OnceLock<Mutex<HashMap<PathBuf, (usize, u32)>>> = OnceLock::new();
    OPENED.get_or_init(Default::default)
}

/// Owner write and search access to a writable-layer directory, granted for
/// as long as the value lives. The last holder puts the original mode back.
pub(crate) struct DirAccess<'a> {
    layer: &'a Layer,
    dir: PathBuf,
    key: PathBuf,
    held: bool,
}

impl<'a> DirAccess<'a> {
    const OWNER_WX: u32 = 0o300;

    pub(crate) fn grant(layer: &'a Layer, dir: &Path) -> Self {
        let key = if dir.as_os_str().is_empty() {
            layer.root().to_path_buf()
        } else {
            layer.root().join(dir)
        };
        let mut access = Self {
            layer,
            dir: dir.to_path_buf(),
            key,
            held: false,
        };

        let mut opened = opened().lock();
        if let Some((holders, _)) = opened.get_mut(&access.key) {
            *holders += 1;
            access.held = true;
            return access;
        }

        let backend = layer.backend();
        if let Ok(Some(attr)) = backend.stat(dir) {
            let mode = u32::from(attr.perm);
            if attr.kind.is_dir() && mode & Self::OWNER_WX != Self::OWNER_WX {
                match backend.set_mode(dir, mode | Self::OWNER_WX) {
                    Ok(()) => {
                        opened.insert(access.key.clone(), (1, mode));
                        access.held = true;
                    }
                    // The operation itself reports the real failure
                    Err(e) => debug!("could not open up {:?}: {}", dir, e),
                }
            }
        }
        access
    }
}

impl Drop for DirAccess<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let mut opened = opened().lock();
        let Some(entry) = opened.get_mut(&self.key) else {
            return;
        };
        entry.0 -= 1;
        if entry.0 == 0 {
            let mode = entry.1;
            opened.remove(&self.key);
            if let Err(e) = self.layer.backend().set_mode(&self.dir, mode) {
                warn!("Failed to restore mode {:o} on {:?}: {}", mode, self.dir, e);
            }
        }
    }
}

fn parent_of(rel: &Path) -> &Path {
    rel.parent().unwrap_or_else(|| Path::new(""))
}

/// A fully written temporary that has not been renamed into place yet.
///
/// Dropping it without [`Staged::commit`] removes the temporary.
pub struct Staged<'a> {
    layer: &'a Layer,
    path: VirtualPath,
    temp: PathBuf,
    committed: bool,
    // Dropped after the temporary is discarded
    _access: DirAccess<'a>,
}

impl<'a> Staged<'a> {
    /// Temporary location, relative to the writable layer root
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Atomically publish the copy under its final name
    pub fn commit(mut self) -> Result<PathBuf> {
        self.layer
            .backend()
            .rename(&self.temp, self.path.as_path())
            .map_err(|e| Error::copy_up(&self.path, e))?;
        self.committed = true;
        Ok(self.path.under(self.layer.root()))
    }
}

impl Drop for Staged<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.layer.backend().remove_file(&self.temp) {
                warn!("Failed to discard copy-up temporary {:?}: {}", self.temp, e);
            }
        }
    }
}

pub struct CopyUpEngine<'a> {
    stack: &'a LayerStack,
}

impl<'a> CopyUpEngine<'a> {
    pub fn new(stack: &'a LayerStack) -> Self {
        Self { stack }
    }

    /// Make `path` live in the writable layer, copying it up if needed.
    /// Returns the physical writable-layer location. A second call for the
    /// same path is a no-op.
    pub fn ensure_writable(&self, path: &VirtualPath) -> Result<PathBuf> {
        self.ensure_writable_with(path, CopyMode::Full)
    }

    pub fn ensure_writable_with(&self, path: &VirtualPath, mode: CopyMode) -> Result<PathBuf> {
        let found = PathResolver::new(self.stack)
            .resolve(path)?
            .into_found(path)?;
        if found.rank == 0 {
            return Ok(found.physical);
        }

        self.ensure_parent(path)?;

        let physical = match found.kind {
            EntryKind::Directory => self.materialize_dir(path, &found.attr)?,
            _ => match self.stage(path, &found, mode)? {
                Some(staged) => staged.commit()?,
                None => path.under(self.stack.writable().root()),
            },
        };

        self.invalidate(path);
        info!(
            "Copied up {} from layer {} (rank {})",
            path, found.layer, found.rank
        );
        Ok(physical)
    }

    /// Write the copy of a non-directory entry to a temporary without
    /// publishing it. Returns `None` if the entry already lives in the
    /// writable layer.
    pub fn stage(&self, path: &VirtualPath, found: &Found, mode: CopyMode) -> Result<Option<Staged<'a>>> {
        if found.rank == 0 {
            return Ok(None);
        }
        let source = &self.stack.layers()[found.rank];
        let writable = self.stack.writable();
        let temp = temp_path_for(path);
        let access = DirAccess::grant(writable, parent_of(&temp));

        let dst = match found.kind {
            EntryKind::RegularFile => Some(
                writable
                    .backend()
                    .create_file(&temp, 0o600)
                    .map_err(|e| Error::copy_up(path, e))?,
            ),
            EntryKind::Symlink => {
                let target = source
                    .backend()
                    .read_link(path.as_path())
                    .map_err(|e| Error::copy_up(path, e))?;
                writable
                    .backend()
                    .create_symlink(&target, &temp)
                    .map_err(|e| Error::copy_up(path, e))?;
                None
            }
            EntryKind::Directory => return Err(Error::IsDirectory(path.clone())),
            other => {
                return Err(Error::copy_up(
                    path,
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("cannot copy up {:?} entries", other),
                    ),
                ))
            }
        };
        let staged = Staged {
            layer: writable,
            path: path.clone(),
            temp: temp.clone(),
            committed: false,
            _access: access,
        };

        if let Some(mut dst) = dst {
            if mode == CopyMode::Full {
                let mut src = source
                    .backend()
                    .open(path.as_path(), OpenOptions::new().read(true))
                    .map_err(|e| Error::copy_up(path, e))?;
                io::copy(&mut src, &mut dst).map_err(|e| Error::copy_up(path, e))?;
                dst.flush().map_err(|e| Error::copy_up(path, e))?;
                dst.sync_data().map_err(|e| Error::copy_up(path, e))?;
            }
        }
        self.preserve_metadata(path, &temp, &found.attr)?;
        Ok(Some(staged))
    }

    /// Create every missing ancestor of `path` as a shadow directory
    pub fn ensure_parent(&self, path: &VirtualPath) -> Result<()> {
        for ancestor in path.ancestors() {
            self.ensure_dir(&ancestor)?;
        }
        Ok(())
    }

    /// Copy `path` and, for directories, everything visible below it
    pub fn copy_up_tree(&self, path: &VirtualPath) -> Result<()> {
        let found = PathResolver::new(self.stack)
            .resolve(path)?
            .into_found(path)?;
        self.ensure_writable(path)?;
        if found.kind.is_dir() {
            for entry in PathResolver::new(self.stack).readdir_all(path)? {
                self.copy_up_tree(&path.join(&entry.name)?)?;
            }
        }
        Ok(())
    }

    fn ensure_dir(&self, dir: &VirtualPath) -> Result<()> {
        let writable = self.stack.writable();
        match writable.backend().stat(dir.as_path())? {
            Some(attr) if attr.kind.is_dir() => return Ok(()),
            Some(_) => return Err(Error::NotDirectory(dir.clone())),
            None => {}
        }

        let found = PathResolver::new(self.stack).resolve(dir)?;
        match found {
            Resolution::Found(found) if found.kind.is_dir() => {
                self.materialize_dir(dir, &found.attr)?;
                self.invalidate(dir);
                debug!("Created shadow directory {}", dir);
                Ok(())
            }
            Resolution::Found(_) => Err(Error::NotDirectory(dir.clone())),
            Resolution::Whiteout { .. } => Err(Error::Whiteout(dir.clone())),
            Resolution::NotFound => Err(Error::NotFound(dir.clone())),
        }
    }

    /// Create `dir` in the writable layer with `attr`'s metadata, via a
    /// temporary directory renamed into place
    fn materialize_dir(&self, dir: &VirtualPath, attr: &EntryAttr) -> Result<PathBuf> {
        let writable = self.stack.writable();
        let backend = writable.backend();
        let temp = temp_path_for(dir);
        let _access = DirAccess::grant(writable, parent_of(&temp));

        backend
            .create_dir(&temp, 0o700)
            .map_err(|e| Error::copy_up(dir, e))?;
        if let Err(e) = self.preserve_metadata(dir, &temp, attr) {
            let _ = backend.remove_dir(&temp);
            return Err(e);
        }

        match backend.rename(&temp, dir.as_path()) {
            Ok(()) => {}
            Err(e) if is_exists_error(&e) => {
                // Lost a race with another copy-up of a sibling; theirs is equivalent
                let _ = backend.remove_dir(&temp);
                match backend.stat(dir.as_path())? {
                    Some(existing) if existing.kind.is_dir() => {}
                    _ => return Err(Error::copy_up(dir, e)),
                }
            }
            Err(e) => {
                let _ = backend.remove_dir(&temp);
                return Err(Error::copy_up(dir, e));
            }
        }
        Ok(dir.under(writable.root()))
    }

    fn preserve_metadata(&self, path: &VirtualPath, rel: &Path, attr: &EntryAttr) -> Result<()> {
        let backend = self.stack.writable().backend();

        backend
            .set_mode(rel, attr.perm as u32)
            .map_err(|e| Error::copy_up(path, e))?;

        if let Some(current) = backend.stat(rel)? {
            if current.uid != attr.uid || current.gid != attr.gid {
                if let Err(e) = backend.set_owner(rel, Some(attr.uid), Some(attr.gid)) {
                    debug!("ownership of {} not preserved: {}", path, e);
                }
            }
        }

        if attr.kind != EntryKind::Symlink {
            if let Err(e) = backend.set_times(rel, attr.atime, attr.mtime) {
                warn!("timestamps of {} not preserved: {}", path, e);
            }
        }
        Ok(())
    }

    fn invalidate(&self, path: &VirtualPath) {
        if let Some(cache) = self.stack.cache() {
            cache.invalidate(path);
        }
    }
}
