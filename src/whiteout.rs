//! Whiteout tracking
//!
//! Deletions of lower-layer entries are recorded as `.wh.<name>` marker files
//! next to the hidden name in the writable layer. A marker hides the name and,
//! for directories, everything below it in every lower layer. A directory
//! recreated over a whiteout carries `.wh..wh..opq`, which hides the lower
//! layers' view of that directory.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::copyup::CopyUpEngine;
use crate::error::{Error, Result};
use crate::layer::{Layer, LayerStack};
use crate::resolver::PathResolver;
use crate::vpath::{is_reserved, VirtualPath, RESERVED_PREFIX};

/// Marker placed inside a directory whose lower contents are hidden
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Marker path for `path`, relative to a layer root
pub fn marker_path(path: &VirtualPath) -> Option<PathBuf> {
    let name = path.file_name()?;
    let mut marker = OsString::from(RESERVED_PREFIX);
    marker.push(name);
    let parent = path.parent()?;
    Some(parent.as_path().join(marker))
}

fn opaque_path(dir: &VirtualPath) -> PathBuf {
    dir.as_path().join(OPAQUE_MARKER)
}

/// Records and queries whiteout markers in a stack's writable layer
pub struct WhiteoutTracker<'a> {
    stack: &'a LayerStack,
}

impl<'a> WhiteoutTracker<'a> {
    pub fn new(stack: &'a LayerStack) -> Self {
        Self { stack }
    }

    /// True if `layer` holds a marker for exactly `path`
    pub fn is_whiteout(layer: &Layer, path: &VirtualPath) -> Result<bool> {
        match marker_path(path) {
            Some(marker) => Ok(layer.backend().exists(&marker)?),
            None => Ok(false),
        }
    }

    /// True if `layer` marks directory `dir` as opaque
    pub fn is_opaque(layer: &Layer, dir: &VirtualPath) -> Result<bool> {
        Ok(layer.backend().exists(&opaque_path(dir))?)
    }

    /// Delete `path` from the composed view.
    ///
    /// Entries that exist only in the writable layer are removed physically.
    /// Anything still visible in a lower layer also gets a marker. A failed
    /// removal takes the marker back, so the entry stays visible.
    pub fn record_delete(&self, path: &VirtualPath) -> Result<()> {
        let writable = self.stack.writable();
        let lower_present = PathResolver::new(self.stack).lower_visible(path)?;
        let upper_is_dir = writable
            .backend()
            .stat(path.as_path())?
            .map(|attr| attr.kind.is_dir());

        if upper_is_dir == Some(true) && !self.holds_only_reserved(path)? {
            return Err(Error::NotEmpty(path.clone()));
        }

        if lower_present {
            CopyUpEngine::new(self.stack).ensure_parent(path)?;
            self.write_marker(path)?;
        }

        if let Some(is_dir) = upper_is_dir {
            let removed = if is_dir {
                self.purge_reserved(path).and_then(|()| {
                    writable
                        .backend()
                        .remove_dir(path.as_path())
                        .map_err(Error::from)
                })
            } else {
                writable
                    .backend()
                    .remove_file(path.as_path())
                    .map_err(Error::from)
            };
            if let Err(e) = removed {
                if lower_present {
                    if let Err(undo) = self.clear_whiteout(path) {
                        warn!("Failed to withdraw whiteout for {}: {}", path, undo);
                    }
                }
                return Err(e);
            }
        }

        debug!(
            "record_delete {}: lower_present={}, upper_removed={}",
            path,
            lower_present,
            upper_is_dir.is_some()
        );
        Ok(())
    }

    /// Hide `path` without touching any writable copy (used after a rename moves it away)
    pub fn hide(&self, path: &VirtualPath) -> Result<()> {
        if PathResolver::new(self.stack).lower_visible(path)? {
            CopyUpEngine::new(self.stack).ensure_parent(path)?;
            self.write_marker(path)?;
        }
        Ok(())
    }

    /// Remove the marker for `path`, returning whether one was present
    pub fn clear_whiteout(&self, path: &VirtualPath) -> Result<bool> {
        let Some(marker) = marker_path(path) else {
            return Ok(false);
        };
        match self.stack.writable().backend().remove_file(&marker) {
            Ok(()) => {
                debug!("cleared whiteout for {}", path);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark an existing writable-layer directory as opaque
    pub fn mark_opaque(&self, dir: &VirtualPath) -> Result<()> {
        let backend = self.stack.writable().backend();
        match backend.create_file(&opaque_path(dir), 0o600) {
            Ok(_) => {
                debug!("marked {} opaque", dir);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove markers and stale temporaries inside a writable-layer directory
    /// so it can be removed or replaced.
    pub fn purge_reserved(&self, dir: &VirtualPath) -> Result<()> {
        let backend = self.stack.writable().backend();
        for entry in backend.read_dir(dir.as_path())? {
            if !is_reserved(&entry.name) {
                continue;
            }
            let rel = dir.as_path().join(&entry.name);
            if entry.kind.is_dir() {
                // Leftover shadow-directory temporary, always empty
                backend.remove_dir(&rel)?;
            } else {
                backend.remove_file(&rel)?;
            }
        }
        Ok(())
    }

    fn holds_only_reserved(&self, dir: &VirtualPath) -> Result<bool> {
        let entries = self.stack.writable().backend().read_dir(dir.as_path())?;
        Ok(entries.iter().all(|entry| is_reserved(&entry.name)))
    }

    /// Names whited out directly inside `dir` in `layer`
    pub fn whiteouts_in_dir(layer: &Layer, dir: &VirtualPath) -> Result<Vec<OsString>> {
        let entries = match layer.backend().read_dir(dir.as_path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| hidden_name(&entry.name))
            .collect())
    }

    fn write_marker(&self, path: &VirtualPath) -> Result<()> {
        let marker = marker_path(path).ok_or_else(|| Error::InvalidPath(path.to_string()))?;
        match self.stack.writable().backend().create_file(&marker, 0o600) {
            Ok(_) => {
                info!("Whiteout recorded for {}", path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The name a marker file hides, `None` for non-markers and internal names
fn hidden_name(marker: &OsStr) -> Option<OsString> {
    let name = marker.to_string_lossy();
    let hidden = name.strip_prefix(RESERVED_PREFIX)?;
    if hidden.is_empty() || hidden.starts_with(RESERVED_PREFIX) {
        return None;
    }
    Some(OsString::from(hidden))
}
