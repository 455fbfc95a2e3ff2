//! Layer storage backends
//!
//! The resolver and the copy-up engine reach a layer's storage only through
//! [`LayerBackend`]. Paths handed to a backend are relative to its root.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::attr::{EntryAttr, EntryKind};

/// Directory entry as stored in one layer
#[derive(Debug, Clone)]
pub struct LayerDirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// Filesystem statistics of a layer's backing store
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Storage capability of a single layer
pub trait LayerBackend: Send + Sync + fmt::Debug {
    /// Root of the layer, for logging and overlap checks
    fn root(&self) -> &Path;

    /// Attributes of the entry itself (symlinks are not followed), `None` if absent
    fn stat(&self, path: &Path) -> io::Result<Option<EntryAttr>>;

    fn open(&self, path: &Path, options: &OpenOptions) -> io::Result<File>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<LayerDirEntry>>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Create a new regular file, failing if the name exists
    fn create_file(&self, path: &Path, mode: u32) -> io::Result<File>;

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn create_symlink(&self, target: &Path, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Atomically replace `to` with `from`
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    fn set_times(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()>;

    fn statfs(&self) -> io::Result<FsStats>;

    /// True if an entry (of any kind) exists
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.stat(path)?.is_some())
    }
}

/// Layer stored in a local directory tree
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open a local layer. The root must be an existing directory.
    pub fn new(root: PathBuf) -> io::Result<Self> {
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a directory", root),
            ));
        }
        Ok(Self { root })
    }

    /// Physical location of a relative path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl LayerBackend for LocalBackend {
    fn root(&self) -> &Path {
        &self.root
    }

    fn stat(&self, path: &Path) -> io::Result<Option<EntryAttr>> {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) => Ok(Some(EntryAttr::from_metadata(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            // A file where a directory was expected along the way
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open(&self, path: &Path, options: &OpenOptions) -> io::Result<File> {
        options.open(self.resolve(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<LayerDirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            entries.push(LayerDirEntry {
                name: entry.file_name(),
                kind: EntryKind::from(entry.file_type()?),
            });
        }
        Ok(entries)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.resolve(path))
    }

    fn create_file(&self, path: &Path, mode: u32) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.resolve(path))
    }

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(self.resolve(path))
    }

    fn create_symlink(&self, target: &Path, path: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(path))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.resolve(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        let resolved = self.resolve(path);
        // Symlink permissions are not meaningful
        if fs::symlink_metadata(&resolved)?.file_type().is_symlink() {
            return Ok(());
        }
        fs::set_permissions(resolved, fs::Permissions::from_mode(mode & 0o7777))
    }

    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        std::os::unix::fs::lchown(self.resolve(path), uid, gid)
    }

    fn set_times(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let resolved = self.resolve(path);
        if fs::symlink_metadata(&resolved)?.file_type().is_symlink() {
            return Ok(());
        }
        let file = File::open(resolved)?;
        file.set_times(FileTimes::new().set_accessed(atime).set_modified(mtime))
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.resolve(path))?;
        file.set_len(size)
    }

    #[allow(clippy::unnecessary_cast)]
    fn statfs(&self) -> io::Result<FsStats> {
        let stats = nix::sys::statvfs::statvfs(&self.root).map_err(io::Error::from)?;
        Ok(FsStats {
            blocks: stats.blocks() as u64,
            bfree: stats.blocks_free() as u64,
            bavail: stats.blocks_available() as u64,
            files: stats.files() as u64,
            ffree: stats.files_free() as u64,
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }
}
