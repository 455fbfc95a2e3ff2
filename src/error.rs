//! Error types for prismafs

use std::path::PathBuf;
use thiserror::Error;

use crate::vpath::VirtualPath;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the layer engine, the namespace and the dispatcher
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Resolution errors
    #[error("No such entry: {0}")]
    NotFound(VirtualPath),

    #[error("Entry hidden by whiteout: {0}")]
    Whiteout(VirtualPath),

    #[error("Not a directory: {0}")]
    NotDirectory(VirtualPath),

    #[error("Is a directory: {0}")]
    IsDirectory(VirtualPath),

    #[error("Directory not empty: {0}")]
    NotEmpty(VirtualPath),

    #[error("Entry already exists: {0}")]
    AlreadyExists(VirtualPath),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // Copy-up errors
    #[error("Copy-up of {path} failed: {source}")]
    CopyUp {
        path: VirtualPath,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid layer {root:?}: {reason}")]
    InvalidLayer { root: PathBuf, reason: String },

    #[error("Mount conflict at {mount_point:?}: {reason}")]
    MountConflict { mount_point: PathBuf, reason: String },

    // Concurrency errors
    #[error("Path is busy: {0}")]
    Busy(VirtualPath),

    // Mount state
    #[error("Not mounted: {0:?}")]
    NotMounted(PathBuf),

    #[error("Already mounted: {0:?}")]
    AlreadyMounted(PathBuf),

    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O failure that happened while materializing `path`
    pub fn copy_up(path: &VirtualPath, source: std::io::Error) -> Self {
        Error::CopyUp {
            path: path.clone(),
            source,
        }
    }

    /// Errno reported to the kernel bridge
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(EIO),
            Error::NotFound(_) | Error::Whiteout(_) => ENOENT,
            Error::NotDirectory(_) => ENOTDIR,
            Error::IsDirectory(_) => EISDIR,
            Error::NotEmpty(_) => ENOTEMPTY,
            Error::AlreadyExists(_) => EEXIST,
            Error::InvalidName(_) | Error::InvalidPath(_) => EINVAL,
            Error::CopyUp { source, .. } => match source.raw_os_error() {
                Some(code @ (ENOSPC | EDQUOT | EACCES | EPERM | EROFS)) => code,
                _ => EIO,
            },
            Error::Config(_) | Error::InvalidLayer { .. } | Error::MountConflict { .. } => EINVAL,
            Error::Busy(_) => EBUSY,
            Error::NotMounted(_) => ENODEV,
            Error::AlreadyMounted(_) => EBUSY,
            Error::BadHandle(_) => EBADF,
            Error::Internal(_) => EIO,
        }
    }

    /// True for the resolution family (missing or hidden)
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::Whiteout(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
