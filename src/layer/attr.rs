//! Entry kinds and attributes as seen through a layer

use std::fs::Metadata;
use std::time::{Duration, SystemTime};

/// Kind of a resolved entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::RegularFile
        }
    }
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        *self == EntryKind::Directory
    }

    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            EntryKind::RegularFile => fuser::FileType::RegularFile,
            EntryKind::Directory => fuser::FileType::Directory,
            EntryKind::Symlink => fuser::FileType::Symlink,
            EntryKind::BlockDevice => fuser::FileType::BlockDevice,
            EntryKind::CharDevice => fuser::FileType::CharDevice,
            EntryKind::Fifo => fuser::FileType::NamedPipe,
            EntryKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Attributes of an entry in a layer
#[derive(Debug, Clone)]
pub struct EntryAttr {
    pub kind: EntryKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl EntryAttr {
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            kind: EntryKind::from(meta.file_type()),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: epoch_plus(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }

    /// Convert to a fuser FileAttr under the given virtual inode number
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

fn epoch_plus(secs: i64, nsecs: i64) -> SystemTime {
    if secs < 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
}
