//! FUSE filesystem implementation
//!
//! Translates kernel requests addressed by inode number into dispatcher
//! calls on virtual paths, and dispatcher errors into errno replies.

use fuser::{
    fuse_forget_one, FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::{c_int, ENOENT};
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::inode::{InodeTable, ROOT_INO, UNKNOWN_INO};
use crate::dispatch::{Dispatcher, SetAttr};
use crate::error::Error;
use crate::layer::{EntryAttr, EntryKind};
use crate::vpath::VirtualPath;

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Log and convert a dispatcher error to an errno
fn errno(op: &str, e: &Error) -> c_int {
    let code = e.to_errno();
    if e.is_not_found() {
        debug!("{}: {}", op, e);
    } else {
        error!("{} failed: {}", op, e);
    }
    code
}

/// FUSE adapter over a [`Dispatcher`]
pub struct PrismaFs {
    dispatcher: Dispatcher,
    inodes: InodeTable,
    ttl: Duration,
}

impl PrismaFs {
    pub fn new(dispatcher: Dispatcher, ttl: Duration) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn path(&self, ino: u64) -> Result<VirtualPath, c_int> {
        self.inodes.path(ino).ok_or(ENOENT)
    }

    /// Attributes for an entry reply, which the kernel counts as a lookup
    fn entry_attr(&self, path: &VirtualPath, attr: &EntryAttr) -> FileAttr {
        attr.to_fuser_attr(self.inodes.lookup(path))
    }
}

impl Filesystem for PrismaFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        if !self.dispatcher.is_mounted() {
            error!("{:?} is not bound in the namespace", self.dispatcher.mount_point());
            return Err(libc::ENODEV);
        }
        info!("prismafs serving {:?}", self.dispatcher.mount_point());
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "prismafs at {:?} shutting down ({} open handles)",
            self.dispatcher.mount_point(),
            self.dispatcher.handles().len()
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let parent = match self.path(parent) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.lookup(&parent, name) {
            Ok((path, attr)) => reply.entry(&self.ttl, &self.entry_attr(&path, &attr), 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuse_forget_one]) {
        debug!("batch_forget({} nodes)", nodes.len());
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.getattr(&path) {
            Ok(attr) => reply.attr(&self.ttl, &attr.to_fuser_attr(ino)),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            fh,
        };
        match self.dispatcher.setattr(&path, &changes) {
            Ok(attr) => reply.attr(&self.ttl, &attr.to_fuser_attr(ino)),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let parent = match self.path(parent) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.mkdir(&parent, name, mode & !umask) {
            Ok((path, attr)) => reply.entry(&self.ttl, &self.entry_attr(&path, &attr), 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let parent = match self.path(parent) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.unlink(&parent, name) {
            Ok(()) => {
                if let Ok(path) = parent.join(name) {
                    self.inodes.remove_subtree(&path);
                }
                reply.ok()
            }
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let parent = match self.path(parent) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.rmdir(&parent, name) {
            Ok(()) => {
                if let Ok(path) = parent.join(name) {
                    self.inodes.remove_subtree(&path);
                }
                reply.ok()
            }
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let parent = match self.path(parent) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.symlink(&parent, link_name, target) {
            Ok((path, attr)) => reply.entry(&self.ttl, &self.entry_attr(&path, &attr), 0),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let (from_dir, to_dir) = match (self.path(parent), self.path(newparent)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(ENOENT),
        };
        match self
            .dispatcher
            .rename(&from_dir, name, &to_dir, newname, flags)
        {
            Ok(()) => {
                if let (Ok(from), Ok(to)) = (from_dir.join(name), to_dir.join(newname)) {
                    self.inodes.rename_subtree(&from, &to);
                }
                reply.ok()
            }
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.dispatcher.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.dispatcher.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        match self.dispatcher.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        match self.dispatcher.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        match self.dispatcher.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        let merged = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno("readdir", &e)),
        };

        let parent_ino = match path.parent() {
            Some(p) => self.inodes.peek(&p).unwrap_or(UNKNOWN_INO),
            None => ROOT_INO,
        };
        let mut entries = vec![
            (ino, EntryKind::Directory, OsStr::new(".").to_os_string()),
            (parent_ino, EntryKind::Directory, OsStr::new("..").to_os_string()),
        ];
        for entry in merged {
            // Listing does not count as a lookup, so nothing is allocated here
            let child_ino = match path.join(&entry.name) {
                Ok(child) => self.inodes.peek(&child).unwrap_or(UNKNOWN_INO),
                Err(_) => continue,
            };
            entries.push((child_ino, entry.kind, entry.name));
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, kind.to_fuser_type(), name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.dispatcher.statfs() {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(errno("statfs", &e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let parent = match self.path(parent) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.dispatcher.create(&parent, name, mode & !umask, flags) {
            Ok((path, attr, fh)) => {
                reply.created(&self.ttl, &self.entry_attr(&path, &attr), 0, fh, 0)
            }
            Err(e) => reply.error(errno("create", &e)),
        }
    }
}
