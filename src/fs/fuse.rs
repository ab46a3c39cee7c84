//! FUSE Filesystem Implementation
//!
//! Implements the fuser::Filesystem trait over an enabled [`Mount`]. Requests
//! arrive on fuser's session thread, so engine calls may block there.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, warn};

use super::attr::{file_type, to_file_attr, TTL};
use super::handles::HandleTable;
use super::inode::{InoMap, ROOT_INO};
use crate::error::FsError;
use crate::inode::InodeInfo;
use crate::mount::Mount;

/// FUSE filesystem for one mount
pub struct FuseFilesystem {
    mount: Arc<Mount>,
    inos: InoMap,
    handles: HandleTable,
}

impl FuseFilesystem {
    pub fn new(mount: Arc<Mount>) -> Self {
        let inos = InoMap::new(mount.root_id());
        Self {
            mount,
            inos,
            handles: HandleTable::new(),
        }
    }

    fn attr(&self, info: &InodeInfo) -> FileAttr {
        to_file_attr(self.inos.to_ino(info.id), info, self.mount.writable())
    }

    fn parent_ino(&self, info: &InodeInfo) -> u64 {
        if info.id == self.mount.root_id() {
            return ROOT_INO;
        }
        info.parent.map_or(ROOT_INO, |parent| self.inos.to_ino(parent))
    }
}

/// Request names must be valid UTF-8
fn utf8(name: &OsStr) -> Result<&str, FsError> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidArgument(name.to_string_lossy().into_owned()))
}

fn errno(op: &str, error: &FsError) -> i32 {
    if error.is_cancelled() {
        debug!(op = op, "Request cancelled");
    } else {
        debug!(op = op, error = %error, "Request failed");
    }
    error.to_errno()
}

fn to_system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for FuseFilesystem {
    fn destroy(&mut self) {
        let closed = self.handles.clear();
        debug!(mount = %self.mount.name(), handles = closed, "FUSE session destroyed");
    }

    /// Look up a file by name in a directory
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = utf8(name).and_then(|name| self.mount.lookup(self.inos.to_id(parent), name));
        match result {
            Ok(info) => reply.entry(&TTL, &self.attr(&info), 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    /// Get file attributes
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!(ino = ino, "getattr");

        match self.mount.getattr(self.inos.to_id(ino)) {
            Ok(info) => reply.attr(&TTL, &self.attr(&info)),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    /// Change size and modification time; ownership and mode are fixed
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(ino = ino, size = ?size, "setattr");
        let id = self.inos.to_id(ino);

        let mut result = self.mount.getattr(id);
        if let Some(size) = size {
            result = result.and_then(|_| self.mount.set_size(id, size));
        }
        if let Some(mtime) = mtime {
            result = result.and_then(|_| self.mount.set_modified(id, to_system_time(mtime)));
        }

        match result {
            Ok(info) => reply.attr(&TTL, &self.attr(&info)),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result =
            utf8(name).and_then(|name| self.mount.make_directory(self.inos.to_id(parent), name));
        match result {
            Ok(info) => reply.entry(&TTL, &self.attr(&info), 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = utf8(name).and_then(|name| {
            let info = self.mount.make_file(self.inos.to_id(parent), name)?;
            let file = self.mount.open(info.id, true, false)?;
            Ok((info, file))
        });

        match result {
            Ok((info, file)) => {
                let attr = self.attr(&info);
                let fh = self.handles.open(file);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = utf8(name).and_then(|name| self.mount.unlink(self.inos.to_id(parent), name));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result =
            utf8(name).and_then(|name| self.mount.remove_directory(self.inos.to_id(parent), name));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
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
        // RENAME_EXCHANGE and RENAME_NOREPLACE are not supported
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let result = utf8(name).and_then(|name| {
            let newname = utf8(newname)?;
            self.mount.rename(
                self.inos.to_id(parent),
                name,
                self.inos.to_id(newparent),
                newname,
            )
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let truncate = flags & libc::O_TRUNC != 0;
        debug!(ino = ino, write = write, truncate = truncate, "open");

        match self.mount.open(self.inos.to_id(ino), write, truncate) {
            Ok(file) => {
                let fh = self.handles.open(file);
                reply.opened(fh, 0);
            }
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
        let Some(file) = self.handles.get(fh) else {
            warn!(ino = ino, fh = fh, "read: unknown file handle");
            reply.error(libc::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.mount.read(file, offset as u64, u64::from(size)) {
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
        let Some(file) = self.handles.get(fh) else {
            warn!(ino = ino, fh = fh, "write: unknown file handle");
            reply.error(libc::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.mount.write(file, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    /// Upload pending changes when a descriptor is closed
    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(file) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if !file.writable() {
            reply.ok();
            return;
        }

        debug!(ino = ino, fh = fh, "flush");
        match self.mount.flush(file) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(file) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        debug!(ino = ino, fh = fh, "fsync");
        match self.mount.flush(file) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Pending changes stay scheduled for the periodic flush
        self.handles.close(fh);
        reply.ok();
    }

    /// Open a directory
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, "opendir");

        match self.mount.getattr(self.inos.to_id(ino)) {
            Ok(info) if info.is_directory() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno("opendir", &e)),
        }
    }

    /// Read directory contents
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!(ino = ino, offset = offset, "readdir");
        let id = self.inos.to_id(ino);

        let (info, children) = match self
            .mount
            .getattr(id)
            .and_then(|info| Ok((info, self.mount.readdir(id)?)))
        {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, fuser::FileType::Directory, ".".to_string()));
        entries.push((self.parent_ino(&info), fuser::FileType::Directory, "..".to_string()));
        for child in children {
            entries.push((self.inos.to_ino(child.id), file_type(&child), child.name));
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            // reply.add returns true if buffer is full
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    /// Release (close) a directory
    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        debug!(ino = ino, "releasedir");
        reply.ok();
    }
}
