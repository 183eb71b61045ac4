// SPDX-License-Identifier: GPL-3.0-or-later
//! FUSE transport adapter
//!
//! Bridges the kernel's inode-based protocol onto the path-keyed dispatcher:
//! an inode table maps node ids to logical paths, a handle table maps the
//! file handles given to the kernel back to [`OpenHandle`]s, and directory
//! handles carry the listing snapshotted at `opendir`. All policy lives in
//! [`LazFs`]; this module only translates.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use fuser::{
    AccessFlags, BsdFileFlags, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation,
    INodeNo, KernelConfig, LockOwner, OpenFlags, RenameFlags, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow, WriteFlags,
};
use lazfs_core::error::Errno;
use parking_lot::Mutex;
use tracing::debug;

use crate::fs::{DirEntryInfo, FileKind, LazFs, OpenHandle};
use crate::stat::FileStat;
use crate::Caller;

const TTL: Duration = Duration::ZERO;
const ROOT_INO: u64 = 1;

fn fuse_errno(err: Errno) -> fuser::Errno {
    fuser::Errno::from_i32(err as i32)
}

fn file_type_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_of(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::RegularFile | FileKind::Other => FileType::RegularFile,
    }
}

fn attr_of(st: &FileStat, ino: u64) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: st.size,
        blocks: st.blocks,
        atime: st.atime,
        mtime: st.mtime,
        ctime: st.ctime,
        crtime: st.ctime,
        kind: file_type_of(st.mode),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink as u32,
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev as u32,
        blksize: st.blksize as u32,
        flags: 0,
    }
}

struct InodeMap {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeMap {
    fn new() -> Self {
        let mut map = InodeMap {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        map.by_ino.insert(ROOT_INO, "/".to_string());
        map.by_path.insert("/".to_string(), ROOT_INO);
        map
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(ino) = self.by_path.remove(from) {
            self.by_path.remove(to);
            self.by_ino.insert(ino, to.to_string());
            self.by_path.insert(to.to_string(), ino);
        }
    }
}

/// The `fuser::Filesystem` implementation wrapping a [`LazFs`].
pub struct LazFuse {
    fs: LazFs,
    inodes: Mutex<InodeMap>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    dirs: Mutex<HashMap<u64, Vec<(u64, DirEntryInfo)>>>,
    next_fh: AtomicU64,
}

impl LazFuse {
    pub fn new(fs: LazFs) -> Self {
        LazFuse {
            fs,
            inodes: Mutex::new(InodeMap::new()),
            handles: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn path_of(&self, ino: INodeNo) -> Result<String, fuser::Errno> {
        self.inodes
            .lock()
            .path_of(ino.0)
            .ok_or_else(|| fuse_errno(Errno::ENOENT))
    }

    fn child_path(&self, parent: INodeNo, name: &OsStr) -> Result<String, fuser::Errno> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or_else(|| fuse_errno(Errno::EINVAL))?;
        if parent == "/" {
            Ok(format!("/{name}"))
        } else {
            Ok(format!("{parent}/{name}"))
        }
    }

    fn caller(req: &Request) -> Caller {
        Caller {
            uid: req.uid(),
            gid: req.gid(),
        }
    }

    fn entry_reply(&self, path: &str, reply: ReplyEntry) {
        match self.fs.getattr(path) {
            Ok(st) => {
                let ino = self.inodes.lock().assign(path);
                reply.entry(&TTL, &attr_of(&st, ino), Generation(0));
            }
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn handle(&self, fh: FileHandle) -> Result<OpenHandle, fuser::Errno> {
        self.handles
            .lock()
            .get(&fh.0)
            .cloned()
            .ok_or_else(|| fuse_errno(Errno::EBADF))
    }

    fn register_handle(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        fh
    }
}

macro_rules! try_reply {
    ($reply:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                $reply.error(err);
                return;
            }
        }
    };
}

impl Filesystem for LazFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        debug!("init");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("destroy");
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let path = try_reply!(reply, self.child_path(parent, name));
        self.entry_reply(&path, reply);
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        let path = try_reply!(reply, self.path_of(ino));
        let result = match fh.and_then(|fh| self.handles.lock().get(&fh.0).cloned()) {
            Some(handle) => self.fs.fgetattr(&path, &handle),
            None => self.fs.getattr(&path),
        };
        match result {
            Ok(st) => reply.attr(&TTL, &attr_of(&st, ino.0)),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let path = try_reply!(reply, self.path_of(ino));

        if let Some(mode) = mode {
            try_reply!(reply, self.fs.chmod(&path, mode).map_err(fuse_errno));
        }
        if uid.is_some() || gid.is_some() {
            try_reply!(reply, self.fs.chown(&path, uid, gid).map_err(fuse_errno));
        }
        if let Some(size) = size {
            let result = match fh.and_then(|fh| self.handles.lock().get(&fh.0).cloned()) {
                Some(handle) => self.fs.ftruncate(&path, &handle, size),
                None => self.fs.truncate(&path, size),
            };
            try_reply!(reply, result.map_err(fuse_errno));
        }
        if atime.is_some() || mtime.is_some() {
            let current = try_reply!(reply, self.fs.getattr(&path).map_err(fuse_errno));
            let resolve = |t: Option<TimeOrNow>, fallback: SystemTime| match t {
                Some(TimeOrNow::SpecificTime(t)) => t,
                Some(TimeOrNow::Now) => SystemTime::now(),
                None => fallback,
            };
            let atime = resolve(atime, current.atime);
            let mtime = resolve(mtime, current.mtime);
            try_reply!(reply, self.fs.utime(&path, atime, mtime).map_err(fuse_errno));
        }

        match self.fs.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &attr_of(&st, ino.0)),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child_path(parent, name));
        try_reply!(
            reply,
            self.fs
                .mknod(&path, mode, u64::from(rdev), Self::caller(req))
                .map_err(fuse_errno)
        );
        self.entry_reply(&path, reply);
    }

    fn mkdir(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child_path(parent, name));
        try_reply!(
            reply,
            self.fs
                .mkdir(&path, mode, Self::caller(req))
                .map_err(fuse_errno)
        );
        self.entry_reply(&path, reply);
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child_path(parent, name));
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child_path(parent, name));
        match self.fs.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn symlink(
        &self,
        req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child_path(parent, link_name));
        try_reply!(
            reply,
            self.fs
                .symlink(target, &path, Self::caller(req))
                .map_err(fuse_errno)
        );
        self.entry_reply(&path, reply);
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let from = try_reply!(reply, self.child_path(parent, name));
        let to = try_reply!(reply, self.child_path(newparent, newname));
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.lock().rename(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let from = try_reply!(reply, self.path_of(ino));
        let to = try_reply!(reply, self.child_path(newparent, newname));
        try_reply!(reply, self.fs.link(&from, &to).map_err(fuse_errno));
        self.entry_reply(&to, reply);
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.open(&path, flags.0) {
            Ok(handle) => {
                let fh = self.register_handle(handle);
                reply.opened(FileHandle(fh), FopenFlags::empty());
            }
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        let handle = try_reply!(reply, self.handle(fh));
        match self.fs.read(&path, &handle, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        let handle = try_reply!(reply, self.handle(fh));
        match self.fs.write(&path, &handle, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.flush(&path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        let handle = self.handles.lock().remove(&fh.0);
        match handle {
            Some(handle) => match self.fs.release(&path, &handle) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(fuse_errno(err)),
            },
            None => reply.error(fuse_errno(Errno::EBADF)),
        }
    }

    fn fsync(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        let handle = try_reply!(reply, self.handle(fh));
        match self.fs.fsync(&path, &handle, datasync) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path_of(ino));
        let entries = try_reply!(reply, self.fs.readdir(&path).map_err(fuse_errno));

        let parent_ino = {
            let inodes = self.inodes.lock();
            match path.rsplit_once('/') {
                Some(("", _)) | None => ROOT_INO,
                Some((parent, _)) => inodes.by_path.get(parent).copied().unwrap_or(ROOT_INO),
            }
        };

        let mut listing = vec![
            (
                ino.0,
                DirEntryInfo {
                    name: ".".into(),
                    kind: FileKind::Directory,
                },
            ),
            (
                parent_ino,
                DirEntryInfo {
                    name: "..".into(),
                    kind: FileKind::Directory,
                },
            ),
        ];
        for entry in entries {
            let child = match entry.name.to_str() {
                Some(name) if path == "/" => format!("/{name}"),
                Some(name) => format!("{path}/{name}"),
                None => continue,
            };
            let child_ino = self.inodes.lock().assign(&child);
            listing.push((child_ino, entry));
        }

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.dirs.lock().insert(fh, listing);
        reply.opened(FileHandle(fh), FopenFlags::empty());
    }

    fn readdir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let listing = match self.dirs.lock().get(&fh.0) {
            Some(listing) => listing.clone(),
            None => {
                reply.error(fuse_errno(Errno::EBADF));
                return;
            }
        };

        for (i, (child_ino, entry)) in listing.iter().enumerate().skip(offset as usize) {
            if reply.add(
                INodeNo(*child_ino),
                (i + 1) as u64,
                kind_of(entry.kind),
                &entry.name,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        reply: ReplyEmpty,
    ) {
        self.dirs.lock().remove(&fh.0);
        reply.ok();
    }

    fn fsyncdir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&self, _req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.statfs(&path) {
            Ok(sv) => reply.statfs(
                sv.blocks(),
                sv.blocks_free(),
                sv.blocks_available(),
                sv.files(),
                sv.files_free(),
                sv.block_size() as u32,
                sv.name_max() as u32,
                sv.fragment_size() as u32,
            ),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.path_of(ino));
        let value = try_reply!(reply, self.fs.getxattr(&path, name).map_err(fuse_errno));
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() <= size as usize {
            reply.data(&value);
        } else {
            reply.error(fuse_errno(Errno::ERANGE));
        }
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.path_of(ino));
        let names = try_reply!(reply, self.fs.listxattr(&path).map_err(fuse_errno));
        // The wire format is every name followed by a NUL.
        let mut buf = Vec::new();
        for name in &names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32);
        } else if buf.len() <= size as usize {
            reply.data(&buf);
        } else {
            reply.error(fuse_errno(Errno::ERANGE));
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.path_of(ino));
        match self.fs.access(&path, mask.bits()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(fuse_errno(err)),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = try_reply!(reply, self.child_path(parent, name));
        let handle = try_reply!(
            reply,
            self.fs
                .create(&path, mode, Self::caller(req))
                .map_err(fuse_errno)
        );
        let st = try_reply!(reply, self.fs.fgetattr(&path, &handle).map_err(fuse_errno));
        let ino = self.inodes.lock().assign(&path);
        let fh = self.register_handle(handle);
        reply.created(
            &TTL,
            &attr_of(&st, ino),
            Generation(0),
            FileHandle(fh),
            FopenFlags::empty(),
        );
    }
}
