//! Upcall dispatcher
//!
//! One handler per file-system operation, path-keyed the way the transport
//! delivers them. Each handler decides whether a request is served from the
//! entry table, from the backing store, or both, and encodes the locking
//! discipline: the table mutex is held across every sequence that must be
//! atomic, and is deliberately dropped around the `pread`/`pwrite` of the
//! data path so slow I/O never stalls unrelated upcalls.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use filetime::FileTime;
use lazfs_cache::{
    prepare_tmp, BackingOpen, CacheStats, EntrySnapshot, EntryTable, Job, Lookup, TableGuard,
    WorkQueue,
};
use lazfs_core::error::{io_errno, Errno, IoResultExt, OpResult};
use lazfs_core::path as router;
use lazfs_core::{full_path, is_synthetic_las, sidecar, to_backing, xattr};
use nix::sys::stat::{fchmod, Mode, SFlag};
use nix::sys::statvfs::Statvfs;
use nix::unistd::{fchown, mkfifo, AccessFlags, Gid, Uid};
use tracing::{debug, error, warn};

use crate::stat::FileStat;
use crate::ugid::{Caller, UgidGuard};
use crate::VfsError;

/// Handle returned by `open`/`create` and threaded back through every
/// descriptor-based upcall.
///
/// For a synthetic path the file is the backing archive, which serves as the
/// identity of the open; the scratch descriptor is resolved through the
/// entry table on every data operation instead of being handed out.
#[derive(Debug, Clone)]
pub struct OpenHandle {
    pub file: Arc<File>,
    pub synthetic: bool,
}

/// Directory entry kind as offered to `readdir` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    Other,
}

impl From<fs::FileType> for FileKind {
    fn from(t: fs::FileType) -> Self {
        if t.is_dir() {
            FileKind::Directory
        } else if t.is_symlink() {
            FileKind::Symlink
        } else if t.is_file() {
            FileKind::RegularFile
        } else {
            FileKind::Other
        }
    }
}

/// One `readdir` result row.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub kind: FileKind,
}

fn decompress_routine(src: &File, dst: &File) -> Result<(), Errno> {
    lazfs_codec::decompress(src, dst).map_err(|err| {
        warn!(%err, "decompression failed");
        err.errno()
    })
}

fn compress_routine(src: &File, dst: &File) -> Result<(), Errno> {
    lazfs_codec::compress(src, dst).map_err(|err| {
        warn!(%err, "compression failed");
        err.errno()
    })
}

fn read_at(file: &File, offset: u64, size: u32) -> OpResult<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_errno(&e)),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// The mounted file system: backing root, entry table, worker pool.
pub struct LazFs {
    backing_root: PathBuf,
    scratch_dir: PathBuf,
    table: Arc<EntryTable>,
    pool: WorkQueue,
}

impl LazFs {
    /// Validate the backing tree and spin up the worker pool.
    pub fn new(
        backing_root: &Path,
        scratch_dir: Option<PathBuf>,
        threads: usize,
    ) -> Result<Self, VfsError> {
        let backing_root = backing_root
            .canonicalize()
            .map_err(|_| VfsError::BackingRootNotFound(backing_root.display().to_string()))?;
        if !backing_root.is_dir() {
            return Err(VfsError::BackingRootNotDirectory(
                backing_root.display().to_string(),
            ));
        }

        let scratch_dir = scratch_dir.unwrap_or_else(std::env::temp_dir);
        if !scratch_dir.is_dir() {
            return Err(VfsError::ScratchDirUnusable(
                scratch_dir.display().to_string(),
            ));
        }

        Ok(LazFs {
            backing_root,
            scratch_dir,
            table: Arc::new(EntryTable::new()),
            pool: WorkQueue::new(threads),
        })
    }

    fn full(&self, path: &str) -> PathBuf {
        full_path(&self.backing_root, path)
    }

    /// Route a metadata operation: the backing archive for a synthetic path,
    /// the literal path otherwise.
    fn routed(&self, path: &str) -> PathBuf {
        let full = self.full(path);
        if is_synthetic_las(&full) {
            to_backing(&full)
        } else {
            full
        }
    }

    /// Logical size of a closed archive: the sidecar when present, otherwise
    /// a peek at the compressed payload.
    fn logical_size(&self, laz: &Path) -> OpResult<u64> {
        match sidecar::get_size(laz) {
            Ok(size) => Ok(size.max(0) as u64),
            Err(e) if e == Errno::ENODATA || e == Errno::EOPNOTSUPP => {
                let archive = File::open(laz).errno()?;
                lazfs_codec::expanded_size(&archive).map_err(|err| {
                    warn!(%err, archive = %laz.display(), "cannot determine logical size");
                    err.errno()
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Take the one-I/O borrow of the scratch descriptor. Data operations
    /// are only ever delivered for open files, so a missing entry is a bug.
    fn borrow_scratch(&self, path: &str) -> EntrySnapshot {
        match self.table.lock().lookup(path, true) {
            Lookup::Hit(snapshot) => snapshot,
            _ => panic!("data operation on {path} without a live entry"),
        }
    }

    fn unborrow(&self, path: &str) {
        self.table.lock().release(path);
    }

    fn schedule_decompress(&self, name: &str, snapshot: &EntrySnapshot) {
        let complete = {
            let table = Arc::clone(&self.table);
            let name = name.to_string();
            move |result| table.complete(&name, result)
        };
        self.pool.run(Job::new(
            decompress_routine,
            Arc::clone(&snapshot.backing),
            Arc::clone(&snapshot.scratch),
            complete,
        ));
    }

    /// Lifetime counters of the entry table.
    pub fn cache_stats(&self) -> CacheStats {
        self.table.stats()
    }

    // --- attribute operations -------------------------------------------

    pub fn getattr(&self, path: &str) -> OpResult<FileStat> {
        debug!(path, "getattr");
        let full = self.full(path);
        if !is_synthetic_las(&full) {
            return FileStat::lstat(&full);
        }

        let laz = to_backing(&full);
        let mut guard = self.table.lock();
        if let Lookup::Hit(snapshot) = guard.lookup(path, false) {
            // Live entry: scratch size and times over archive identity.
            let identity = snapshot.backing.metadata().errno()?;
            let data = snapshot.scratch.metadata().errno()?;
            return Ok(FileStat::merged(&identity, &data));
        }

        let mut st = FileStat::lstat(&laz)?;
        st.size = self.logical_size(&laz)?;
        Ok(st)
    }

    pub fn fgetattr(&self, path: &str, handle: &OpenHandle) -> OpResult<FileStat> {
        debug!(path, "fgetattr");
        if !handle.synthetic {
            return handle
                .file
                .metadata()
                .errno()
                .map(|meta| FileStat::from_metadata(&meta));
        }

        let snapshot = self.borrow_scratch(path);
        let result: OpResult<FileStat> = (|| {
            let identity = snapshot.backing.metadata().errno()?;
            let data = snapshot.scratch.metadata().errno()?;
            Ok(FileStat::merged(&identity, &data))
        })();
        self.unborrow(path);
        result
    }

    // --- open / create / data path --------------------------------------

    pub fn open(&self, path: &str, flags: i32) -> OpResult<OpenHandle> {
        debug!(path, flags, "open");
        let full = self.full(path);
        if !is_synthetic_las(&full) {
            let file = open_passthrough(&full, flags).errno()?;
            return Ok(OpenHandle {
                file: Arc::new(file),
                synthetic: false,
            });
        }

        let laz = to_backing(&full);
        let mut guard = self.table.lock();
        match guard.lookup(path, true) {
            Lookup::Hit(snapshot) => {
                return Ok(OpenHandle {
                    file: snapshot.backing,
                    synthetic: true,
                })
            }
            // Teardown in flight; the kernel retries the open.
            Lookup::Dead => return Err(Errno::EAGAIN),
            Lookup::Miss => {}
        }

        debug!(archive = %laz.display(), "open: decompressing archive");
        let prepared = prepare_tmp(&laz, BackingOpen::Flags(flags), &self.scratch_dir)?;
        let snapshot = guard.insert(path, prepared, false);
        self.schedule_decompress(path, &snapshot);
        match guard.wait_ready(path) {
            Ok(()) => Ok(OpenHandle {
                file: snapshot.backing,
                synthetic: true,
            }),
            Err(err) => {
                error!(path, %err, "decompression failed, discarding entry");
                guard.discard(path);
                Err(err)
            }
        }
    }

    pub fn create(&self, path: &str, mode: u32, caller: Caller) -> OpResult<OpenHandle> {
        debug!(path, mode, "create");
        let full = self.full(path);
        let _ugid = UgidGuard::assume(caller);

        if !is_synthetic_las(&full) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode)
                .open(&full)
                .errno()?;
            return Ok(OpenHandle {
                file: Arc::new(file),
                synthetic: false,
            });
        }

        let laz = to_backing(&full);
        debug!(archive = %laz.display(), "create: materialising archive");
        let mut guard = self.table.lock();
        let prepared = prepare_tmp(&laz, BackingOpen::Create(mode), &self.scratch_dir)?;
        // Nothing to decompress out of a brand new archive.
        let snapshot = guard.insert(path, prepared, true);
        Ok(OpenHandle {
            file: snapshot.backing,
            synthetic: true,
        })
    }

    pub fn read(&self, path: &str, handle: &OpenHandle, offset: u64, size: u32) -> OpResult<Vec<u8>> {
        if !handle.synthetic {
            return read_at(&handle.file, offset, size);
        }

        let snapshot = self.borrow_scratch(path);
        // I/O happens outside the table lock.
        let result = read_at(&snapshot.scratch, offset, size);
        self.unborrow(path);
        result
    }

    pub fn write(&self, path: &str, handle: &OpenHandle, offset: u64, data: &[u8]) -> OpResult<usize> {
        if !handle.synthetic {
            handle.file.write_all_at(data, offset).errno()?;
            return Ok(data.len());
        }

        let snapshot = self.borrow_scratch(path);
        if !snapshot.dirty {
            self.table.lock().mark_dirty(path);
        }
        let result = snapshot
            .scratch
            .write_all_at(data, offset)
            .errno()
            .map(|()| data.len());
        self.unborrow(path);
        result
    }

    pub fn flush(&self, path: &str) -> OpResult<()> {
        debug!(path, "flush");
        Ok(())
    }

    pub fn fsync(&self, path: &str, handle: &OpenHandle, datasync: bool) -> OpResult<()> {
        debug!(path, datasync, "fsync");
        let sync = |file: &File| {
            if datasync {
                file.sync_data().errno()
            } else {
                file.sync_all().errno()
            }
        };
        if !handle.synthetic {
            return sync(&handle.file);
        }
        let snapshot = self.borrow_scratch(path);
        let result = sync(&snapshot.scratch);
        self.unborrow(path);
        result
    }

    pub fn ftruncate(&self, path: &str, handle: &OpenHandle, size: u64) -> OpResult<()> {
        debug!(path, size, "ftruncate");
        if !handle.synthetic {
            return handle.file.set_len(size).errno();
        }
        let snapshot = self.borrow_scratch(path);
        if !snapshot.dirty {
            self.table.lock().mark_dirty(path);
        }
        let result = snapshot.scratch.set_len(size).errno();
        self.unborrow(path);
        result
    }

    pub fn truncate(&self, path: &str, size: u64) -> OpResult<()> {
        debug!(path, size, "truncate");
        let full = self.full(path);
        if !is_synthetic_las(&full) {
            let file = OpenOptions::new().write(true).open(&full).errno()?;
            return file.set_len(size).errno();
        }

        let outcome = self.table.lock().lookup(path, true);
        match outcome {
            Lookup::Hit(snapshot) => {
                if !snapshot.dirty {
                    self.table.lock().mark_dirty(path);
                }
                let result = snapshot.scratch.set_len(size).errno();
                self.unborrow(path);
                result
            }
            // Truncating a synthetic path that nobody holds open would mean
            // a full decompress/recompress cycle; it arrives through an open
            // descriptor in practice.
            _ => Err(Errno::ENOENT),
        }
    }

    /// Last-release handling. For a synthetic path this is where a dirty
    /// scratch file is compressed back over the archive.
    pub fn release(&self, path: &str, handle: &OpenHandle) -> OpResult<()> {
        debug!(path, "release");
        if !handle.synthetic {
            // Dropping the handle closes the descriptor.
            return Ok(());
        }

        let full = self.full(path);
        let mut guard = self.table.lock();
        match guard.lookup(path, false) {
            Lookup::Hit(snapshot) => {
                let mut result = Ok(());
                if snapshot.is_last_holder && snapshot.dirty {
                    result = self.compress_back(&mut guard, path, &full, &snapshot);
                    if let Err(err) = result {
                        error!(path, %err, "compress-back failed");
                    }
                }
                guard.release(path);
                result
            }
            // Entry already gone or dying; nothing left to release.
            _ => Ok(()),
        }
    }

    /// Teardown of a dirty entry: compress the scratch file into a fresh
    /// temporary beside the archive, carry the archive's ownership and mode
    /// over, atomically swap it in, and persist the new logical size.
    fn compress_back(
        &self,
        guard: &mut TableGuard<'_>,
        name: &str,
        full_las: &Path,
        snapshot: &EntrySnapshot,
    ) -> OpResult<()> {
        let laz = to_backing(full_las);
        debug!(archive = %laz.display(), "compressing scratch back into archive");

        // Created in the backing root so the final rename stays on one
        // device.
        let staging = tempfile::Builder::new()
            .prefix("lazfs.")
            .tempfile_in(&self.backing_root)
            .errno()?;
        let dst = Arc::new(staging.as_file().try_clone().errno()?);

        guard.mark_dead_and_compress(&self.table, &self.pool, name, compress_routine, dst)?;

        let identity = snapshot.backing.metadata().errno()?;
        fchown(
            staging.as_file(),
            Some(Uid::from_raw(identity.uid())),
            Some(Gid::from_raw(identity.gid())),
        )?;
        fchmod(staging.as_file(), Mode::from_bits_truncate(identity.mode()))?;

        let logical_size = snapshot.scratch.metadata().errno()?.len();
        staging.persist(&laz).map_err(|e| io_errno(&e.error))?;

        match sidecar::set_size(&laz, logical_size as i64) {
            Ok(()) => {}
            Err(e) if e == Errno::EOPNOTSUPP => {
                // The backing file system refuses the attribute namespace;
                // the logical size stays recoverable from the payload.
                warn!(archive = %laz.display(), "cannot persist logical size sidecar");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // --- passthrough namespace operations --------------------------------

    pub fn readlink(&self, path: &str) -> OpResult<PathBuf> {
        debug!(path, "readlink");
        fs::read_link(self.full(path)).errno()
    }

    pub fn mknod(&self, path: &str, mode: u32, rdev: u64, caller: Caller) -> OpResult<()> {
        debug!(path, mode, "mknod");
        let full = self.full(path);
        let _ugid = UgidGuard::assume(caller);

        match mode & libc::S_IFMT {
            libc::S_IFREG => {
                // More portable than mknod for plain files.
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(mode & 0o7777)
                    .open(&full)
                    .errno()
                    .map(drop)
            }
            libc::S_IFIFO => mkfifo(&full, Mode::from_bits_truncate(mode)),
            _ => nix::sys::stat::mknod(
                &full,
                SFlag::from_bits_truncate(mode),
                Mode::from_bits_truncate(mode),
                rdev as libc::dev_t,
            ),
        }
    }

    pub fn mkdir(&self, path: &str, mode: u32, caller: Caller) -> OpResult<()> {
        debug!(path, mode, "mkdir");
        let _ugid = UgidGuard::assume(caller);
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.full(path))
            .errno()
    }

    pub fn unlink(&self, path: &str) -> OpResult<()> {
        debug!(path, "unlink");
        fs::remove_file(self.routed(path)).errno()
    }

    pub fn rmdir(&self, path: &str) -> OpResult<()> {
        debug!(path, "rmdir");
        fs::remove_dir(self.full(path)).errno()
    }

    pub fn symlink(&self, target: &Path, link: &str, caller: Caller) -> OpResult<()> {
        debug!(?target, link, "symlink");
        let _ugid = UgidGuard::assume(caller);
        std::os::unix::fs::symlink(target, self.full(link)).errno()
    }

    pub fn rename(&self, from: &str, to: &str) -> OpResult<()> {
        debug!(from, to, "rename");
        fs::rename(self.full(from), self.full(to)).errno()
    }

    pub fn link(&self, from: &str, to: &str) -> OpResult<()> {
        debug!(from, to, "link");
        fs::hard_link(self.full(from), self.full(to)).errno()
    }

    pub fn chmod(&self, path: &str, mode: u32) -> OpResult<()> {
        debug!(path, mode, "chmod");
        fs::set_permissions(self.full(path), fs::Permissions::from_mode(mode)).errno()
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> OpResult<()> {
        debug!(path, ?uid, ?gid, "chown");
        nix::unistd::chown(
            &self.full(path),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )
    }

    pub fn utime(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> OpResult<()> {
        debug!(path, "utime");
        filetime::set_file_times(
            self.routed(path),
            FileTime::from_system_time(atime),
            FileTime::from_system_time(mtime),
        )
        .errno()
    }

    pub fn access(&self, path: &str, mask: i32) -> OpResult<()> {
        debug!(path, mask, "access");
        nix::unistd::access(&self.routed(path), AccessFlags::from_bits_truncate(mask))
    }

    pub fn statfs(&self, path: &str) -> OpResult<Statvfs> {
        debug!(path, "statfs");
        nix::sys::statvfs::statvfs(&self.full(path))
    }

    // --- extended attributes ---------------------------------------------

    pub fn setxattr(&self, path: &str, name: &OsStr, value: &[u8], flags: i32) -> OpResult<()> {
        debug!(path, ?name, "setxattr");
        xattr::set(&self.routed(path), name, value, flags)
    }

    pub fn getxattr(&self, path: &str, name: &OsStr) -> OpResult<Vec<u8>> {
        debug!(path, ?name, "getxattr");
        xattr::get(&self.routed(path), name)
    }

    pub fn listxattr(&self, path: &str) -> OpResult<Vec<OsString>> {
        debug!(path, "listxattr");
        xattr::list(&self.routed(path))
    }

    pub fn removexattr(&self, path: &str, name: &OsStr) -> OpResult<()> {
        debug!(path, ?name, "removexattr");
        xattr::remove(&self.routed(path), name)
    }

    // --- directories ------------------------------------------------------

    /// List a directory, rewriting every `.laz` entry to the synthetic
    /// `.las` name. No other filtering happens here.
    pub fn readdir(&self, path: &str) -> OpResult<Vec<DirEntryInfo>> {
        debug!(path, "readdir");
        let mut entries = Vec::new();
        for dent in fs::read_dir(self.full(path)).errno()? {
            let dent = dent.errno()?;
            let name = dent.file_name();
            let kind = dent
                .file_type()
                .map(FileKind::from)
                .unwrap_or(FileKind::Other);
            if router::is_backing_name(&name) {
                entries.push(DirEntryInfo {
                    name: router::to_synthetic_name(&name),
                    kind: FileKind::RegularFile,
                });
            } else {
                entries.push(DirEntryInfo { name, kind });
            }
        }
        Ok(entries)
    }
}

fn open_passthrough(path: &Path, flags: i32) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(flags & libc::O_ACCMODE != libc::O_WRONLY);
    opts.write(flags & libc::O_ACCMODE != libc::O_RDONLY);
    opts.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC));
    opts.open(path)
}
