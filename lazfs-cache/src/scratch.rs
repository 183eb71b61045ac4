//! Scratch-file preparation and teardown
//!
//! A scratch file is the uncompressed twin of a backing archive, created
//! under the scratch directory with a unique `lazfs.` name. Preparation
//! opens (or creates) the backing archive and the scratch file as a pair;
//! every partially acquired resource is released by drop if anything fails,
//! and dropping the finished pair closes both descriptors and unlinks the
//! scratch path.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use lazfs_core::error::{IoResultExt, OpResult};
use tempfile::TempPath;

/// How to acquire the backing archive descriptor.
#[derive(Debug, Clone, Copy)]
pub enum BackingOpen {
    /// Open an existing archive with the kernel-supplied open flags.
    Flags(i32),
    /// Create a fresh archive with the given mode.
    Create(u32),
}

/// An open backing archive plus its scratch twin.
///
/// Dropping this (or the entry that swallows it) closes both files and
/// removes the scratch path from disk.
#[derive(Debug)]
pub struct PreparedTmp {
    pub backing: File,
    pub scratch: File,
    pub scratch_path: TempPath,
}

fn open_backing(path: &Path, how: BackingOpen) -> std::io::Result<File> {
    match how {
        BackingOpen::Flags(flags) => {
            let mut opts = OpenOptions::new();
            // The archive is the decompression source and the identity for
            // fstat, so it must be readable no matter what the caller asked.
            opts.read(true);
            if flags & libc::O_ACCMODE != libc::O_RDONLY {
                opts.write(true);
            }
            opts.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC));
            opts.open(path)
        }
        BackingOpen::Create(mode) => OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path),
    }
}

/// Open `backing_path` as directed and create a uniquely named scratch file
/// in `scratch_dir`.
pub fn prepare_tmp(
    backing_path: &Path,
    how: BackingOpen,
    scratch_dir: &Path,
) -> OpResult<PreparedTmp> {
    let backing = open_backing(backing_path, how).errno()?;
    let scratch = tempfile::Builder::new()
        .prefix("lazfs.")
        .tempfile_in(scratch_dir)
        .errno()?;
    let (scratch, scratch_path) = scratch.into_parts();
    Ok(PreparedTmp {
        backing,
        scratch,
        scratch_path,
    })
}
