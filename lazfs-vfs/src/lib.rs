//! LazFS virtual filesystem
//!
//! Exposes a backing directory tree through FUSE, serving compressed `.laz`
//! point-cloud archives as synthetic uncompressed `.las` files. The
//! [`fs::LazFs`] dispatcher carries the per-operation policies and is fully
//! usable (and tested) without a kernel mount; [`mount`] wires it to the
//! FUSE transport.

use std::path::PathBuf;

use thiserror::Error;

pub mod fs;
pub mod fuse;
pub mod stat;
pub mod ugid;

pub use fs::{DirEntryInfo, FileKind, LazFs, OpenHandle};
pub use stat::FileStat;
pub use ugid::Caller;

/// VFS errors raised while setting a mount up.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("backing root does not exist: {0}")]
    BackingRootNotFound(String),

    #[error("backing root is not a directory: {0}")]
    BackingRootNotDirectory(String),

    #[error("mount point does not exist: {0}")]
    MountPointNotFound(String),

    #[error("mount point is not a directory: {0}")]
    MountPointNotDirectory(String),

    #[error("scratch directory is not usable: {0}")]
    ScratchDirUnusable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mount options
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Directory tree served through the mount.
    pub backing_root: PathBuf,
    /// Where to attach the filesystem.
    pub mount_point: PathBuf,
    /// Directory for decompressed scratch files; the system temp directory
    /// when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Worker threads for (de)compression; one per CPU when unset.
    pub threads: Option<usize>,
    /// Allow other users to access the mount.
    pub allow_other: bool,
    /// Read-only mount.
    pub read_only: bool,
    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,
}

/// Mount a LazFS over `config.mount_point`, blocking until the filesystem is
/// unmounted. The exit status of the transport session is the return value.
pub fn mount(config: MountConfig) -> Result<(), VfsError> {
    let mount_point = &config.mount_point;
    let meta = std::fs::metadata(mount_point)
        .map_err(|_| VfsError::MountPointNotFound(mount_point.display().to_string()))?;
    if !meta.is_dir() {
        return Err(VfsError::MountPointNotDirectory(
            mount_point.display().to_string(),
        ));
    }

    let threads = config.threads.unwrap_or_else(num_cpus::get).max(1);
    let lazfs = LazFs::new(&config.backing_root, config.scratch_dir.clone(), threads)?;

    let mut mount_options = vec![fuser::MountOption::FSName("lazfs".to_string())];
    if config.read_only {
        mount_options.push(fuser::MountOption::RO);
    }
    if config.auto_unmount {
        mount_options.push(fuser::MountOption::AutoUnmount);
    }

    let mut options = fuser::Config::default();
    options.mount_options = mount_options;
    options.acl = if config.allow_other {
        fuser::SessionACL::All
    } else {
        fuser::SessionACL::Owner
    };

    fuser::mount2(fuse::LazFuse::new(lazfs), mount_point, &options)?;
    Ok(())
}
