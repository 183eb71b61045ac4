//! Entry state for one live synthetic path

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use lazfs_core::error::Errno;
use parking_lot::Condvar;
use tempfile::TempPath;

use crate::scratch::PreparedTmp;

/// Table record coordinating one live synthetic `.las` path.
///
/// Fields are only ever read or written under the table mutex. The files are
/// shared with in-flight codec jobs through the `Arc`s, which is what keeps
/// the descriptors alive for exactly as long as anything can still touch
/// them; the scratch path unlinks itself when the entry is dropped.
pub(crate) struct Entry {
    pub(crate) scratch_path: TempPath,
    pub(crate) backing: Arc<File>,
    pub(crate) scratch: Arc<File>,
    /// Outstanding external handles.
    pub(crate) refs: u32,
    /// Sticky once set; forces recompression at last release.
    pub(crate) dirty: bool,
    /// False exactly while a (de)compression job targets this entry.
    pub(crate) ready: bool,
    /// Entry is being torn down; new handles are refused.
    pub(crate) dead: bool,
    /// Result of the most recent job, sampled by waiters.
    pub(crate) completion_err: Option<Errno>,
    /// Broadcast whenever `ready` flips true, under the table mutex.
    pub(crate) signal: Arc<Condvar>,
}

impl Entry {
    pub(crate) fn new(prepared: PreparedTmp, ready: bool) -> Self {
        Entry {
            scratch_path: prepared.scratch_path,
            backing: Arc::new(prepared.backing),
            scratch: Arc::new(prepared.scratch),
            refs: 1,
            dirty: false,
            ready,
            dead: false,
            completion_err: None,
            signal: Arc::new(Condvar::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            scratch_path: self.scratch_path.to_path_buf(),
            backing: Arc::clone(&self.backing),
            scratch: Arc::clone(&self.scratch),
            dirty: self.dirty,
            is_last_holder: self.refs == 1,
        }
    }
}

/// Copy of the entry fields a caller may use outside the table lock.
#[derive(Clone)]
pub struct EntrySnapshot {
    pub scratch_path: PathBuf,
    pub backing: Arc<File>,
    pub scratch: Arc<File>,
    pub dirty: bool,
    /// True when the observing caller holds the only outstanding handle.
    pub is_last_holder: bool,
}
