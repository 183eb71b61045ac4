// SPDX-License-Identifier: GPL-3.0-or-later
//! Name-keyed entry table
//!
//! The table owns every live entry and serialises all membership changes and
//! entry-field mutations behind a single mutex. Per-entry condition
//! variables attached to that mutex carry the readiness protocol: a freshly
//! inserted entry is not ready exactly while a background (de)compression
//! job is pending for it, and every waiter rechecks the flag after waking.
//!
//! Callers obtain a [`TableGuard`] with [`EntryTable::lock`] and hold it
//! across any sequence that must be atomic, mirroring how the upcall
//! handlers keep the table locked from lookup through mutation.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use lazfs_core::error::Errno;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::entry::{Entry, EntrySnapshot};
use crate::scratch::PreparedTmp;
use crate::workq::{Job, JobRoutine, WorkQueue};

/// Outcome of a table lookup.
pub enum Lookup {
    /// Entry found and ready; snapshot taken.
    Hit(EntrySnapshot),
    /// No entry for this name.
    Miss,
    /// Entry exists but is being torn down; the caller should retry the
    /// whole operation once teardown finishes.
    Dead,
}

/// Counters mirroring the table's lifetime activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Live entries right now.
    pub entries: usize,
    /// Entries ever inserted; each insert is one scratch-file cycle.
    pub inserts: u64,
    /// Lookups that found a live entry.
    pub hits: u64,
}

struct TableInner {
    entries: HashMap<String, Entry>,
    inserts: u64,
    hits: u64,
}

/// Ordered collection of entries keyed by logical path.
pub struct EntryTable {
    inner: Mutex<TableInner>,
}

impl EntryTable {
    pub fn new() -> Self {
        EntryTable {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                inserts: 0,
                hits: 0,
            }),
        }
    }

    /// Take the table mutex. All operations live on the returned guard.
    pub fn lock(&self) -> TableGuard<'_> {
        TableGuard {
            inner: self.inner.lock(),
        }
    }

    /// Deliver a job result for `name`: store the error, flip the entry to
    /// ready (dead as well, on failure) and wake every waiter. Called by the
    /// worker after the routine returns.
    pub fn complete(&self, name: &str, result: Result<(), Errno>) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(name)
            .expect("job completed for an entry that no longer exists");
        entry.completion_err = result.err();
        entry.ready = true;
        if entry.completion_err.is_some() {
            entry.dead = true;
        }
        entry.signal.notify_all();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            inserts: inner.inserts,
            hits: inner.hits,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive view of the table while the mutex is held.
pub struct TableGuard<'a> {
    inner: MutexGuard<'a, TableInner>,
}

impl TableGuard<'_> {
    /// Insert a fresh entry with one external reference. `ready` is false
    /// precisely when the caller is about to schedule a decompression job
    /// for it. Inserting over a live entry is a dispatcher bug.
    pub fn insert(&mut self, name: &str, prepared: PreparedTmp, ready: bool) -> EntrySnapshot {
        assert!(
            !self.inner.entries.contains_key(name),
            "duplicate insert for {name}"
        );
        let entry = Entry::new(prepared, ready);
        let snapshot = entry.snapshot();
        self.inner.entries.insert(name.to_string(), entry);
        self.inner.inserts += 1;
        snapshot
    }

    /// Find an entry by name, waiting out any in-flight job on it.
    ///
    /// With `inc_refs` the caller takes a handle it must pair with a later
    /// [`release`](Self::release). A dead entry is reported as such and the
    /// refcount is left alone.
    pub fn lookup(&mut self, name: &str, inc_refs: bool) -> Lookup {
        loop {
            let signal = match self.inner.entries.get(name) {
                None => return Lookup::Miss,
                Some(entry) if entry.ready => None,
                Some(entry) => Some(Arc::clone(&entry.signal)),
            };
            match signal {
                None => break,
                Some(signal) => {
                    signal.wait(&mut self.inner);
                }
            }
        }

        let entry = self
            .inner
            .entries
            .get_mut(name)
            .expect("entry vanished while ready");
        if entry.dead {
            return Lookup::Dead;
        }
        if inc_refs {
            entry.refs += 1;
        }
        let snapshot = entry.snapshot();
        self.inner.hits += 1;
        Lookup::Hit(snapshot)
    }

    /// Block until the pending job on `name` finishes, then sample its
    /// result. Only meaningful after this caller scheduled a job for the
    /// entry.
    pub fn wait_ready(&mut self, name: &str) -> Result<(), Errno> {
        loop {
            let signal = {
                let entry = self
                    .inner
                    .entries
                    .get(name)
                    .expect("waited on an entry that no longer exists");
                if entry.ready {
                    break;
                }
                Arc::clone(&entry.signal)
            };
            signal.wait(&mut self.inner);
        }

        match self.inner.entries[name].completion_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Mark the entry dirty. Idempotent; the flag is sticky for the life of
    /// the entry. Dirtying a path that was never opened is a dispatcher bug.
    pub fn mark_dirty(&mut self, name: &str) {
        self.inner
            .entries
            .get_mut(name)
            .expect("mark_dirty on unknown entry")
            .dirty = true;
    }

    /// Begin tearing the entry down: refuse new handles, schedule the
    /// compress-back job on `pool` and block until it completes.
    ///
    /// The condvar wait releases the table mutex while blocked, so unrelated
    /// upcalls keep flowing during a long compression; `dead` keeps the
    /// entry itself off limits for the duration.
    pub fn mark_dead_and_compress(
        &mut self,
        table: &Arc<EntryTable>,
        pool: &WorkQueue,
        name: &str,
        routine: JobRoutine,
        dst: Arc<File>,
    ) -> Result<(), Errno> {
        let entry = self
            .inner
            .entries
            .get_mut(name)
            .expect("compress-back for unknown entry");
        entry.dead = true;
        entry.ready = false;
        entry.completion_err = None;
        let src = Arc::clone(&entry.scratch);

        let complete = {
            let table = Arc::clone(table);
            let name = name.to_string();
            move |result| table.complete(&name, result)
        };
        pool.run(Job::new(routine, src, dst, complete));

        self.wait_ready(name)
    }

    /// Drop one external reference; the last one unlinks the entry from the
    /// table and destroys it, closing both descriptors and removing the
    /// scratch file. Releasing a name with no entry silently succeeds.
    pub fn release(&mut self, name: &str) {
        let Some(entry) = self.inner.entries.get_mut(name) else {
            debug!(name, "release for a name with no entry");
            return;
        };
        assert!(entry.refs > 0, "refcount underflow on {name}");
        entry.refs -= 1;
        if entry.refs == 0 {
            self.inner.entries.remove(name);
        }
    }

    /// Remove an entry outright, regardless of refcount. Used to clean up
    /// after a failed decompression, where the only reference is the one
    /// taken by the insert. Absent names are tolerated.
    pub fn discard(&mut self, name: &str) {
        self.inner.entries.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scratch::{prepare_tmp, BackingOpen};
    use std::path::Path;
    use std::time::Duration;

    fn prepared(root: &Path, scratch: &Path, name: &str) -> PreparedTmp {
        let laz = root.join(name);
        std::fs::write(&laz, b"backing").unwrap();
        prepare_tmp(&laz, BackingOpen::Flags(libc::O_RDONLY), scratch).unwrap()
    }

    fn ok_routine(_: &std::fs::File, _: &std::fs::File) -> Result<(), Errno> {
        Ok(())
    }

    fn failing_routine(_: &std::fs::File, _: &std::fs::File) -> Result<(), Errno> {
        Err(Errno::ENOMEM)
    }

    #[test]
    fn insert_lookup_release_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let table = EntryTable::new();

        let scratch_path = {
            let mut guard = table.lock();
            let snap = guard.insert("/a.las", prepared(root.path(), scratch.path(), "a.laz"), true);
            assert!(snap.is_last_holder);
            snap.scratch_path
        };
        assert!(scratch_path.exists());

        {
            let mut guard = table.lock();
            match guard.lookup("/a.las", true) {
                Lookup::Hit(snap) => assert!(!snap.is_last_holder),
                _ => panic!("expected a hit"),
            }
            assert!(matches!(guard.lookup("/other.las", false), Lookup::Miss));
        }

        {
            let mut guard = table.lock();
            guard.release("/a.las");
            guard.release("/a.las");
        }
        assert!(table.is_empty());
        assert!(!scratch_path.exists());

        let stats = table.stats();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn dirty_is_idempotent_and_sticky() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let table = EntryTable::new();

        let mut guard = table.lock();
        guard.insert("/d.las", prepared(root.path(), scratch.path(), "d.laz"), true);
        guard.mark_dirty("/d.las");
        guard.mark_dirty("/d.las");
        match guard.lookup("/d.las", false) {
            Lookup::Hit(snap) => assert!(snap.dirty),
            _ => panic!("expected a hit"),
        }
    }

    #[test]
    fn lookup_waits_for_completion() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let table = Arc::new(EntryTable::new());

        table
            .lock()
            .insert("/w.las", prepared(root.path(), scratch.path(), "w.laz"), false);

        let completer = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                table.complete("/w.las", Ok(()));
            })
        };

        // Blocks until the helper thread flips the entry to ready.
        match table.lock().lookup("/w.las", false) {
            Lookup::Hit(_) => {}
            _ => panic!("expected the ready entry"),
        }
        completer.join().unwrap();
    }

    #[test]
    fn failed_jobs_turn_the_entry_dead() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let table = Arc::new(EntryTable::new());

        table
            .lock()
            .insert("/f.las", prepared(root.path(), scratch.path(), "f.laz"), false);
        table.complete("/f.las", Err(Errno::ENOMEM));

        let mut guard = table.lock();
        assert!(matches!(guard.lookup("/f.las", true), Lookup::Dead));
        assert_eq!(guard.wait_ready("/f.las"), Err(Errno::ENOMEM));
        guard.discard("/f.las");
        drop(guard);
        assert!(table.is_empty());
    }

    #[test]
    fn compress_back_reports_the_job_result() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let table = Arc::new(EntryTable::new());
        let pool = WorkQueue::new(1);

        table
            .lock()
            .insert("/c.las", prepared(root.path(), scratch.path(), "c.laz"), true);
        let dst = Arc::new(tempfile::tempfile().unwrap());

        let mut guard = table.lock();
        guard
            .mark_dead_and_compress(&table, &pool, "/c.las", ok_routine, Arc::clone(&dst))
            .unwrap();
        assert!(matches!(guard.lookup("/c.las", true), Lookup::Dead));
        drop(guard);

        table
            .lock()
            .insert("/e.las", prepared(root.path(), scratch.path(), "e.laz"), true);
        let err = table
            .lock()
            .mark_dead_and_compress(&table, &pool, "/e.las", failing_routine, dst)
            .unwrap_err();
        assert_eq!(err, Errno::ENOMEM);
    }
}
