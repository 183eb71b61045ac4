//! File-coordination core for LazFS
//!
//! Everything that makes the pass-through safe under concurrent upcalls:
//! - [`table`]: the name-keyed entry table with refcounting, dirty tracking
//!   and wait/signal semantics for asynchronous (de)compression;
//! - [`workq`]: the fixed-size worker pool that runs codec jobs off the
//!   request thread;
//! - [`scratch`]: creation and teardown of the uniquely named scratch files
//!   that serve live synthetic paths.

pub mod entry;
pub mod scratch;
pub mod table;
pub mod workq;

pub use entry::EntrySnapshot;
pub use scratch::{prepare_tmp, BackingOpen, PreparedTmp};
pub use table::{CacheStats, EntryTable, Lookup, TableGuard};
pub use workq::{Job, JobRoutine, WorkQueue};
