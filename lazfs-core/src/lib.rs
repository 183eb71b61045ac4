//! LazFS core
//!
//! Shared foundations for the LazFS pass-through file system: the errno-based
//! result type used at the upcall boundary, the path router that decides which
//! backing file serves a logical path, and the sidecar helper that persists
//! the logical (uncompressed) size of a compressed archive.

pub mod error;
pub mod path;
pub mod sidecar;
pub mod xattr;

pub use error::{io_errno, Errno, OpResult};
pub use path::{full_path, is_synthetic_las, to_backing, to_synthetic_name};
