//! Errno plumbing for the upcall boundary
//!
//! Every operation handler ultimately answers the kernel with an errno, so
//! the common result currency across the workspace is `Result<T, Errno>`.
//! Richer error enums exist where a subsystem has structure worth keeping
//! (the codec, mount setup); they are flattened to an `Errno` at the border.

pub use nix::errno::Errno;

/// Result type used by upcall handlers and the subsystems below them.
pub type OpResult<T> = Result<T, Errno>;

/// Convert an `io::Error` into the errno the kernel should see.
///
/// Errors synthesised inside the process (no OS error attached) degrade to
/// `EIO`, which is what a passthrough file system can honestly report.
pub fn io_errno(err: &std::io::Error) -> Errno {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code),
        None => Errno::EIO,
    }
}

/// Extension trait mapping `io::Result` into [`OpResult`].
pub trait IoResultExt<T> {
    fn errno(self) -> OpResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn errno(self) -> OpResult<T> {
        self.map_err(|e| io_errno(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_errors_keep_their_code() {
        let err = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(io_errno(&err), Errno::ENOENT);
    }

    #[test]
    fn synthetic_errors_become_eio() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "no os code");
        assert_eq!(io_errno(&err), Errno::EIO);
    }
}
