// SPDX-License-Identifier: GPL-3.0-or-later
//! Extended-attribute access
//!
//! Thin errno-mapping layer over the `xattr` crate. Path operations act on
//! the link itself rather than its target, matching how every other
//! passthrough operation treats the backing tree. The crate does not model
//! the create/replace flags of the setxattr syscall, so their contract is
//! reproduced here with a presence probe.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use crate::error::{io_errno, Errno, OpResult};

/// Read an attribute value. An absent attribute surfaces as `ENODATA`.
pub fn get(path: &Path, name: &OsStr) -> OpResult<Vec<u8>> {
    match xattr::get(path, name) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(Errno::ENODATA),
        Err(err) => Err(io_errno(&err)),
    }
}

/// Set an attribute value. `flags` is the raw `XATTR_CREATE`/`XATTR_REPLACE`
/// argument of the upcall, passed through with syscall semantics.
pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> OpResult<()> {
    if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
        let present = matches!(xattr::get(path, name), Ok(Some(_)));
        if flags & libc::XATTR_CREATE != 0 && present {
            return Err(Errno::EEXIST);
        }
        if flags & libc::XATTR_REPLACE != 0 && !present {
            return Err(Errno::ENODATA);
        }
    }
    xattr::set(path, name, value).map_err(|err| io_errno(&err))
}

/// List attribute names.
pub fn list(path: &Path) -> OpResult<Vec<OsString>> {
    xattr::list(path)
        .map(|names| names.collect())
        .map_err(|err| io_errno(&err))
}

/// Remove an attribute.
pub fn remove(path: &Path, name: &OsStr) -> OpResult<()> {
    xattr::remove(path, name).map_err(|err| io_errno(&err))
}
