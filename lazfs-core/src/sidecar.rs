// SPDX-License-Identifier: GPL-3.0-or-later
//! Logical-size sidecar
//!
//! The uncompressed size of a `.laz` archive is persisted as an extended
//! attribute on the archive itself, so `getattr` on the synthetic `.las` can
//! answer without decompressing anything. The value is a fixed-width
//! little-endian `i64`; the attribute is authoritative only while no live
//! entry references the archive.

use std::ffi::OsStr;
use std::path::Path;

use crate::error::{Errno, OpResult};
use crate::xattr;

/// Name of the extended attribute carrying the logical size.
pub const SIZE_ATTR: &str = "lazfs.size";

/// Read the logical size recorded on `laz_path`.
///
/// `ENODATA` means the attribute was never written; `ENOTSUP` means the
/// backing file system refuses the attribute namespace. Callers are expected
/// to fall back to inspecting the archive in either case.
pub fn get_size(laz_path: &Path) -> OpResult<i64> {
    let value = xattr::get(laz_path, OsStr::new(SIZE_ATTR))?;
    // A value of any other width means somebody else wrote the attribute.
    let raw: [u8; 8] = value.as_slice().try_into().map_err(|_| Errno::EIO)?;
    Ok(i64::from_le_bytes(raw))
}

/// Record `size` as the logical size of `laz_path`.
pub fn set_size(laz_path: &Path, size: i64) -> OpResult<()> {
    xattr::set(laz_path, OsStr::new(SIZE_ATTR), &size.to_le_bytes(), 0)
}
