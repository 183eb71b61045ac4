//! Path routing between synthetic `.las` names and backing `.laz` archives
//!
//! A logical path ending in `.las` that does not exist verbatim in the
//! backing tree is "synthetic": it is served from the `.laz` archive sitting
//! next to it. The router only rewrites the final byte of the suffix, so the
//! synthetic name and its backing archive always share a directory.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Suffix of synthetic (uncompressed) point-cloud files.
pub const SYNTHETIC_SUFFIX: &[u8] = b".las";
/// Suffix of backing (compressed) point-cloud archives.
pub const BACKING_SUFFIX: &[u8] = b".laz";

/// Resolve a logical path (as delivered by the transport, rooted at `/`)
/// against the backing directory tree.
pub fn full_path(backing_root: &Path, logical: &str) -> PathBuf {
    backing_root.join(logical.trim_start_matches('/'))
}

fn name_has_suffix(path: &Path, suffix: &[u8]) -> bool {
    match path.file_name() {
        Some(name) => name.as_bytes().ends_with(suffix),
        None => false,
    }
}

/// True when `full` names a synthetic `.las`: the suffix matches and no file
/// of that literal name exists in the backing store. An existing `.las` is
/// always served verbatim, even if a sibling `.laz` is present.
pub fn is_synthetic_las(full: &Path) -> bool {
    name_has_suffix(full, SYNTHETIC_SUFFIX) && std::fs::symlink_metadata(full).is_err()
}

/// True when a directory entry name should be rewritten by `readdir`.
pub fn is_backing_name(name: &OsStr) -> bool {
    name.as_bytes().ends_with(BACKING_SUFFIX)
}

fn swap_last_byte(bytes: &[u8], to: u8) -> Vec<u8> {
    let mut out = bytes.to_vec();
    if let Some(last) = out.last_mut() {
        *last = to;
    }
    out
}

/// Map a synthetic `.las` path to its backing `.laz` archive.
pub fn to_backing(full_las: &Path) -> PathBuf {
    debug_assert!(name_has_suffix(full_las, SYNTHETIC_SUFFIX));
    PathBuf::from(OsString::from_vec(swap_last_byte(
        full_las.as_os_str().as_bytes(),
        b'z',
    )))
}

/// Map a `.laz` directory-entry name to the synthetic `.las` name offered to
/// `readdir` callers.
pub fn to_synthetic_name(backing_name: &OsStr) -> OsString {
    debug_assert!(backing_name.as_bytes().ends_with(BACKING_SUFFIX));
    OsString::from_vec(swap_last_byte(backing_name.as_bytes(), b's'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_joins_under_root() {
        let root = Path::new("/data/clouds");
        assert_eq!(full_path(root, "/a/b.las"), PathBuf::from("/data/clouds/a/b.las"));
        assert_eq!(full_path(root, "/"), PathBuf::from("/data/clouds"));
    }

    #[test]
    fn backing_rewrite_swaps_final_byte() {
        assert_eq!(to_backing(Path::new("/r/scan.las")), PathBuf::from("/r/scan.laz"));
        assert_eq!(
            to_synthetic_name(OsStr::new("scan.laz")),
            OsString::from("scan.las")
        );
    }

    #[test]
    fn suffix_detection_ignores_directories_in_the_middle() {
        assert!(!name_has_suffix(Path::new("/x.las/inner"), SYNTHETIC_SUFFIX));
        assert!(name_has_suffix(Path::new("/x/inner.las"), SYNTHETIC_SUFFIX));
    }

    #[test]
    fn existing_las_is_not_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.las");
        std::fs::write(&real, b"plain").unwrap();
        assert!(!is_synthetic_las(&real));
        assert!(is_synthetic_las(&dir.path().join("ghost.las")));
        assert!(!is_synthetic_las(&dir.path().join("ghost.txt")));
    }
}
