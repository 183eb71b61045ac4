//! Shared fixtures for the dispatcher tests

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use lazfs_codec::Header;
use lazfs_vfs::{Caller, LazFs};

pub struct Fixture {
    pub root: tempfile::TempDir,
    pub scratch: tempfile::TempDir,
}

pub fn fixture() -> Fixture {
    Fixture {
        root: tempfile::tempdir().unwrap(),
        scratch: tempfile::tempdir().unwrap(),
    }
}

impl Fixture {
    pub fn lazfs(&self) -> LazFs {
        LazFs::new(self.root.path(), Some(self.scratch.path().to_path_buf()), 2).unwrap()
    }

    /// Scratch files currently on disk.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }
}

/// Assemble the uncompressed container for `records`.
pub fn las_bytes(records: &[u8], record_len: u32) -> Vec<u8> {
    assert_eq!(records.len() % record_len as usize, 0);
    let header = Header::new(record_len, (records.len() / record_len as usize) as u64);
    let mut out = header.encode().to_vec();
    out.extend_from_slice(records);
    out
}

/// Write a compressed archive under `dir` and return the uncompressed bytes
/// it decodes to.
pub fn write_laz(dir: &Path, name: &str, records: &[u8], record_len: u32) -> Vec<u8> {
    let las = las_bytes(records, record_len);
    let mut src = tempfile::tempfile().unwrap();
    src.write_all(&las).unwrap();
    let dst = File::create(dir.join(name)).unwrap();
    lazfs_codec::compress(&src, &dst).unwrap();
    las
}

pub fn caller() -> Caller {
    Caller {
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
    }
}

/// Whether the file system under `dir` accepts the sidecar attribute.
pub fn sidecar_supported(dir: &Path) -> bool {
    let probe = dir.join(".sidecar-probe");
    std::fs::write(&probe, b"probe").unwrap();
    let supported = lazfs_core::sidecar::set_size(&probe, 1).is_ok();
    let _ = std::fs::remove_file(&probe);
    supported
}
