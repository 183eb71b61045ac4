//! Stat buffers and the synthetic-path merging rules

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lazfs_core::error::{IoResultExt, OpResult};

/// Attributes of a file as the mount reports them.
///
/// For a synthetic `.las` the identity fields (owner, mode, inode, link
/// count) always describe the `.laz` archive, while size and the data
/// timestamps may come from the live scratch file. [`FileStat::merged`]
/// implements that combination.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    }
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        FileStat {
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            blksize: meta.blksize(),
            blocks: meta.blocks(),
            atime: system_time(meta.atime(), meta.atime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    /// `lstat` semantics: the link itself, not its target.
    pub fn lstat(path: &Path) -> OpResult<Self> {
        std::fs::symlink_metadata(path)
            .errno()
            .map(|meta| Self::from_metadata(&meta))
    }

    /// Combine identity metadata from the backing archive with size and data
    /// timestamps from the scratch file serving it.
    pub fn merged(identity: &Metadata, data: &Metadata) -> Self {
        let mut st = Self::from_metadata(identity);
        st.size = data.size();
        st.blocks = data.blocks();
        st.atime = system_time(data.atime(), data.atime_nsec());
        st.mtime = system_time(data.mtime(), data.mtime_nsec());
        st.ctime = system_time(data.ctime(), data.ctime_nsec());
        st
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn merged_takes_identity_and_data_from_the_right_sides() {
        let dir = tempfile::tempdir().unwrap();
        let identity_path = dir.path().join("identity");
        let data_path = dir.path().join("data");
        std::fs::write(&identity_path, b"iii").unwrap();
        std::fs::write(&data_path, b"dddddddd").unwrap();
        std::fs::set_permissions(&identity_path, std::fs::Permissions::from_mode(0o640)).unwrap();

        let identity = std::fs::metadata(&identity_path).unwrap();
        let data = std::fs::metadata(&data_path).unwrap();
        let st = FileStat::merged(&identity, &data);

        assert_eq!(st.size, 8);
        assert_eq!(st.ino, identity.ino());
        assert_eq!(st.mode & 0o7777, 0o640);
    }

    #[test]
    fn negative_timestamps_map_below_the_epoch() {
        assert!(system_time(-5, 0) < UNIX_EPOCH);
        assert_eq!(system_time(1, 0), UNIX_EPOCH + Duration::from_secs(1));
    }
}
