//! End-to-end dispatcher scenarios over a real backing tree
//!
//! These drive the path-keyed operation handlers exactly as the transport
//! would, without a kernel mount.

mod common;

use std::fs::File;
use std::os::unix::fs::PermissionsExt;

use lazfs_core::error::Errno;
use lazfs_core::sidecar;

#[test]
fn cold_read_serves_decompressed_bytes() {
    let fix = common::fixture();
    let records: Vec<u8> = (0..100u8).collect();
    let las = common::write_laz(fix.root.path(), "a.laz", &records, 1);
    let fs = fix.lazfs();

    let handle = fs.open("/a.las", libc::O_RDONLY).unwrap();
    assert!(handle.synthetic);
    assert_eq!(fix.scratch_files().len(), 1, "one scratch file while open");

    let slice = fs.read("/a.las", &handle, 42, 50).unwrap();
    assert_eq!(slice, &las[42..92]);

    let all = fs.read("/a.las", &handle, 0, las.len() as u32 + 16).unwrap();
    assert_eq!(all, las);

    fs.release("/a.las", &handle).unwrap();
    assert_eq!(fs.cache_stats().entries, 0, "entry gone after last release");
    assert!(fix.scratch_files().is_empty(), "scratch file unlinked");
}

#[test]
fn getattr_reports_logical_size_for_closed_archives() {
    let fix = common::fixture();
    let records = vec![0xA5u8; 680];
    let las = common::write_laz(fix.root.path(), "cloud.laz", &records, 17);
    let fs = fix.lazfs();

    let st = fs.getattr("/cloud.las").unwrap();
    assert_eq!(st.size, las.len() as u64);

    // Identity comes from the archive.
    let archive = std::fs::metadata(fix.root.path().join("cloud.laz")).unwrap();
    assert_eq!(st.mode, {
        use std::os::unix::fs::MetadataExt;
        archive.mode()
    });
}

#[test]
fn getattr_follows_the_live_scratch_while_open() {
    let fix = common::fixture();
    let records: Vec<u8> = (0..50u8).collect();
    common::write_laz(fix.root.path(), "grow.laz", &records, 1);
    let fs = fix.lazfs();

    let handle = fs.open("/grow.las", libc::O_RDWR).unwrap();
    let bigger = common::las_bytes(&vec![9u8; 500], 1);
    fs.write("/grow.las", &handle, 0, &bigger).unwrap();

    assert_eq!(fs.getattr("/grow.las").unwrap().size, bigger.len() as u64);
    assert_eq!(
        fs.fgetattr("/grow.las", &handle).unwrap().size,
        bigger.len() as u64
    );

    fs.release("/grow.las", &handle).unwrap();
}

#[test]
fn write_then_close_recompresses_with_identity_preserved() {
    let fix = common::fixture();
    let records: Vec<u8> = (0..100u8).collect();
    let las = common::write_laz(fix.root.path(), "a.laz", &records, 1);
    let laz_path = fix.root.path().join("a.laz");
    std::fs::set_permissions(&laz_path, std::fs::Permissions::from_mode(0o640)).unwrap();
    let fs = fix.lazfs();

    let handle = fs.open("/a.las", libc::O_RDWR).unwrap();
    // First two records live right behind the header.
    let record_offset = lazfs_codec::HEADER_LEN as u64;
    fs.write("/a.las", &handle, record_offset, b"XY").unwrap();
    assert_eq!(fs.read("/a.las", &handle, record_offset, 2).unwrap(), b"XY");
    fs.release("/a.las", &handle).unwrap();

    assert_eq!(fs.cache_stats().entries, 0);
    assert!(fix.scratch_files().is_empty());

    // The archive now decodes to the edited bytes.
    let restored = tempfile::tempfile().unwrap();
    lazfs_codec::decompress(&File::open(&laz_path).unwrap(), &restored).unwrap();
    let mut expected = las.clone();
    expected[lazfs_codec::HEADER_LEN..lazfs_codec::HEADER_LEN + 2].copy_from_slice(b"XY");
    use std::os::unix::fs::FileExt;
    let mut seen = vec![0u8; expected.len()];
    restored.read_exact_at(&mut seen, 0).unwrap();
    assert_eq!(seen, expected);

    // Owner and mode survive the swap.
    let meta = std::fs::metadata(&laz_path).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o640);

    if common::sidecar_supported(fix.root.path()) {
        assert_eq!(sidecar::get_size(&laz_path).unwrap(), las.len() as i64);
    }
}

#[test]
fn readdir_rewrites_archive_names() {
    let fix = common::fixture();
    common::write_laz(fix.root.path(), "a.laz", &[1, 2, 3, 4], 1);
    std::fs::write(fix.root.path().join("b.txt"), b"plain").unwrap();
    let fs = fix.lazfs();

    let mut names: Vec<String> = fs
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.las", "b.txt"]);
}

#[test]
fn real_las_is_served_verbatim() {
    let fix = common::fixture();
    common::write_laz(fix.root.path(), "a.laz", &[0xEE; 8], 1);
    std::fs::write(fix.root.path().join("a.las"), b"the real thing").unwrap();
    let fs = fix.lazfs();

    let handle = fs.open("/a.las", libc::O_RDONLY).unwrap();
    assert!(!handle.synthetic);
    assert_eq!(
        fs.read("/a.las", &handle, 0, 64).unwrap(),
        b"the real thing"
    );
    fs.release("/a.las", &handle).unwrap();
    assert_eq!(fs.cache_stats().inserts, 0, "no decompression happened");
}

#[test]
fn create_write_release_builds_an_archive() {
    let fix = common::fixture();
    let fs = fix.lazfs();

    let payload = common::las_bytes(&(0..80u8).collect::<Vec<_>>(), 4);
    let handle = fs.create("/fresh.las", 0o644, common::caller()).unwrap();
    assert!(handle.synthetic);
    fs.write("/fresh.las", &handle, 0, &payload).unwrap();
    fs.release("/fresh.las", &handle).unwrap();

    let laz_path = fix.root.path().join("fresh.laz");
    assert!(laz_path.exists());
    let restored = tempfile::tempfile().unwrap();
    lazfs_codec::decompress(&File::open(&laz_path).unwrap(), &restored).unwrap();
    use std::os::unix::fs::FileExt;
    let mut seen = vec![0u8; payload.len()];
    restored.read_exact_at(&mut seen, 0).unwrap();
    assert_eq!(seen, payload);

    assert!(fix.scratch_files().is_empty());
    assert_eq!(fs.cache_stats().entries, 0);
}

#[test]
fn corrupt_archive_fails_open_and_leaves_nothing_behind() {
    let fix = common::fixture();
    std::fs::write(fix.root.path().join("junk.laz"), b"not a point cloud").unwrap();
    let fs = fix.lazfs();

    let err = fs.open("/junk.las", libc::O_RDONLY).unwrap_err();
    assert_eq!(err, Errno::ENOMEM);
    assert_eq!(fs.cache_stats().entries, 0);
    assert!(fix.scratch_files().is_empty());
}

#[test]
fn inconsistent_scratch_surfaces_the_codec_error_at_release() {
    let fix = common::fixture();
    let fs = fix.lazfs();

    let payload = common::las_bytes(&[7u8; 100], 1);
    let handle = fs.create("/cut.las", 0o644, common::caller()).unwrap();
    fs.write("/cut.las", &handle, 0, &payload).unwrap();
    // Drop half the records; the header now disagrees with the body.
    fs.ftruncate("/cut.las", &handle, (lazfs_codec::HEADER_LEN + 50) as u64)
        .unwrap();

    let err = fs.release("/cut.las", &handle).unwrap_err();
    assert_eq!(err, Errno::ENOMEM);
    // The entry is still torn down and the scratch space reclaimed.
    assert_eq!(fs.cache_stats().entries, 0);
    assert!(fix.scratch_files().is_empty());
}

#[test]
fn unlink_and_access_route_to_the_archive() {
    let fix = common::fixture();
    common::write_laz(fix.root.path(), "gone.laz", &[1u8; 4], 1);
    let fs = fix.lazfs();

    fs.access("/gone.las", libc::F_OK).unwrap();
    fs.unlink("/gone.las").unwrap();
    assert!(!fix.root.path().join("gone.laz").exists());
    assert_eq!(fs.access("/gone.las", libc::F_OK).unwrap_err(), Errno::ENOENT);
}

#[test]
fn plain_files_pass_through_untouched() {
    let fix = common::fixture();
    std::fs::write(fix.root.path().join("notes.txt"), b"hello").unwrap();
    let fs = fix.lazfs();

    let st = fs.getattr("/notes.txt").unwrap();
    assert_eq!(st.size, 5);

    let handle = fs.open("/notes.txt", libc::O_RDWR).unwrap();
    fs.write("/notes.txt", &handle, 5, b" world").unwrap();
    fs.release("/notes.txt", &handle).unwrap();
    assert_eq!(
        std::fs::read(fix.root.path().join("notes.txt")).unwrap(),
        b"hello world"
    );
    assert_eq!(fs.cache_stats().inserts, 0);
}
