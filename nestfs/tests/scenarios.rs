//! End-to-end scenarios exercising the whole stack through the public API,
//! mirroring the spec's testable-property scenarios (§8): format, a
//! populated tree surviving reopen, deferred delete, stale iterators, name
//! length limits, and FNV-1a collisions inside one directory.

use nestfs::{Config, Error, FileStorage, FileType, Filesystem, MemStorage, OpenMode};

#[test]
fn s1_format_on_empty_storage_yields_just_a_root() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    assert_eq!(fs.file_type("/").unwrap(), FileType::Directory);
    assert_eq!(fs.list_directory("/").unwrap().len(), 0);
    fs.check().unwrap();
}

#[test]
fn s2_create_populate_and_reopen_preserves_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("image.nestfs");

    {
        let storage = FileStorage::open(&image_path).unwrap();
        let mut fs = Filesystem::format(storage).unwrap();
        fs.create_directories("/docs/notes").unwrap();
        fs.create_file("/docs/readme.txt").unwrap();
        let h = fs.open_file("/docs/readme.txt", OpenMode::ReadWrite).unwrap();
        fs.write_file(&h, 0, b"nestfs scenario test").unwrap();
        fs.close_file(h).unwrap();
    }

    let storage = FileStorage::open(&image_path).unwrap();
    let mut fs = Filesystem::open(storage).unwrap();
    fs.check().unwrap();
    assert_eq!(fs.file_type("/docs").unwrap(), FileType::Directory);
    assert_eq!(fs.file_type("/docs/notes").unwrap(), FileType::Directory);
    assert_eq!(fs.file_type("/docs/readme.txt").unwrap(), FileType::Regular);

    let h = fs.open_file("/docs/readme.txt", OpenMode::Read).unwrap();
    let mut buf = vec![0u8; "nestfs scenario test".len()];
    fs.read_file(&h, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"nestfs scenario test");
    fs.close_file(h).unwrap();
}

#[test]
fn s3_a_file_deleted_while_open_disappears_only_after_the_last_close() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_file("/scratch").unwrap();
    let h1 = fs.open_file("/scratch", OpenMode::Read).unwrap();
    let h2 = fs.open_file("/scratch", OpenMode::Read).unwrap();

    fs.remove_file("/scratch").unwrap();
    assert!(fs.exists("/scratch").unwrap(), "name stays reachable while open");

    fs.close_file(h1).unwrap();
    assert!(fs.exists("/scratch").unwrap(), "still open via the second handle");

    fs.close_file(h2).unwrap();
    assert!(!fs.exists("/scratch").unwrap(), "freed once every handle is closed");
    fs.check().unwrap();
}

#[test]
fn s4_a_writer_excludes_other_writers_but_not_readers() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_file("/f").unwrap();
    let w = fs.open_file("/f", OpenMode::ReadWrite).unwrap();
    assert!(matches!(
        fs.open_file("/f", OpenMode::ReadWrite).unwrap_err(),
        Error::FileLocked
    ));
    assert!(matches!(fs.open_file("/f", OpenMode::Read).unwrap_err(), Error::FileLocked));
    fs.close_file(w).unwrap();
    let r = fs.open_file("/f", OpenMode::Read).unwrap();
    fs.close_file(r).unwrap();
}

#[test]
fn s5_a_stale_directory_iterator_is_rejected() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_directory("/d").unwrap();
    let mut it = fs.iter_directory("/d").unwrap();
    assert!(fs.iterator_next(&mut it).unwrap().is_none());

    fs.create_file("/d/new").unwrap();
    assert!(matches!(
        fs.iterator_next(&mut it).unwrap_err(),
        Error::IncorrectIteratorAccess
    ));

    let mut fresh = fs.iter_directory("/d").unwrap();
    let entry = fs.iterator_next(&mut fresh).unwrap().unwrap();
    assert_eq!(entry.name, b"new");
    assert!(fs.iterator_next(&mut fresh).unwrap().is_none());
}

#[test]
fn s6_fnv1a_collisions_coexist_in_the_same_directory() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_file("/costarring").unwrap();
    fs.create_file("/liquid").unwrap();
    fs.create_file("/declinate").unwrap();
    fs.create_file("/macallums").unwrap();
    fs.create_file("/altarage").unwrap();
    fs.create_file("/zinke").unwrap();

    for name in ["costarring", "liquid", "declinate", "macallums", "altarage", "zinke"] {
        assert_eq!(fs.file_type(&format!("/{name}")).unwrap(), FileType::Regular);
    }
    assert_eq!(fs.list_directory("/").unwrap().len(), 6);
    fs.check().unwrap();
}

#[test]
fn filenames_over_the_limit_are_rejected() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    let long_name = "a".repeat(951);
    let err = fs.create_file(&format!("/{long_name}")).unwrap_err();
    assert!(matches!(err, Error::FileNameExceedsLimit(950)));
}

#[test]
fn removing_a_directory_recursively_deletes_its_contents() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_directories("/d/sub").unwrap();
    fs.create_file("/d/f").unwrap();
    fs.create_file("/d/sub/g").unwrap();

    fs.remove_directory("/d").unwrap();

    assert!(!fs.exists("/d").unwrap());
    assert_eq!(fs.file_type("/d").unwrap(), FileType::NotFound);
    fs.check().unwrap();
}

#[test]
fn a_file_open_during_a_recursive_removal_is_orphaned_until_closed() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_directory("/d").unwrap();
    fs.create_file("/d/f").unwrap();
    let h = fs.open_file("/d/f", OpenMode::Read).unwrap();

    fs.remove_directory("/d").unwrap();
    assert!(!fs.exists("/d").unwrap());

    fs.close_file(h).unwrap();
    fs.check().unwrap();
}

#[test]
fn config_rejects_a_mismatched_block_size() {
    let cfg = Config {
        block_size: Some(512),
        ..Config::default()
    };
    let err = Filesystem::format_with_config(MemStorage::new(), cfg).unwrap_err();
    assert!(matches!(err, Error::InvalidStorageFormat(_)));
}

#[test]
fn strict_format_validation_walks_the_allocator_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("strict.nestfs");

    {
        let storage = FileStorage::open(&image_path).unwrap();
        let mut fs = Filesystem::format(storage).unwrap();
        fs.create_directories("/a/b/c").unwrap();
        fs.create_file("/a/b/c/f").unwrap();
    }

    let storage = FileStorage::open(&image_path).unwrap();
    let cfg = Config {
        strict_format_validation: true,
        ..Config::default()
    };
    let mut reopened = Filesystem::open_with_config(storage, cfg).unwrap();
    assert_eq!(reopened.file_type("/a/b/c/f").unwrap(), FileType::Regular);
}

#[test]
fn large_file_write_and_truncate_round_trip() {
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    fs.create_file("/big").unwrap();
    let h = fs.open_file("/big", OpenMode::ReadWrite).unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs.write_file(&h, 0, &payload).unwrap();

    let mut readback = vec![0u8; payload.len()];
    fs.read_file(&h, 0, &mut readback).unwrap();
    assert_eq!(readback, payload);

    fs.truncate_file(&h, 4096).unwrap();
    assert_eq!(fs.file_size(&h).unwrap(), 4096);
    let mut small = vec![0u8; 4096];
    fs.read_file(&h, 0, &mut small).unwrap();
    assert_eq!(small, payload[..4096]);

    fs.close_file(h).unwrap();
    fs.check().unwrap();
}
