use crate::{archive_tree, assert_tree, collect_files, create_tree, extract_archive, Node};
use fastzip::{
    Archiver, ArchiverOptions, CancelToken, DeflateCodec, Error, ZipReader, METHOD_DEFLATE,
    METHOD_STORE, METHOD_ZSTD,
};
use quickcheck_macros::quickcheck;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

#[cfg(unix)]
const TREE: &[(&str, Node)] = &[
    ("foo", Node::Dir(0o755)),
    ("foo/foo.go", Node::File(0o644, b"package foo\n")),
    ("bar", Node::Dir(0o755)),
    ("bar/bar.go", Node::File(0o600, b"package bar\n")),
    ("bar/foo", Node::Dir(0o755)),
    ("bar/foo/bar", Node::Dir(0o755)),
    ("bar/foo/bar/foo", Node::Dir(0o755)),
    ("bar/foo/bar/foo/bar", Node::File(0o644, b"deep\n")),
    ("bar/symlink", Node::Link("foo/bar")),
    ("bar/symlink.go", Node::Link("../foo/foo.go")),
];

#[cfg(unix)]
#[test]
fn test_archive_roundtrip() {
    let src = tempfile::tempdir().unwrap();
    create_tree(src.path(), TREE);

    let archive = archive_tree(src.path(), ArchiverOptions::default());

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    assert_tree(dst.path(), TREE);
}

#[cfg(unix)]
#[test]
fn test_archive_roundtrip_stored() {
    let src = tempfile::tempdir().unwrap();
    create_tree(src.path(), TREE);

    let archive = archive_tree(src.path(), ArchiverOptions::default().method(METHOD_STORE));

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    assert_tree(dst.path(), TREE);
}

#[cfg(unix)]
#[test]
fn test_archive_roundtrip_zstd() {
    let src = tempfile::tempdir().unwrap();
    create_tree(src.path(), TREE);

    let archive = archive_tree(src.path(), ArchiverOptions::default().method(METHOD_ZSTD));

    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    assert!(reader
        .entries()
        .iter()
        .filter(|e| !e.is_dir() && !e.mode().is_symlink())
        .all(|e| e.method() == METHOD_ZSTD || e.method() == METHOD_STORE));

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    assert_tree(dst.path(), TREE);
}

#[test]
fn test_archive_with_custom_compressor() {
    let src = tempfile::tempdir().unwrap();
    create_tree(
        src.path(),
        &[
            ("a.txt", Node::File(0o644, b"aaaaaaaaaaaaaaaaaaaaaaaaaaaa")),
            ("b.txt", Node::File(0o644, b"bbbbbbbbbbbbbbbbbbbbbbbbbbbb")),
        ],
    );

    let files = collect_files(src.path());
    let archiver = Archiver::new(Vec::new(), src.path()).unwrap();
    archiver.register_compressor(METHOD_DEFLATE, Arc::new(DeflateCodec::new(1)));
    archiver.archive(&CancelToken::new(), &files).unwrap();
    let archive = archiver.finish().unwrap();

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    assert_eq!(
        fs::read(dst.path().join("a.txt")).unwrap(),
        b"aaaaaaaaaaaaaaaaaaaaaaaaaaaa"
    );
}

#[test]
fn test_archive_chroot_violations() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("chroot")).unwrap();

    let cases: &[(&[&str], bool)] = &[
        (&["chroot/good"], true),
        (&["chroot/good", "bad"], false),
        (&["bad"], false),
        (&["chroot/../bad"], false),
        (&["chroot/../chroot/good"], true),
    ];

    for (paths, good) in cases {
        let mut files = HashMap::new();
        for name in *paths {
            let path = dir.path().join(name);
            fs::write(&path, b"contents").unwrap();
            files.insert(path.clone(), fs::symlink_metadata(&path).unwrap());
        }

        let archiver = Archiver::new(Vec::new(), dir.path().join("chroot")).unwrap();
        let result = archiver.archive(&CancelToken::new(), &files);
        if *good {
            assert!(result.is_ok(), "expected success for {paths:?}");
        } else {
            assert!(
                matches!(result, Err(Error::OutsideChroot { .. })),
                "expected chroot error for {paths:?}"
            );
        }
    }
}

#[test]
fn test_written_counts_exclude_simple_path() {
    let src = tempfile::tempdir().unwrap();
    create_tree(
        src.path(),
        &[
            ("a", Node::Dir(0o755)),
            ("a/b.txt", Node::File(0o644, b"hello")),
        ],
    );

    let files = collect_files(src.path());
    let archiver = Archiver::with_options(
        Vec::new(),
        src.path(),
        ArchiverOptions::default().concurrency(4),
    )
    .unwrap();
    archiver.archive(&CancelToken::new(), &files).unwrap();

    // A five byte file inflates under deflate, so it is re-written through
    // the store path, which bypasses the byte counter. The directory entry
    // carries no payload. Both still count as entries.
    assert_eq!(archiver.written(), (0, 2));

    let archive = archiver.finish().unwrap();
    assert!(!archive.is_empty());

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    assert_eq!(fs::read(dst.path().join("a/b.txt")).unwrap(), b"hello");
}

#[test]
fn test_compressible_files_shrink() {
    let src = tempfile::tempdir().unwrap();
    let contents = vec![b'1'; 2 * 1024 * 1024];
    for name in ["1.txt", "2.txt", "3.txt"] {
        fs::write(src.path().join(name), &contents).unwrap();
        crate::set_mode(&src.path().join(name), 0o644);
    }

    let archive = archive_tree(
        src.path(),
        ArchiverOptions::default()
            .concurrency(1)
            .method(METHOD_DEFLATE),
    );

    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    assert_eq!(reader.entries().len(), 3);
    for entry in reader.entries() {
        assert!(entry.compressed_size() < entry.uncompressed_size());
        assert_eq!(entry.uncompressed_size(), contents.len() as u64);
    }

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    for name in ["1.txt", "2.txt", "3.txt"] {
        assert_eq!(fs::read(dst.path().join(name)).unwrap(), contents);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::symlink_metadata(dst.path().join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }
}

#[test]
fn test_incompressible_file_reverts_to_store() {
    let src = tempfile::tempdir().unwrap();
    let contents = b"A3#bez&OqCusPr)d&D]Vot9Eo0z^5O*VZm3:sO3HptL.H-4cOv";
    fs::write(src.path().join("incompressible.txt"), contents).unwrap();

    let archive = archive_tree(
        src.path(),
        ArchiverOptions::default()
            .concurrency(2)
            .method(METHOD_DEFLATE),
    );

    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    let entry = &reader.entries()[0];
    assert_eq!(entry.method(), METHOD_STORE);
    assert_eq!(entry.compressed_size(), entry.uncompressed_size());
    assert_eq!(entry.uncompressed_size(), contents.len() as u64);
}

#[test]
fn test_stored_crc_matches_contents() {
    let src = tempfile::tempdir().unwrap();
    let contents = b"crc me".repeat(10_000);
    fs::write(src.path().join("data.bin"), &contents).unwrap();

    let archive = archive_tree(src.path(), ArchiverOptions::default());

    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    assert_eq!(reader.entries()[0].crc32(), crc32fast::hash(&contents));
}

#[quickcheck]
fn prop_entry_order_matches_sorted_input(names: Vec<String>) {
    // Sanitize arbitrary strings into unique flat file names.
    let mut unique: Vec<String> = Vec::new();
    for name in names {
        let cleaned: String = name
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .take(8)
            .collect();
        if !cleaned.is_empty() && !unique.contains(&cleaned) {
            unique.push(cleaned);
        }
        if unique.len() >= 16 {
            break;
        }
    }
    if unique.is_empty() {
        return;
    }

    let src = tempfile::tempdir().unwrap();
    for name in &unique {
        fs::write(src.path().join(name), name.as_bytes()).unwrap();
    }

    let archive = archive_tree(src.path(), ArchiverOptions::default().concurrency(4));

    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    let archived: Vec<&str> = reader.entries().iter().map(|e| e.name()).collect();

    unique.sort();
    assert_eq!(archived, unique);
}

#[test]
fn test_spill_files_removed_after_archive() {
    let src = tempfile::tempdir().unwrap();
    let stage = tempfile::tempdir().unwrap();
    fs::write(src.path().join("big.bin"), vec![b'z'; 256 * 1024]).unwrap();
    fs::write(src.path().join("small.bin"), b"tiny").unwrap();

    // A zero buffer size forces every staged byte through a spill file.
    let archive = archive_tree(
        src.path(),
        ArchiverOptions::default()
            .concurrency(2)
            .buffer_size(0)
            .stage_dir(stage.path()),
    );
    assert!(!archive.is_empty());

    let leftovers: Vec<_> = fs::read_dir(stage.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "stage dir not cleaned: {leftovers:?}");
}

#[test]
fn test_archive_cancelled_before_start() {
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("file.txt"), b"contents").unwrap();
    let files = collect_files(src.path());

    let archiver = Archiver::new(Vec::new(), src.path()).unwrap();
    let ctx = CancelToken::new();
    ctx.cancel();

    assert!(matches!(
        archiver.archive(&ctx, &files),
        Err(Error::Cancelled)
    ));
}

#[test]
fn test_concurrency_must_be_positive() {
    assert!(matches!(
        Archiver::with_options(
            Vec::new(),
            tempfile::tempdir().unwrap().path(),
            ArchiverOptions::default().concurrency(0),
        ),
        Err(Error::MinConcurrency)
    ));
}

#[test]
fn test_archive_at_offset() {
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("file.txt"), b"after the preamble").unwrap();
    let files = collect_files(src.path());

    let preamble = b"#!/bin/sh\nexit 0\n".to_vec();
    let archiver = Archiver::with_options(
        preamble.clone(),
        src.path(),
        ArchiverOptions::default().offset(preamble.len() as u64),
    )
    .unwrap();
    archiver.archive(&CancelToken::new(), &files).unwrap();
    let archive = archiver.finish().unwrap();

    assert!(archive.starts_with(&preamble));

    let dst = tempfile::tempdir().unwrap();
    extract_archive(&archive, dst.path());
    assert_eq!(
        fs::read(dst.path().join("file.txt")).unwrap(),
        b"after the preamble"
    );
}

#[cfg(unix)]
#[test]
fn test_irregular_files_skipped() {
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("regular.txt"), b"kept").unwrap();

    // A unix socket is an irregular mode and must be silently skipped.
    let socket_path = src.path().join("socket");
    let _listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let archive = archive_tree(src.path(), ArchiverOptions::default());
    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    let names: Vec<&str> = reader.entries().iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["regular.txt"]);
}
