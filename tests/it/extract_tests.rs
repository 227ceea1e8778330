use fastzip::{
    CancelToken, EntryHeader, EntryMode, Error, Extractor, ExtractorOptions, UtcDateTime,
    ZipReader, ZipWriter, METHOD_DEFLATE, METHOD_STORE,
};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, SystemTime};

// 2019-03-15T14:30:00Z
const MTIME_UNIX: u64 = 1552660200;

fn mtime() -> Option<UtcDateTime> {
    UtcDateTime::from_components(2019, 3, 15, 14, 30, 0)
}

fn file_header(name: &str) -> EntryHeader<'_> {
    EntryHeader {
        name,
        method: METHOD_DEFLATE,
        modified: mtime(),
        mode: EntryMode::from_unix(0o100644),
        unix_ids: None,
    }
}

fn dir_header(name: &str) -> EntryHeader<'_> {
    EntryHeader {
        name,
        method: METHOD_STORE,
        modified: mtime(),
        mode: EntryMode::from_unix(0o040755),
        unix_ids: None,
    }
}

fn symlink_header(name: &str) -> EntryHeader<'_> {
    EntryHeader {
        name,
        method: METHOD_STORE,
        modified: mtime(),
        mode: EntryMode::from_unix(0o120777),
        unix_ids: None,
    }
}

fn extract(archive: &[u8], chroot: &Path) -> Result<(u64, u64), Error> {
    let extractor =
        Extractor::from_reader(Cursor::new(archive.to_vec()), archive.len() as u64, chroot)?;
    extractor.extract(&CancelToken::new())?;
    Ok(extractor.written())
}

#[cfg(unix)]
#[test]
fn test_symlink_traversal_rejected() {
    let mut writer = ZipWriter::new(Vec::new());
    writer
        .create(
            &symlink_header("root/inner"),
            &mut Cursor::new(b"../".to_vec()),
        )
        .unwrap();
    writer
        .create(
            &file_header("root/inner/vuln"),
            &mut Cursor::new(b"boom".to_vec()),
        )
        .unwrap();
    let archive = writer.finish().unwrap();

    let parent = tempfile::tempdir().unwrap();
    let chroot = parent.path().join("chroot");
    fs::create_dir(&chroot).unwrap();

    let result = extract(&archive, &chroot);
    assert!(result.is_err(), "traversal archive must fail to extract");

    // Nothing may exist outside the chroot, and the symlink must not have
    // replaced the real directory that phase 1 created.
    assert!(!parent.path().join("vuln").exists());
    assert!(!parent.path().join("root").exists());
    let inner = fs::symlink_metadata(chroot.join("root/inner")).unwrap();
    assert!(!inner.is_symlink());
}

#[cfg(unix)]
#[test]
fn test_entry_name_escaping_chroot_is_contained() {
    let mut writer = ZipWriter::new(Vec::new());
    writer
        .create(
            &file_header("aa/bb/escape.txt"),
            &mut Cursor::new(b"contained".to_vec()),
        )
        .unwrap();
    let mut archive = writer.finish().unwrap();

    // Rewrite the stored name into a traversal attempt, in both the local
    // header and the central directory. Same length, so offsets survive.
    let clean = b"aa/bb/escape.txt";
    let hostile = b"../../escape.txt";
    let positions: Vec<usize> = archive
        .windows(clean.len())
        .enumerate()
        .filter(|(_, w)| *w == &clean[..])
        .map(|(i, _)| i)
        .collect();
    assert_eq!(positions.len(), 2);
    for pos in positions {
        archive[pos..pos + hostile.len()].copy_from_slice(hostile);
    }

    let parent = tempfile::tempdir().unwrap();
    let chroot = parent.path().join("chroot");
    fs::create_dir(&chroot).unwrap();

    // Name normalisation strips the traversal components, so the entry
    // lands inside the chroot rather than outside it.
    extract(&archive, &chroot).unwrap();
    assert!(!parent.path().join("escape.txt").exists());
    assert_eq!(fs::read(chroot.join("escape.txt")).unwrap(), b"contained");
}

#[cfg(unix)]
#[test]
fn test_directory_mtimes_survive_symlink_creation() {
    let mut writer = ZipWriter::new(Vec::new());
    writer.create_directory(&dir_header("parent_dir/")).unwrap();
    writer.create_directory(&dir_header("another_dir/")).unwrap();
    writer
        .create(
            &file_header("another_dir/file.txt"),
            &mut Cursor::new(b"data".to_vec()),
        )
        .unwrap();
    writer
        .create(
            &symlink_header("parent_dir/symlink"),
            &mut Cursor::new(b"../target_file".to_vec()),
        )
        .unwrap();
    let archive = writer.finish().unwrap();

    let chroot = tempfile::tempdir().unwrap();
    extract(&archive, chroot.path()).unwrap();

    // Phase 2 created a symlink inside parent_dir, which bumped its mtime;
    // phase 3 must have restored it from the archive.
    let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(MTIME_UNIX);
    for dir in ["parent_dir", "another_dir"] {
        let metadata = fs::symlink_metadata(chroot.path().join(dir)).unwrap();
        assert_eq!(metadata.modified().unwrap(), expected, "{dir} mtime");
    }

    let link = chroot.path().join("parent_dir/symlink");
    assert_eq!(
        fs::read_link(&link).unwrap(),
        std::path::PathBuf::from("../target_file")
    );
}

#[cfg(unix)]
#[test]
fn test_file_metadata_restored() {
    let mut writer = ZipWriter::new(Vec::new());
    let mut header = file_header("restored.txt");
    header.mode = EntryMode::from_unix(0o100640);
    writer
        .create(&header, &mut Cursor::new(b"metadata".to_vec()))
        .unwrap();
    let archive = writer.finish().unwrap();

    let chroot = tempfile::tempdir().unwrap();
    extract(&archive, chroot.path()).unwrap();

    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::symlink_metadata(chroot.path().join("restored.txt")).unwrap();
    assert_eq!(metadata.permissions().mode() & 0o777, 0o640);
    assert_eq!(
        metadata.modified().unwrap(),
        SystemTime::UNIX_EPOCH + Duration::from_secs(MTIME_UNIX)
    );
}

#[test]
fn test_written_counters() {
    let mut writer = ZipWriter::new(Vec::new());
    writer.create_directory(&dir_header("dir/")).unwrap();
    writer
        .create(
            &file_header("dir/a.txt"),
            &mut Cursor::new(vec![b'a'; 1000]),
        )
        .unwrap();
    writer
        .create(&file_header("dir/b.txt"), &mut Cursor::new(vec![b'b'; 500]))
        .unwrap();
    let archive = writer.finish().unwrap();

    let chroot = tempfile::tempdir().unwrap();
    let (bytes, entries) = extract(&archive, chroot.path()).unwrap();
    assert_eq!(bytes, 1500);
    assert_eq!(entries, 3);
}

#[test]
fn test_extractor_concurrency_option() {
    let mut writer = ZipWriter::new(Vec::new());
    writer
        .create(&file_header("a.txt"), &mut Cursor::new(b"a".to_vec()))
        .unwrap();
    let archive = writer.finish().unwrap();

    for (concurrency, ok) in [(0, false), (1, true), (30, true)] {
        let chroot = tempfile::tempdir().unwrap();
        let result = Extractor::from_reader_with_options(
            Cursor::new(archive.clone()),
            archive.len() as u64,
            chroot.path(),
            ExtractorOptions::default().concurrency(concurrency),
        );
        if ok {
            result.unwrap().extract(&CancelToken::new()).unwrap();
        } else {
            assert!(matches!(result, Err(Error::MinConcurrency)));
        }
    }
}

#[test]
fn test_corrupt_unix_extra_field_aborts() {
    let mut writer = ZipWriter::new(Vec::new());
    let mut header = file_header("victim.txt");
    header.unix_ids = Some((1000, 1000));
    writer
        .create(&header, &mut Cursor::new(b"x".to_vec()))
        .unwrap();
    let mut archive = writer.finish().unwrap();

    // Corrupt the Info-ZIP New Unix field version byte in the central
    // directory copy of the extra fields.
    let field_id = [0x75u8, 0x78, 0x0b, 0x00];
    let positions: Vec<usize> = archive
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == field_id)
        .map(|(i, _)| i)
        .collect();
    assert!(!positions.is_empty());
    for pos in positions {
        archive[pos + 4] = 9; // bogus version
    }

    let chroot = tempfile::tempdir().unwrap();
    let err = extract(&archive, chroot.path()).unwrap_err();
    assert!(matches!(err, Error::InvalidExtraField(_)), "got {err:?}");
}

#[test]
fn test_utf8_names_roundtrip() {
    let mut writer = ZipWriter::new(Vec::new());
    writer
        .create(
            &file_header("日本語/ファイル.txt"),
            &mut Cursor::new(b"unicode".to_vec()),
        )
        .unwrap();
    let archive = writer.finish().unwrap();

    let reader = ZipReader::new(archive.as_slice(), archive.len() as u64).unwrap();
    assert_eq!(reader.entries()[0].name(), "日本語/ファイル.txt");

    let chroot = tempfile::tempdir().unwrap();
    extract(&archive, chroot.path()).unwrap();
    assert_eq!(
        fs::read(chroot.path().join("日本語/ファイル.txt")).unwrap(),
        b"unicode"
    );
}

#[test]
fn test_cancellation_stops_extraction() {
    // Enough payload that cancellation lands mid-extraction once the first
    // counted byte is observed.
    let payload = vec![b'c'; 1024 * 1024];
    let mut writer = ZipWriter::new(Vec::new());
    for i in 0..48 {
        let name = format!("file_{i:02}.bin");
        writer
            .create(&file_header(&name), &mut Cursor::new(payload.clone()))
            .unwrap();
    }
    let archive = writer.finish().unwrap();
    let size = archive.len() as u64;

    let chroot = tempfile::tempdir().unwrap();
    let extractor = Extractor::from_reader_with_options(
        Cursor::new(archive),
        size,
        chroot.path(),
        ExtractorOptions::default().concurrency(1),
    )
    .unwrap();

    let ctx = CancelToken::new();
    let result = std::thread::scope(|scope| {
        scope.spawn(|| {
            // Cancel as soon as the first payload byte lands on disk.
            while extractor.written().0 == 0 && !ctx.is_cancelled() {
                std::thread::yield_now();
            }
            ctx.cancel();
        });
        let result = extractor.extract(&ctx);
        // Unblock the watcher if extraction ended some other way.
        ctx.cancel();
        result
    });

    assert!(matches!(result, Err(Error::Cancelled)), "got {result:?}");
    assert!(extractor.written().0 < 48 * 1024 * 1024);
}

#[cfg(unix)]
#[test]
fn test_chown_error_handler_behaviour() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let mut writer = ZipWriter::new(Vec::new());
    let mut header = file_header("owned.txt");
    header.unix_ids = Some((0, 0));
    writer
        .create(&header, &mut Cursor::new(b"root owned".to_vec()))
        .unwrap();
    let archive = writer.finish().unwrap();

    let invoked = Arc::new(AtomicBool::new(false));
    let observed = invoked.clone();

    let chroot = tempfile::tempdir().unwrap();
    let extractor = Extractor::from_reader_with_options(
        Cursor::new(archive.clone()),
        archive.len() as u64,
        chroot.path(),
        ExtractorOptions::default().chown_error_handler(Box::new(move |name, _err| {
            assert_eq!(name, "owned.txt");
            observed.store(true, Ordering::SeqCst);
            Ok(())
        })),
    )
    .unwrap();
    extractor.extract(&CancelToken::new()).unwrap();

    let running_as_root = unsafe { libc::geteuid() } == 0;
    assert_eq!(invoked.load(Ordering::SeqCst), !running_as_root);
}
