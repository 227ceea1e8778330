use fastzip::{Archiver, ArchiverOptions, CancelToken, Extractor, MutexReader};
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::io::Cursor;
use std::path::{Path, PathBuf};

mod archive_tests;
mod extract_tests;

/// A filesystem tree specification. Entries are created in order, so
/// parents must precede children.
#[derive(Debug, Clone, Copy)]
pub enum Node {
    Dir(u32),
    File(u32, &'static [u8]),
    #[cfg_attr(not(unix), allow(dead_code))]
    Link(&'static str),
}

pub fn create_tree(root: &Path, nodes: &[(&str, Node)]) {
    for (name, node) in nodes {
        let path = root.join(name);
        match node {
            Node::Dir(mode) => {
                fs::create_dir(&path).unwrap();
                set_mode(&path, *mode);
            }
            Node::File(mode, contents) => {
                fs::write(&path, contents).unwrap();
                set_mode(&path, *mode);
            }
            Node::Link(target) => {
                #[cfg(unix)]
                std::os::unix::fs::symlink(target, &path).unwrap();
                #[cfg(not(unix))]
                panic!("symlink nodes are not supported on this platform: {target}");
            }
        }
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) {}

/// Walks a directory tree the way a caller of `archive` would, collecting
/// every path (including the root itself) with its symlink metadata.
pub fn collect_files(root: &Path) -> HashMap<PathBuf, Metadata> {
    let mut files = HashMap::new();
    files.insert(root.to_path_buf(), fs::symlink_metadata(root).unwrap());

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let metadata = fs::symlink_metadata(&path).unwrap();
            if metadata.is_dir() {
                stack.push(path.clone());
            }
            files.insert(path, metadata);
        }
    }

    files
}

pub fn archive_tree(chroot: &Path, options: ArchiverOptions) -> Vec<u8> {
    let files = collect_files(chroot);
    let archiver = Archiver::with_options(Vec::new(), chroot, options).unwrap();
    archiver.archive(&CancelToken::new(), &files).unwrap();
    archiver.finish().unwrap()
}

pub fn extract_archive(archive: &[u8], chroot: &Path) -> Extractor<MutexReader<Cursor<Vec<u8>>>> {
    let extractor = Extractor::from_reader(
        Cursor::new(archive.to_vec()),
        archive.len() as u64,
        chroot,
    )
    .unwrap();
    extractor.extract(&CancelToken::new()).unwrap();
    extractor
}

/// Asserts that the extracted tree matches the specification: names,
/// permission bits, contents and symlink targets.
pub fn assert_tree(root: &Path, nodes: &[(&str, Node)]) {
    for (name, node) in nodes {
        let path = root.join(name);
        let metadata = fs::symlink_metadata(&path)
            .unwrap_or_else(|_| panic!("{} missing from extraction", path.display()));

        match node {
            Node::Dir(mode) => {
                assert!(metadata.is_dir(), "{name} should be a directory");
                assert_mode(&path, &metadata, *mode);
            }
            Node::File(mode, contents) => {
                assert!(metadata.is_file(), "{name} should be a file");
                assert_eq!(&fs::read(&path).unwrap(), contents, "{name} contents");
                assert_mode(&path, &metadata, *mode);
            }
            Node::Link(target) => {
                assert!(metadata.is_symlink(), "{name} should be a symlink");
                assert_eq!(
                    fs::read_link(&path).unwrap(),
                    PathBuf::from(target),
                    "{name} target"
                );
            }
        }
    }
}

#[cfg(unix)]
fn assert_mode(path: &Path, metadata: &Metadata, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(
        metadata.permissions().mode() & 0o777,
        mode & 0o777,
        "{} permissions",
        path.display()
    );
}

#[cfg(not(unix))]
fn assert_mode(_path: &Path, _metadata: &Metadata, _mode: u32) {}
