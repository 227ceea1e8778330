//! Parallel, three-phase extraction.
//!
//! Phase 1 creates directories and regular files, files in parallel under a
//! concurrency bound. Symlink creation is deferred to phase 2: once every
//! directory already exists, no later entry's path can resolve through a
//! freshly created link, which defeats symlink traversal attacks. Phase 3
//! restores directory metadata last, because creating files and symlinks
//! inside a directory updates its modification time.

use crate::archiver::absolute;
use crate::cancel::CancelToken;
use crate::countio::{Counters, CountingWriter};
use crate::errors::{Error, Result};
use crate::extra;
use crate::platform;
use crate::reader::{ZipEntry, ZipReader};
use crate::reader_at::{FileReader, MutexReader, ReaderAt};
use crate::register::{CodecRegistry, Decompressor};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Callback invoked when restoring ownership fails. Returning `Ok(())`
/// continues extraction; returning an error aborts it.
pub type ChownErrorHandler = Box<dyn Fn(&str, io::Error) -> io::Result<()> + Send + Sync>;

/// Options for creating an [`Extractor`].
#[derive(Default)]
pub struct ExtractorOptions {
    concurrency: Option<usize>,
    chown_error_handler: Option<ChownErrorHandler>,
}

impl ExtractorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of files extracted concurrently. Defaults to the
    /// available hardware parallelism. Zero is rejected at construction.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Handler consulted when ownership restoration fails. Without one,
    /// chown failures are silently ignored.
    pub fn chown_error_handler(mut self, handler: ChownErrorHandler) -> Self {
        self.chown_error_handler = Some(handler);
        self
    }
}

/// An opinionated, parallel zip extractor.
///
/// Only regular files, symlinks and directories are extracted; other modes
/// are silently skipped. Entries may only resolve inside the chroot
/// directory. Access permissions, unix ownership and modification times are
/// restored.
pub struct Extractor<R> {
    zip: ZipReader<R>,
    chroot: PathBuf,
    concurrency: usize,
    chown_error_handler: Option<Mutex<ChownErrorHandler>>,
    registry: Arc<CodecRegistry>,
    counters: Counters,
}

impl Extractor<FileReader> {
    /// Opens an archive file and returns a new extractor targeting
    /// `chroot`.
    pub fn from_file(archive: impl AsRef<Path>, chroot: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_with_options(archive, chroot, ExtractorOptions::default())
    }

    /// Opens an archive file with explicit options.
    pub fn from_file_with_options(
        archive: impl AsRef<Path>,
        chroot: impl AsRef<Path>,
        options: ExtractorOptions,
    ) -> Result<Self> {
        let file = File::open(archive).map_err(Error::Io)?;
        let size = file.metadata().map_err(Error::Io)?.len();
        Self::from_reader_at(FileReader::from(file), size, chroot, options)
    }
}

impl<R: Read + Seek + Send> Extractor<MutexReader<R>> {
    /// Returns a new extractor reading the archive from a seekable reader
    /// of `size` bytes.
    pub fn from_reader(reader: R, size: u64, chroot: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader_with_options(reader, size, chroot, ExtractorOptions::default())
    }

    /// Like [`from_reader`](Extractor::from_reader), with explicit options.
    pub fn from_reader_with_options(
        reader: R,
        size: u64,
        chroot: impl AsRef<Path>,
        options: ExtractorOptions,
    ) -> Result<Self> {
        Self::from_reader_at(MutexReader::new(reader), size, chroot, options)
    }
}

impl<R: ReaderAt + Sync> Extractor<R> {
    fn from_reader_at(
        reader: R,
        size: u64,
        chroot: impl AsRef<Path>,
        options: ExtractorOptions,
    ) -> Result<Self> {
        let concurrency = match options.concurrency {
            Some(0) => return Err(Error::MinConcurrency),
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let chroot = absolute(chroot.as_ref())?;
        let registry = Arc::new(CodecRegistry::with_defaults());
        let zip = ZipReader::with_registry(reader, size, registry.clone())?;

        Ok(Extractor {
            zip,
            chroot,
            concurrency,
            chown_error_handler: options.chown_error_handler.map(Mutex::new),
            registry,
            counters: Counters::default(),
        })
    }

    /// Registers a custom decompressor for a method id. Store, deflate and
    /// zstd are built in.
    pub fn register_decompressor(&self, method: u16, decompressor: Arc<dyn Decompressor>) {
        self.registry.register_decompressor(method, decompressor);
    }

    /// The archive's entries, in central directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        self.zip.entries()
    }

    /// Returns how many payload bytes and entries have been written to
    /// disk. May be called while extraction is in progress.
    pub fn written(&self) -> (u64, u64) {
        self.counters.written()
    }

    /// Extracts files, symlinks and directories from the archive.
    pub fn extract(&self, ctx: &CancelToken) -> Result<()> {
        self.extract_files_and_directories(ctx)?;
        self.extract_symlinks(ctx)?;
        self.restore_directory_metadata(ctx)
    }

    /// Phase 1: directories are created inline; regular files fan out to
    /// workers. Symlinks are skipped here on purpose.
    fn extract_files_and_directories(&self, ctx: &CancelToken) -> Result<()> {
        let concurrency = self.concurrency.min(self.zip.entries().len()).max(1);

        let first_error = Mutex::new(None::<Error>);
        let record_error = |err: Error| {
            let mut slot = first_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
            ctx.cancel();
        };

        std::thread::scope(|scope| {
            let (jobs_tx, jobs_rx) = crossbeam_channel::bounded::<(&ZipEntry, PathBuf)>(concurrency);

            for _ in 0..concurrency {
                let jobs = jobs_rx.clone();
                let record_error = &record_error;
                scope.spawn(move || {
                    for (entry, path) in jobs.iter() {
                        if ctx.is_cancelled() {
                            continue;
                        }
                        if let Err(err) = self.extract_file(ctx, entry, &path) {
                            record_error(err);
                        }
                    }
                });
            }

            let mut dispatch = || -> Result<()> {
                for entry in self.zip.entries() {
                    let mode = entry.mode();
                    if mode.is_irregular() {
                        continue;
                    }

                    let path = self.chroot_path(entry)?;
                    if let Some(parent) = path.parent() {
                        // Pre-create missing ancestors so entry order within
                        // the archive does not matter.
                        fs::create_dir_all(parent).map_err(Error::Io)?;
                    }

                    ctx.check()?;

                    if mode.is_symlink() {
                        // Deferred to phase 2.
                        continue;
                    }

                    if entry.is_dir() {
                        match fs::create_dir(&path) {
                            Err(err) if err.kind() != io::ErrorKind::AlreadyExists => {
                                return Err(Error::Io(err));
                            }
                            _ => {}
                        }
                        self.counters.inc_entries();
                        continue;
                    }

                    if jobs_tx.send((entry, path)).is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                Ok(())
            };

            if let Err(err) = dispatch() {
                record_error(err);
            }
            drop(jobs_tx);
        });

        match first_error.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Phase 2: create symlinks sequentially, now that every path a link
    /// could shadow already exists.
    fn extract_symlinks(&self, ctx: &CancelToken) -> Result<()> {
        for entry in self.zip.entries() {
            if !entry.mode().is_symlink() {
                continue;
            }

            ctx.check()?;

            let path = self.chroot_path(entry)?;
            match fs::remove_file(&path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(Error::Io(err)),
                _ => {}
            }

            let mut target = String::new();
            self.zip
                .entry_reader(entry)?
                .read_to_string(&mut target)
                .map_err(Error::from)?;

            platform::symlink(&target, &path).map_err(Error::Io)?;
            self.restore_metadata(&path, entry)?;
            self.counters.inc_entries();
        }

        Ok(())
    }

    /// Phase 3: re-apply directory permissions and times, which phases 1
    /// and 2 clobbered by creating children.
    fn restore_directory_metadata(&self, ctx: &CancelToken) -> Result<()> {
        for entry in self.zip.entries() {
            if !entry.is_dir() {
                continue;
            }

            ctx.check()?;

            let path = self.chroot_path(entry)?;
            self.restore_metadata(&path, entry)?;
        }

        Ok(())
    }

    fn extract_file(&self, ctx: &CancelToken, entry: &ZipEntry, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(Error::Io(err)),
            _ => {}
        }

        let mut reader = self.zip.entry_reader(entry)?;

        let file = open_for_writing(path).map_err(Error::Io)?;
        let counting = CountingWriter::new(file, &self.counters.bytes, ctx);
        let mut writer = BufWriter::with_capacity(32 * 1024, counting);
        io::copy(&mut reader, &mut writer).map_err(Error::from)?;
        writer.flush().map_err(Error::from)?;
        drop(writer);

        self.restore_metadata(path, entry)?;
        self.counters.inc_entries();
        Ok(())
    }

    /// Joins an entry onto the chroot and rejects anything that resolves
    /// outside it.
    fn chroot_path(&self, entry: &ZipEntry) -> Result<PathBuf> {
        let path = absolute(&self.chroot.join(entry.name()))?;
        if path != self.chroot && !path.starts_with(&self.chroot) {
            return Err(Error::OutsideChroot {
                path,
                chroot: self.chroot.clone(),
            });
        }
        Ok(path)
    }

    /// Restores an entry's metadata: mtime at symlink precision (atime
    /// becomes "now"; archives do not carry one), permission bits, and
    /// ownership when an Info-ZIP New Unix field is present.
    fn restore_metadata(&self, path: &Path, entry: &ZipEntry) -> Result<()> {
        let unix_ids = extra::unix_ids(entry.extra())?;

        let mtime = entry.modified().to_system();
        platform::lchtimes(path, std::time::SystemTime::now(), mtime).map_err(Error::Io)?;
        platform::lchmod(path, entry.mode()).map_err(Error::Io)?;

        let Some((uid, gid)) = unix_ids else {
            return Ok(());
        };

        if let Err(err) = platform::lchown(path, uid, gid) {
            // Restoring ownership commonly fails without privileges; the
            // caller decides whether that matters.
            if let Some(handler) = &self.chown_error_handler {
                let handler = handler.lock().unwrap();
                (*handler)(entry.name(), err).map_err(Error::Io)?;
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn open_for_writing(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
}

#[cfg(not(unix))]
fn open_for_writing(path: &Path) -> io::Result<File> {
    File::options().write(true).create(true).truncate(true).open(path)
}
