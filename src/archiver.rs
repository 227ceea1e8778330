//! Parallel archiving.
//!
//! The dispatch loop walks the caller's path map in sorted order. Tiny
//! entries (directories, symlinks) are written inline; regular files are
//! handed to worker threads that pre-compress into pooled staging buffers
//! and then splice the staged bytes into the archive as raw entries with
//! pre-computed sizes and checksum. A sequence-numbered turnstile admits
//! writers to the shared zip writer strictly in dispatch order, so the
//! central directory always matches the sorted input regardless of how the
//! workers interleave.

use crate::cancel::CancelToken;
use crate::countio::{Counters, CountingWriter};
use crate::errors::{Error, Result};
use crate::extra;
use crate::filepool::{FilePool, PoolFile};
use crate::mode::EntryMode;
use crate::path::ZipFilePath;
use crate::platform;
use crate::register::{CodecRegistry, Compressor, METHOD_DEFLATE, METHOD_STORE};
use crate::time::{DosDateTime, UtcDateTime};
use crate::writer::{
    EntryHeader, RawEntryHeader, ZipWriter, FLAG_DATA_DESCRIPTOR, FLAG_UTF8_ENCODING,
};
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Options for creating an [`Archiver`].
#[derive(Debug, Clone)]
pub struct ArchiverOptions {
    method: u16,
    concurrency: usize,
    stage_dir: Option<PathBuf>,
    buffer_size: i64,
    offset: u64,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        ArchiverOptions {
            method: METHOD_DEFLATE,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            stage_dir: None,
            buffer_size: -1,
            offset: 0,
        }
    }
}

impl ArchiverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compression method for regular files. Defaults to deflate.
    pub fn method(mut self, method: u16) -> Self {
        self.method = method;
        self
    }

    /// Maximum number of files compressed concurrently. Defaults to the
    /// available hardware parallelism. Zero is rejected at construction.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Directory for staging buffer spill files. Defaults to the chroot.
    pub fn stage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stage_dir = Some(dir.into());
        self
    }

    /// In-memory prefix size of each staging buffer. Negative selects the
    /// default (2 MiB); zero spills every byte to disk.
    pub fn buffer_size(mut self, size: i64) -> Self {
        self.buffer_size = size;
        self
    }

    /// Bytes already present in the output before the archive begins.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// An opinionated, parallel zip archiver.
///
/// Only regular files, symlinks and directories are supported; other modes
/// are silently skipped. Only paths inside the chroot directory may be
/// archived. Access permissions, unix ownership and modification times are
/// preserved.
pub struct Archiver<W> {
    zip: Mutex<ZipWriter<W>>,
    chroot: PathBuf,
    options: ArchiverOptions,
    registry: Arc<CodecRegistry>,
    counters: Counters,
}

impl<W: Write + Send> Archiver<W> {
    /// Creates an archiver writing to `writer`, restricted to `chroot`.
    pub fn new(writer: W, chroot: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(writer, chroot, ArchiverOptions::default())
    }

    /// Creates an archiver with explicit options.
    pub fn with_options(
        writer: W,
        chroot: impl AsRef<Path>,
        options: ArchiverOptions,
    ) -> Result<Self> {
        if options.concurrency == 0 {
            return Err(Error::MinConcurrency);
        }

        let chroot = absolute(chroot.as_ref())?;
        let registry = Arc::new(CodecRegistry::with_defaults());
        let zip = ZipWriter::with_registry(writer, registry.clone(), options.offset);

        Ok(Archiver {
            zip: Mutex::new(zip),
            chroot,
            options,
            registry,
            counters: Counters::default(),
        })
    }

    /// Registers a custom compressor for a method id. Store, deflate and
    /// zstd are built in.
    pub fn register_compressor(&self, method: u16, compressor: Arc<dyn Compressor>) {
        self.registry.register_compressor(method, compressor);
    }

    /// Returns how many payload bytes and entries have been written.
    /// May be called while archiving is in progress.
    pub fn written(&self) -> (u64, u64) {
        self.counters.written()
    }

    /// Flushes the central directory and returns the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.zip.into_inner().unwrap().finish()
    }

    /// Archives all paths in `files`, a map from absolute path to its
    /// metadata, in ascending lexicographic path order.
    pub fn archive(&self, ctx: &CancelToken, files: &HashMap<PathBuf, Metadata>) -> Result<()> {
        let mut names: Vec<&PathBuf> = files.keys().collect();
        names.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

        let concurrency = self.options.concurrency.min(names.len()).max(1);
        let stage_dir = self
            .options
            .stage_dir
            .clone()
            .unwrap_or_else(|| self.chroot.clone());

        let mut pool = if concurrency > 1 {
            Some(FilePool::new(&stage_dir, concurrency, self.options.buffer_size)?)
        } else {
            None
        };

        let gate = EmitGate::new();
        let first_error = Mutex::new(None::<Error>);
        let record_error = |err: Error| {
            let mut slot = first_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
            ctx.cancel();
        };

        std::thread::scope(|scope| {
            let (jobs_tx, jobs_rx) = crossbeam_channel::bounded::<Job>(concurrency);

            if let Some(pool) = pool.as_ref() {
                for _ in 0..concurrency {
                    let jobs = jobs_rx.clone();
                    let gate = &gate;
                    let record_error = &record_error;
                    scope.spawn(move || {
                        for job in jobs.iter() {
                            if ctx.is_cancelled() {
                                continue;
                            }
                            if let Err(err) = self.archive_parallel(ctx, pool, gate, &job) {
                                record_error(err);
                            }
                        }
                    });
                }
            }

            let result = self.dispatch(ctx, files, &names, pool.as_ref(), &gate, &jobs_tx);
            if let Err(err) = result {
                record_error(err);
            }
            drop(jobs_tx);
        });

        let close_result = match pool.as_mut() {
            Some(pool) => pool.close(),
            None => Ok(()),
        };

        if let Some(err) = first_error.into_inner().unwrap() {
            return Err(err);
        }
        close_result
    }

    fn dispatch(
        &self,
        ctx: &CancelToken,
        files: &HashMap<PathBuf, Metadata>,
        names: &[&PathBuf],
        pool: Option<&FilePool>,
        gate: &EmitGate,
        jobs: &crossbeam_channel::Sender<Job>,
    ) -> Result<()> {
        let mut sequence = 0u64;

        for name in names {
            ctx.check()?;

            let metadata = &files[*name];
            let mode = platform::entry_mode(metadata);
            if mode.is_irregular() {
                continue;
            }

            let path = absolute(name)?;
            if path != self.chroot && !path.starts_with(&self.chroot) {
                return Err(Error::OutsideChroot {
                    path,
                    chroot: self.chroot.clone(),
                });
            }

            let rel = path.strip_prefix(&self.chroot).unwrap_or(Path::new(""));
            let name = zip_name(rel, mode.is_dir())?;
            if name.is_empty() {
                // The chroot directory itself.
                continue;
            }

            let modified = metadata.modified().ok().map(UtcDateTime::from_system);
            let unix_ids = platform::unix_ids(metadata);
            let seq = sequence;
            sequence += 1;

            if mode.is_dir() {
                self.write_directory(ctx, gate, seq, &name, modified, mode, unix_ids)?;
            } else if mode.is_symlink() {
                self.write_symlink(ctx, gate, seq, &path, &name, modified, mode, unix_ids)?;
            } else if pool.is_some() && self.registry.compressor(self.options.method).is_some() {
                let job = Job {
                    seq,
                    path,
                    name,
                    method: self.options.method,
                    modified,
                    mode,
                    unix_ids,
                };
                if jobs.send(job).is_err() {
                    // Workers only disappear once the scope unwinds.
                    return Err(Error::Cancelled);
                }
            } else {
                self.write_file_inline(
                    ctx,
                    gate,
                    seq,
                    &path,
                    &name,
                    self.options.method,
                    modified,
                    mode,
                    unix_ids,
                )?;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_directory(
        &self,
        ctx: &CancelToken,
        gate: &EmitGate,
        seq: u64,
        name: &str,
        modified: Option<UtcDateTime>,
        mode: EntryMode,
        unix_ids: Option<(u32, u32)>,
    ) -> Result<()> {
        gate.wait_turn(seq, ctx)?;
        let result = {
            let mut zip = self.zip.lock().unwrap();
            zip.create_directory(&EntryHeader {
                name,
                method: METHOD_STORE,
                modified,
                mode,
                unix_ids,
            })
        };
        gate.advance();
        result?;
        self.counters.inc_entries();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_symlink(
        &self,
        ctx: &CancelToken,
        gate: &EmitGate,
        seq: u64,
        path: &Path,
        name: &str,
        modified: Option<UtcDateTime>,
        mode: EntryMode,
        unix_ids: Option<(u32, u32)>,
    ) -> Result<()> {
        let target = std::fs::read_link(path).map_err(Error::Io)?;
        let target = target.to_str().ok_or(Error::NonUtf8Name)?;

        gate.wait_turn(seq, ctx)?;
        let result = {
            let mut zip = self.zip.lock().unwrap();
            zip.create(
                &EntryHeader {
                    name,
                    method: METHOD_STORE,
                    modified,
                    mode,
                    unix_ids,
                },
                &mut target.as_bytes(),
            )
        };
        gate.advance();
        result?;
        self.counters.inc_entries();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_file_inline(
        &self,
        ctx: &CancelToken,
        gate: &EmitGate,
        seq: u64,
        path: &Path,
        name: &str,
        method: u16,
        modified: Option<UtcDateTime>,
        mode: EntryMode,
        unix_ids: Option<(u32, u32)>,
    ) -> Result<()> {
        let mut src = File::open(path).map_err(Error::Io)?;

        gate.wait_turn(seq, ctx)?;
        let result = {
            let mut zip = self.zip.lock().unwrap();
            zip.create(
                &EntryHeader {
                    name,
                    method,
                    modified,
                    mode,
                    unix_ids,
                },
                &mut src,
            )
        };
        gate.advance();
        result?;
        self.counters.inc_entries();
        Ok(())
    }

    /// The worker path: stage the compressed form into a pool buffer, then
    /// splice it into the archive when this entry's turn comes up.
    fn archive_parallel(
        &self,
        ctx: &CancelToken,
        pool: &FilePool,
        gate: &EmitGate,
        job: &Job,
    ) -> Result<()> {
        let mut staged = pool.get();
        let result = self.stage_and_emit(ctx, gate, &mut staged, job);
        pool.put(staged);
        result
    }

    fn stage_and_emit(
        &self,
        ctx: &CancelToken,
        gate: &EmitGate,
        staged: &mut PoolFile,
        job: &Job,
    ) -> Result<()> {
        let mut src = File::open(&job.path).map_err(Error::Io)?;
        let compressor = self.registry.require_compressor(job.method)?;

        let mut uncompressed_size = 0u64;
        {
            let (sink, hasher) = staged.sink_and_hasher();
            let mut encoder = compressor.encoder(Box::new(sink)).map_err(Error::Io)?;
            let mut buf = [0u8; 32 * 1024];
            loop {
                let read = src.read(&mut buf).map_err(Error::Io)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
                uncompressed_size += read as u64;
                encoder.write_all(&buf[..read]).map_err(Error::Io)?;
            }
            encoder.finish().map_err(Error::Io)?;
        }

        let compressed_size = staged.written();
        let extra = extra::build(job.modified.as_ref(), job.unix_ids);

        gate.wait_turn(job.seq, ctx)?;
        let result = (|| -> Result<()> {
            let mut zip = self.zip.lock().unwrap();
            if compressed_size > uncompressed_size {
                // Compression inflated the entry; rewind the source and
                // store it through the simple path instead.
                src.rewind().map_err(Error::Io)?;
                zip.create(
                    &EntryHeader {
                        name: &job.name,
                        method: METHOD_STORE,
                        modified: job.modified,
                        mode: job.mode,
                        unix_ids: job.unix_ids,
                    },
                    &mut src,
                )?;
            } else {
                let raw = raw_entry_header(job, staged.checksum(), compressed_size, uncompressed_size, &extra);
                let mut entry = zip.create_raw(&raw)?;
                let mut counting = CountingWriter::new(&mut entry, &self.counters.bytes, ctx);
                io::copy(staged, &mut counting).map_err(Error::from)?;
                entry.finish()?;
            }
            Ok(())
        })();
        gate.advance();
        result?;
        self.counters.inc_entries();
        Ok(())
    }
}

struct Job {
    seq: u64,
    path: PathBuf,
    name: String,
    method: u16,
    modified: Option<UtcDateTime>,
    mode: EntryMode,
    unix_ids: Option<(u32, u32)>,
}

/// Derives the raw local header fields that the raw creation path leaves to
/// its caller: the UTF-8 flag, the data-descriptor flag, the DOS stamp and
/// the per-entry extra fields.
fn raw_entry_header<'a>(
    job: &'a Job,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    extra: &'a [u8],
) -> RawEntryHeader<'a> {
    let mut flags = FLAG_DATA_DESCRIPTOR;
    if ZipFilePath::from_str(&job.name).needs_utf8_encoding() {
        flags |= FLAG_UTF8_ENCODING;
    }

    let (dos_time, dos_date) = job
        .modified
        .as_ref()
        .map(|dt| DosDateTime::from(dt).into_parts())
        .unwrap_or((0, 0));

    RawEntryHeader {
        name: &job.name,
        method: job.method,
        flags,
        dos_time,
        dos_date,
        extra,
        mode: job.mode,
        crc32,
        compressed_size,
        uncompressed_size,
    }
}

/// Serialises emission into dispatch order: entry `n + 1` may only touch the
/// zip writer after entry `n` has advanced the turn.
struct EmitGate {
    turn: Mutex<u64>,
    unblocked: Condvar,
}

impl EmitGate {
    fn new() -> Self {
        EmitGate {
            turn: Mutex::new(0),
            unblocked: Condvar::new(),
        }
    }

    /// Blocks until `seq` is current. Polls the cancellation token while
    /// waiting so a cancelled operation cannot strand waiters.
    fn wait_turn(&self, seq: u64, ctx: &CancelToken) -> Result<()> {
        let mut turn = self.turn.lock().unwrap();
        while *turn != seq {
            ctx.check()?;
            let (guard, _) = self
                .unblocked
                .wait_timeout(turn, Duration::from_millis(50))
                .unwrap();
            turn = guard;
        }
        drop(turn);
        ctx.check()
    }

    fn advance(&self) {
        *self.turn.lock().unwrap() += 1;
        self.unblocked.notify_all();
    }
}

/// Makes a path absolute and lexically resolves `.` and `..` components,
/// like Go's `filepath.Abs`.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(Error::Io)?.join(path)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}

/// Builds the archive entry name for a path relative to the chroot:
/// forward-slash separated, with a trailing slash for directories.
fn zip_name(rel: &Path, is_dir: bool) -> Result<String> {
    let mut name = String::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            let part = part.to_str().ok_or(Error::NonUtf8Name)?;
            if !name.is_empty() {
                name.push('/');
            }
            name.push_str(part);
        }
    }
    if is_dir && !name.is_empty() {
        name.push('/');
    }
    Ok(name)
}
