//! A fixed-size pool of reusable staging buffers.
//!
//! Each buffer is an in-memory prefix plus a lazily-created spill file, so a
//! pool of `n` buffers with prefix size `b` bounds staging memory at
//! `n * b` bytes regardless of how large individual entries are. Spill
//! files are written and read positionally and are never seeked.

use crate::errors::{CloseError, Error, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// A bounded pool of [`PoolFile`] buffers.
///
/// [`get`](FilePool::get) blocks until a buffer is free; a loaned buffer is
/// exclusively owned until [`put`](FilePool::put) returns it. Buffers cycle
/// through a bounded channel, which doubles as the pool's semaphore.
pub(crate) struct FilePool {
    slots: crossbeam_channel::Receiver<PoolFile>,
    returns: crossbeam_channel::Sender<PoolFile>,
    size: usize,
}

impl FilePool {
    /// Creates a pool of `pool_size` buffers spilling into `dir`.
    ///
    /// A negative `buffer_size` selects the 2 MiB default; zero disables the
    /// in-memory prefix so every byte spills. Spill files are not created
    /// until a buffer overflows.
    pub(crate) fn new(dir: &Path, pool_size: usize, buffer_size: i64) -> Result<FilePool> {
        if pool_size == 0 {
            return Err(Error::PoolTooSmall);
        }

        let buffer_size = if buffer_size < 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size as usize
        };

        let (returns, slots) = crossbeam_channel::bounded(pool_size);
        for idx in 0..pool_size {
            returns
                .send(PoolFile::new(dir, idx, buffer_size))
                .expect("pool channel sized to hold every slot");
        }

        Ok(FilePool {
            slots,
            returns,
            size: pool_size,
        })
    }

    /// Gets a buffer from the pool, blocking until one is free.
    pub(crate) fn get(&self) -> PoolFile {
        // The pool owns the sending half, so the channel cannot disconnect.
        self.slots.recv().expect("pool channel open")
    }

    /// Returns a buffer to the pool, resetting it for the next tenant.
    pub(crate) fn put(&self, mut file: PoolFile) {
        file.reset();
        self.returns.send(file).expect("pool channel open");
    }

    /// Closes the pool, removing every spill file. Every loan must have been
    /// returned. Individual failures do not stop the sweep; they are
    /// aggregated into the returned error. Already-removed files are not
    /// errors.
    pub(crate) fn close(&mut self) -> Result<()> {
        let mut errors = CloseError::default();
        for _ in 0..self.size {
            match self.slots.try_recv() {
                Ok(file) => file.remove(&mut errors),
                Err(_) => break,
            }
        }
        self.size = 0;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}

/// A single staging buffer: an in-memory prefix, an optional spill file, and
/// a running CRC-32 the owner tees source bytes into.
pub(crate) struct PoolFile {
    dir: PathBuf,
    idx: usize,
    capacity: usize,
    buf: Vec<u8>,
    file: Option<File>,
    write_offset: u64,
    read_offset: u64,
    crc: crc32fast::Hasher,
}

impl PoolFile {
    fn new(dir: &Path, idx: usize, capacity: usize) -> Self {
        PoolFile {
            dir: dir.to_path_buf(),
            idx,
            capacity,
            buf: Vec::new(),
            file: None,
            write_offset: 0,
            read_offset: 0,
            crc: crc32fast::Hasher::new(),
        }
    }

    fn spill_path(&self) -> PathBuf {
        self.dir.join(format!("fastzip_{:02}", self.idx))
    }

    /// Number of bytes written to the buffer by its current tenant.
    pub(crate) fn written(&self) -> u64 {
        self.write_offset
    }

    /// Current CRC-32 over everything teed into the accumulator.
    pub(crate) fn checksum(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// The CRC accumulator, for teeing source bytes while writing.
    #[cfg(test)]
    pub(crate) fn hasher(&mut self) -> &mut crc32fast::Hasher {
        &mut self.crc
    }

    /// Splits the buffer into a compressed-output sink and the CRC
    /// accumulator so both can be driven during a single loan.
    pub(crate) fn sink_and_hasher(&mut self) -> (PoolSink<'_>, &mut crc32fast::Hasher) {
        let PoolFile {
            dir,
            idx,
            capacity,
            buf,
            file,
            write_offset,
            crc,
            ..
        } = self;
        (
            PoolSink {
                dir,
                idx: *idx,
                capacity: *capacity,
                buf,
                file,
                write_offset,
            },
            crc,
        )
    }

    fn reset(&mut self) {
        self.write_offset = 0;
        self.read_offset = 0;
        self.buf.clear();
        self.crc = crc32fast::Hasher::new();
        if let Some(file) = &self.file {
            // Keep the spill file open for the next tenant.
            let _ = file.set_len(0);
        }
    }

    fn remove(self, errors: &mut CloseError) {
        if self.file.is_none() {
            return;
        }
        let path = self.spill_path();
        drop(self.file);
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                errors.push(Error::Io(err));
            }
        }
    }
}

impl Write for PoolFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let PoolFile {
            dir,
            idx,
            capacity,
            buf: prefix,
            file,
            write_offset,
            ..
        } = self;
        buffered_write(dir, *idx, *capacity, prefix, file, write_offset, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PoolFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.write_offset - self.read_offset;
        if remaining == 0 {
            return Ok(0);
        }

        let len = buf.len().min(remaining as usize);
        let mut read = 0;

        let prefix_len = self.buf.len() as u64;
        if self.read_offset < prefix_len {
            let start = self.read_offset as usize;
            let take = len.min(self.buf.len() - start);
            buf[..take].copy_from_slice(&self.buf[start..start + take]);
            self.read_offset += take as u64;
            read += take;
        }

        if read < len {
            let file = self
                .file
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "missing spill file"))?;
            read_exact_at(file, &mut buf[read..len], self.read_offset - prefix_len)?;
            self.read_offset += (len - read) as u64;
            read = len;
        }

        Ok(read)
    }
}

/// Write-half of a split [`PoolFile`] loan.
pub(crate) struct PoolSink<'a> {
    dir: &'a Path,
    idx: usize,
    capacity: usize,
    buf: &'a mut Vec<u8>,
    file: &'a mut Option<File>,
    write_offset: &'a mut u64,
}

impl Write for PoolSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        buffered_write(
            self.dir,
            self.idx,
            self.capacity,
            self.buf,
            self.file,
            self.write_offset,
            buf,
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fills the in-memory prefix first, then positionally writes the remainder
/// to the spill file, creating it on first overflow.
fn buffered_write(
    dir: &Path,
    idx: usize,
    capacity: usize,
    prefix: &mut Vec<u8>,
    file: &mut Option<File>,
    write_offset: &mut u64,
    mut buf: &[u8],
) -> io::Result<usize> {
    let mut written = 0;

    if (*write_offset as usize) < capacity {
        if prefix.capacity() == 0 {
            prefix.reserve_exact(capacity);
        }
        let take = buf.len().min(capacity - *write_offset as usize);
        prefix.extend_from_slice(&buf[..take]);
        *write_offset += take as u64;
        written += take;
        buf = &buf[take..];
    }

    if !buf.is_empty() {
        let file = match file {
            Some(file) => file,
            None => {
                let path = dir.join(format!("fastzip_{:02}", idx));
                file.insert(File::options().read(true).write(true).create(true).open(path)?)
            }
        };

        write_all_at(file, buf, *write_offset - capacity as u64)?;
        *write_offset += buf.len() as u64;
        written += buf.len();
    }

    Ok(written)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut written = 0;
    while written < buf.len() {
        match file.seek_write(&buf[written..], offset + written as u64)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "spill file refused the write",
                ))
            }
            n => written += n,
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut filled = 0;
    while filled < buf.len() {
        match file.seek_read(&mut buf[filled..], offset + filled as u64)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "spill file truncated",
                ))
            }
            n => filled += n,
        }
    }
    Ok(())
}
