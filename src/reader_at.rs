//! Positional reads over an archive source.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

/// Reads bytes at an absolute offset through a shared reference.
///
/// Extraction decompresses entry payloads straight out of the archive,
/// often from several threads at once. Taking `&self` and an explicit
/// offset leaves no shared seek position to fight over, so every entry
/// reader can make progress independently.
pub trait ReaderAt {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; zero means the offset is at or past the end
    /// of the data.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;

    /// Fills `buf` completely from `offset`, or fails with
    /// [`UnexpectedEof`](std::io::ErrorKind::UnexpectedEof) if the data
    /// runs out first.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
        while !buf.is_empty() {
            let read = self.read_at(buf, offset)?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "archive data ended mid-read",
                ));
            }
            offset += read as u64;
            let rest = buf;
            buf = &mut rest[read..];
        }
        Ok(())
    }
}

/// A file that supports positional reads on every platform.
///
/// Unix files read at an offset natively; elsewhere the file falls back to
/// the mutex-serialised seek emulation.
#[cfg(unix)]
pub struct FileReader(File);

#[cfg(not(unix))]
pub struct FileReader(MutexReader<File>);

impl ReaderAt for FileReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        #[cfg(unix)]
        return std::os::unix::fs::FileExt::read_at(&self.0, buf, offset);
        #[cfg(not(unix))]
        return self.0.read_at(buf, offset);
    }
}

impl From<File> for FileReader {
    fn from(file: File) -> Self {
        #[cfg(unix)]
        return Self(file);
        #[cfg(not(unix))]
        return Self(MutexReader::new(file));
    }
}

/// Adapts any seekable reader to [`ReaderAt`] by serialising access behind
/// a mutex.
pub struct MutexReader<R>(Mutex<R>);

impl<R> MutexReader<R> {
    pub fn new(inner: R) -> Self {
        Self(Mutex::new(inner))
    }
}

impl<R> ReaderAt for MutexReader<R>
where
    R: Read + Seek,
{
    /// Emulates a positional read under the lock: note where the stream
    /// currently is, jump to the requested offset, read, and jump back so
    /// the wrapped reader never observes the detour.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        let resume_at = inner.stream_position()?;
        inner.seek(SeekFrom::Start(offset))?;
        let read = inner.read(buf);
        inner.seek(SeekFrom::Start(resume_at))?;
        read
    }
}

impl<T: ReaderAt> ReaderAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl ReaderAt for &[u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let start = (offset as usize).min(self.len());
        let available = &self[start..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        Ok(len)
    }
}
