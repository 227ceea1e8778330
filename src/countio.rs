use crate::cancel::CancelToken;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Progress counters published by archivers and extractors.
///
/// Both values only ever increase during an operation and may be read at any
/// time from any thread.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) bytes: AtomicU64,
    entries: AtomicU64,
}

impl Counters {
    pub(crate) fn inc_entries(&self) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of (payload bytes written, entries completed).
    pub(crate) fn written(&self) -> (u64, u64) {
        (
            self.bytes.load(Ordering::Relaxed),
            self.entries.load(Ordering::Relaxed),
        )
    }
}

/// Byte-counting writer that doubles as the cancellation probe.
///
/// Every payload write on either side of the pipeline goes through here:
/// the cancellation token is consulted before the write, and the byte
/// counter is bumped after it. Cancellation is reported as an `io::Error`
/// wrapping [`Error::Cancelled`](crate::Error::Cancelled) so it survives
/// `std::io::copy` and is recovered by `Error::from`.
pub(crate) struct CountingWriter<'a, W> {
    inner: W,
    bytes: &'a AtomicU64,
    ctx: &'a CancelToken,
}

impl<'a, W> CountingWriter<'a, W> {
    pub(crate) fn new(inner: W, bytes: &'a AtomicU64, ctx: &'a CancelToken) -> Self {
        CountingWriter { inner, bytes, ctx }
    }
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.check().map_err(io::Error::other)?;
        let written = self.inner.write(buf)?;
        self.bytes.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
