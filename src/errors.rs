use std::path::PathBuf;
use thiserror::Error;

/// Result type for fastzip operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while archiving or extracting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// A path resolved outside of the configured chroot.
    #[error("{} cannot be accessed from outside of chroot ({})", .path.display(), .chroot.display())]
    OutsideChroot { path: PathBuf, chroot: PathBuf },

    /// Pool size must be greater than zero.
    #[error("pool size must be greater than zero")]
    PoolTooSmall,

    /// Concurrency must be greater than zero.
    #[error("concurrency must be greater than zero")]
    MinConcurrency,

    /// No codec is registered for the entry's compression method.
    #[error("unsupported compression method: {0}")]
    UnsupportedMethod(u16),

    /// Could not find the end of central directory record.
    #[error("missing end of central directory")]
    MissingEndOfCentralDirectory,

    /// Zip64 record not found when the end of central directory demands one.
    #[error("missing zip64 end of central directory")]
    MissingZip64EndOfCentralDirectory,

    /// Invalid record signature.
    #[error("invalid signature: expected {expected:#010x}, got {actual:#010x}")]
    InvalidSignature { expected: u32, actual: u32 },

    /// Decompressed data did not match the recorded checksum.
    #[error("invalid checksum: expected {expected:#010x}, got {actual:#010x}")]
    InvalidChecksum { expected: u32, actual: u32 },

    /// Decompressed data did not match the recorded size.
    #[error("invalid size: expected {expected}, got {actual}")]
    InvalidSize { expected: u64, actual: u64 },

    /// Invalid UTF-8 in an entry name.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A source path whose name cannot be represented in a zip archive.
    #[error("path contains non-utf8 bytes")]
    NonUtf8Name,

    /// Corrupt extra field data.
    #[error("invalid extra field: {0}")]
    InvalidExtraField(&'static str),

    /// Entry name exceeds the 16-bit length field.
    #[error("entry name too long")]
    NameTooLong,

    /// An entry name that cannot be written as requested.
    #[error("invalid entry name: {0}")]
    InvalidEntryName(&'static str),

    /// Unexpected end of file.
    #[error("unexpected end of file")]
    Eof,

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Aggregate of errors encountered while closing a file pool.
    #[error(transparent)]
    Close(#[from] CloseError),
}

impl From<std::io::Error> for Error {
    /// Unwraps errors that crossed an `std::io` boundary.
    ///
    /// The counting writer reports cancellation as an `io::Error` so that it
    /// propagates through `std::io::copy`; recover it here rather than
    /// burying it inside an I/O variant.
    fn from(err: std::io::Error) -> Error {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(err) => Error::Io(err),
        }
    }
}

/// A collection of errors raised while closing a `FilePool`.
///
/// Closing continues past individual failures so that every spill file gets
/// a removal attempt; the causes are aggregated here.
#[derive(Debug, Default)]
pub struct CloseError(Vec<Error>);

impl CloseError {
    pub(crate) fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// Returns true when no causes were recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of aggregated causes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over each underlying cause.
    pub fn causes(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for err in &self.0 {
            writeln!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}
