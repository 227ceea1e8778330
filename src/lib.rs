#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]
#![deny(unsafe_code)]

mod archiver;
mod cancel;
mod countio;
mod errors;
mod extra;
mod extractor;
mod filepool;
mod mode;
mod path;
mod platform;
mod reader;
mod reader_at;
mod register;
mod time;
mod utils;
mod writer;

pub use archiver::{Archiver, ArchiverOptions};
pub use cancel::CancelToken;
pub use errors::{CloseError, Error, Result};
pub use extractor::{ChownErrorHandler, Extractor, ExtractorOptions};
pub use mode::EntryMode;
pub use path::ZipFilePath;
pub use reader::{EntryReader, ZipEntry, ZipReader};
pub use reader_at::{FileReader, MutexReader, ReaderAt};
pub use register::{
    Compressor, Decompressor, DeflateCodec, Encoder, StoreCodec, ZstdCodec, METHOD_DEFLATE,
    METHOD_STORE, METHOD_ZSTD,
};
pub use time::{DosDateTime, UtcDateTime};
pub use writer::{EntryCounts, EntryHeader, RawEntryHeader, RawEntryWriter, ZipWriter};
