//! Compression method registry.
//!
//! Maps 16-bit zip method ids to codec factories. Store, deflate and zstd
//! (the WinZip method id) are registered by default; archivers and
//! extractors can override any id at runtime with a custom codec.

use crate::errors::{Error, Result};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, RwLock};

/// Method id for uncompressed entries.
pub const METHOD_STORE: u16 = 0;
/// Method id for deflate.
pub const METHOD_DEFLATE: u16 = 8;
/// Method id for zstandard, as assigned by WinZip.
pub const METHOD_ZSTD: u16 = 93;

/// Streaming compressor state for a single entry.
///
/// Implementations buffer freely; [`finish`](Encoder::finish) flushes any
/// epilogue (deflate final block, zstd frame footer) to the target.
pub trait Encoder: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Factory for per-entry compressors.
pub trait Compressor: Send + Sync {
    /// Returns an encoder whose compressed output is written to `target`.
    fn encoder<'w>(&self, target: Box<dyn Write + 'w>) -> io::Result<Box<dyn Encoder + 'w>>;
}

/// Factory for per-entry decompressors.
pub trait Decompressor: Send + Sync {
    /// Returns a reader yielding the decompressed form of `source`.
    fn decoder<'r>(&self, source: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>>;
}

/// The no-op codec for stored entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCodec;

struct StoreEncoder<'w>(Box<dyn Write + 'w>);

impl Write for StoreEncoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Encoder for StoreEncoder<'_> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

impl Compressor for StoreCodec {
    fn encoder<'w>(&self, target: Box<dyn Write + 'w>) -> io::Result<Box<dyn Encoder + 'w>> {
        Ok(Box::new(StoreEncoder(target)))
    }
}

impl Decompressor for StoreCodec {
    fn decoder<'r>(&self, source: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(source)
    }
}

/// Raw deflate codec backed by flate2.
///
/// The backend is selected at build time: the default pure-rust backend, or
/// zlib-ng with the `zlib-ng` feature.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: flate2::Compression,
}

impl DeflateCodec {
    /// Creates a codec with a specific compression level (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level),
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }
}

struct DeflateEncoder<'w>(flate2::write::DeflateEncoder<Box<dyn Write + 'w>>);

impl Write for DeflateEncoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Encoder for DeflateEncoder<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(|_| ())
    }
}

impl Compressor for DeflateCodec {
    fn encoder<'w>(&self, target: Box<dyn Write + 'w>) -> io::Result<Box<dyn Encoder + 'w>> {
        Ok(Box::new(DeflateEncoder(flate2::write::DeflateEncoder::new(
            target, self.level,
        ))))
    }
}

impl Decompressor for DeflateCodec {
    fn decoder<'r>(&self, source: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(Box::new(flate2::read::DeflateDecoder::new(source)))
    }
}

/// Zstandard codec, written under the WinZip method id.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Creates a codec with a specific compression level.
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

struct ZstdEncoder<'w>(zstd::stream::write::Encoder<'static, Box<dyn Write + 'w>>);

impl Write for ZstdEncoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Encoder for ZstdEncoder<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(|_| ())
    }
}

impl Compressor for ZstdCodec {
    fn encoder<'w>(&self, target: Box<dyn Write + 'w>) -> io::Result<Box<dyn Encoder + 'w>> {
        Ok(Box::new(ZstdEncoder(zstd::stream::write::Encoder::new(
            target, self.level,
        )?)))
    }
}

impl Decompressor for ZstdCodec {
    fn decoder<'r>(&self, source: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(source)?))
    }
}

/// Method id to codec factory table, shared between a writer or reader and
/// its owning archiver or extractor.
pub(crate) struct CodecRegistry {
    compressors: RwLock<HashMap<u16, Arc<dyn Compressor>>>,
    decompressors: RwLock<HashMap<u16, Arc<dyn Decompressor>>>,
}

impl CodecRegistry {
    /// Creates a registry with store, deflate and zstd pre-registered on
    /// both sides.
    pub(crate) fn with_defaults() -> Self {
        let registry = CodecRegistry {
            compressors: RwLock::new(HashMap::new()),
            decompressors: RwLock::new(HashMap::new()),
        };
        registry.register_compressor(METHOD_STORE, Arc::new(StoreCodec));
        registry.register_decompressor(METHOD_STORE, Arc::new(StoreCodec));
        registry.register_compressor(METHOD_DEFLATE, Arc::new(DeflateCodec::default()));
        registry.register_decompressor(METHOD_DEFLATE, Arc::new(DeflateCodec::default()));
        registry.register_compressor(METHOD_ZSTD, Arc::new(ZstdCodec::default()));
        registry.register_decompressor(METHOD_ZSTD, Arc::new(ZstdCodec::default()));
        registry
    }

    pub(crate) fn register_compressor(&self, method: u16, compressor: Arc<dyn Compressor>) {
        self.compressors
            .write()
            .unwrap()
            .insert(method, compressor);
    }

    pub(crate) fn register_decompressor(&self, method: u16, decompressor: Arc<dyn Decompressor>) {
        self.decompressors
            .write()
            .unwrap()
            .insert(method, decompressor);
    }

    pub(crate) fn compressor(&self, method: u16) -> Option<Arc<dyn Compressor>> {
        self.compressors.read().unwrap().get(&method).cloned()
    }

    pub(crate) fn decompressor(&self, method: u16) -> Option<Arc<dyn Decompressor>> {
        self.decompressors.read().unwrap().get(&method).cloned()
    }

    pub(crate) fn require_compressor(&self, method: u16) -> Result<Arc<dyn Compressor>> {
        self.compressor(method)
            .ok_or(Error::UnsupportedMethod(method))
    }

    pub(crate) fn require_decompressor(&self, method: u16) -> Result<Arc<dyn Decompressor>> {
        self.decompressor(method)
            .ok_or(Error::UnsupportedMethod(method))
    }
}
