//! Central-directory reading.
//!
//! [`ZipReader`] locates the end of central directory record, eagerly parses
//! every central directory entry, and opens verified decompressed streams
//! for individual entries. The central directory is the source of truth:
//! local file headers are only consulted to find where an entry's body
//! starts.

use crate::errors::{Error, Result};
use crate::extra;
use crate::mode::{EntryMode, CREATOR_MACOSX, CREATOR_UNIX};
use crate::path::ZipFilePath;
use crate::reader_at::{FileReader, ReaderAt};
use crate::register::CodecRegistry;
use crate::time::{DosDateTime, UtcDateTime};
use crate::utils::{le_u16, le_u32, le_u64};
use std::io::{self, Read};
use std::sync::Arc;

pub(crate) const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;
pub(crate) const CENTRAL_HEADER_SIGNATURE: u32 = 0x02014b50;
pub(crate) const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x06054b50;
pub(crate) const END_OF_CENTRAL_DIR_SIGNATURE64: u32 = 0x06064b50;
pub(crate) const END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE: u32 = 0x07064b50;
pub(crate) const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;

const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;

// How far back from the end of the file to search for the end of central
// directory signature, accounting for the archive comment and trailing junk.
const END_OF_CENTRAL_DIR_MAX_SEARCH: u64 = 1 << 20;

/// A parsed central directory record.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    name: String,
    is_dir: bool,
    method: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
    mode: EntryMode,
    modified: UtcDateTime,
    extra: Vec<u8>,
}

impl ZipEntry {
    /// Normalised entry name: forward slashes, no traversal components.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true for directory entries.
    pub fn is_dir(&self) -> bool {
        self.is_dir || self.mode.is_dir()
    }

    /// File mode derived from the creator version and external attributes.
    pub fn mode(&self) -> EntryMode {
        self.mode
    }

    /// Modification time, preferring extra-field timestamps over the DOS
    /// stamp.
    pub fn modified(&self) -> UtcDateTime {
        self.modified
    }

    /// The raw extra field blob from the central directory.
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    /// Compression method id.
    pub fn method(&self) -> u16 {
        self.method
    }

    /// CRC-32 of the uncompressed data.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Compressed payload size in bytes.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Uncompressed payload size in bytes.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }
}

/// Reads a zip archive's central directory and entry payloads.
pub struct ZipReader<R> {
    reader: R,
    entries: Vec<ZipEntry>,
    registry: Arc<CodecRegistry>,
}

impl ZipReader<FileReader> {
    /// Opens an archive from a file.
    pub fn open_file(file: std::fs::File) -> Result<Self> {
        let size = file.metadata().map_err(Error::Io)?.len();
        Self::new(FileReader::from(file), size)
    }
}

impl<R: ReaderAt> ZipReader<R> {
    /// Opens an archive from a positional reader of `size` bytes with the
    /// default codecs.
    pub fn new(reader: R, size: u64) -> Result<Self> {
        Self::with_registry(reader, size, Arc::new(CodecRegistry::with_defaults()))
    }

    pub(crate) fn with_registry(
        reader: R,
        size: u64,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self> {
        let eocd = locate_eocd(&reader, size)?;

        if eocd
            .central_dir_offset
            .checked_add(eocd.central_dir_size)
            .map(|end| end > size)
            .unwrap_or(true)
        {
            return Err(Error::Eof);
        }

        let mut directory = vec![0u8; eocd.central_dir_size as usize];
        reader
            .read_exact_at(&mut directory, eocd.central_dir_offset)
            .map_err(Error::Io)?;

        let mut entries = Vec::with_capacity(eocd.entries.min(1 << 16) as usize);
        let mut data = directory.as_slice();
        for _ in 0..eocd.entries {
            let (entry, rest) = parse_central_record(data)?;
            entries.push(entry);
            data = rest;
        }

        Ok(ZipReader {
            reader,
            entries,
            registry,
        })
    }

    /// The archive's central directory entries, in directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Opens a decompressed, checksum-verified reader over an entry's data.
    ///
    /// The final read validates the byte count and CRC-32 against the
    /// central directory record.
    pub fn entry_reader(&self, entry: &ZipEntry) -> Result<EntryReader<'_>> {
        let mut header = [0u8; LOCAL_HEADER_FIXED_SIZE];
        self.reader
            .read_exact_at(&mut header, entry.local_header_offset)
            .map_err(Error::Io)?;

        let signature = le_u32(&header[0..4]);
        if signature != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(Error::InvalidSignature {
                expected: LOCAL_FILE_HEADER_SIGNATURE,
                actual: signature,
            });
        }

        // The central directory carries the authoritative sizes; the local
        // header only tells us how long its variable sections are.
        let name_len = le_u16(&header[26..28]) as u64;
        let extra_len = le_u16(&header[28..30]) as u64;
        let body_offset =
            entry.local_header_offset + LOCAL_HEADER_FIXED_SIZE as u64 + name_len + extra_len;

        let section = SectionReader {
            reader: &self.reader,
            offset: body_offset,
            remaining: entry.compressed_size,
        };

        let decompressor = self.registry.require_decompressor(entry.method)?;
        let decoder = decompressor
            .decoder(Box::new(section))
            .map_err(Error::Io)?;

        Ok(EntryReader {
            decoder,
            crc: crc32fast::Hasher::new(),
            size: 0,
            expected_crc: entry.crc32,
            expected_size: entry.uncompressed_size,
            verified: false,
        })
    }
}

/// Bounded positional reader over one entry's compressed payload.
struct SectionReader<'a, R> {
    reader: &'a R,
    offset: u64,
    remaining: u64,
}

impl<R: ReaderAt> Read for SectionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(self.remaining as usize);
        if len == 0 {
            return Ok(0);
        }

        let read = self.reader.read_at(&mut buf[..len], self.offset)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "entry data truncated",
            ));
        }
        self.offset += read as u64;
        self.remaining -= read as u64;
        Ok(read)
    }
}

/// Decompressed entry stream that verifies size and CRC-32 at end of file.
pub struct EntryReader<'a> {
    decoder: Box<dyn Read + 'a>,
    crc: crc32fast::Hasher,
    size: u64,
    expected_crc: u32,
    expected_size: u64,
    verified: bool,
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.decoder.read(buf)?;

        if read == 0 {
            if !buf.is_empty() && !self.verified {
                self.verified = true;
                if self.size != self.expected_size {
                    return Err(io::Error::other(Error::InvalidSize {
                        expected: self.expected_size,
                        actual: self.size,
                    }));
                }
                let actual = self.crc.clone().finalize();
                if actual != self.expected_crc {
                    return Err(io::Error::other(Error::InvalidChecksum {
                        expected: self.expected_crc,
                        actual,
                    }));
                }
            }
            return Ok(0);
        }

        self.crc.update(&buf[..read]);
        self.size += read as u64;
        Ok(read)
    }
}

const LOCAL_HEADER_FIXED_SIZE: usize = 30;
const CENTRAL_HEADER_FIXED_SIZE: usize = 46;

/// Parses one central directory record, returning the entry and the rest of
/// the directory.
fn parse_central_record(data: &[u8]) -> Result<(ZipEntry, &[u8])> {
    if data.len() < CENTRAL_HEADER_FIXED_SIZE {
        return Err(Error::Eof);
    }

    let signature = le_u32(&data[0..4]);
    if signature != CENTRAL_HEADER_SIGNATURE {
        return Err(Error::InvalidSignature {
            expected: CENTRAL_HEADER_SIGNATURE,
            actual: signature,
        });
    }

    let version_made_by = le_u16(&data[4..6]);
    let method = le_u16(&data[10..12]);
    let dos_time = le_u16(&data[12..14]);
    let dos_date = le_u16(&data[14..16]);
    let crc32 = le_u32(&data[16..20]);
    let mut compressed_size = le_u32(&data[20..24]) as u64;
    let mut uncompressed_size = le_u32(&data[24..28]) as u64;
    let name_len = le_u16(&data[28..30]) as usize;
    let extra_len = le_u16(&data[30..32]) as usize;
    let comment_len = le_u16(&data[32..34]) as usize;
    let external_attrs = le_u32(&data[38..42]);
    let mut local_header_offset = le_u32(&data[42..46]) as u64;

    let end = CENTRAL_HEADER_FIXED_SIZE + name_len + extra_len + comment_len;
    if data.len() < end {
        return Err(Error::Eof);
    }

    let raw_name = &data[CENTRAL_HEADER_FIXED_SIZE..CENTRAL_HEADER_FIXED_SIZE + name_len];
    let extra_field =
        &data[CENTRAL_HEADER_FIXED_SIZE + name_len..CENTRAL_HEADER_FIXED_SIZE + name_len + extra_len];

    resolve_zip64(
        extra_field,
        &mut uncompressed_size,
        &mut compressed_size,
        &mut local_header_offset,
    )?;

    let is_dir = raw_name.last() == Some(&b'/');
    let name = ZipFilePath::from_bytes(raw_name)?.into_string();

    let creator = version_made_by >> 8;
    let mut mode = match creator {
        CREATOR_UNIX | CREATOR_MACOSX => EntryMode::from_unix(external_attrs >> 16),
        _ => EntryMode::from_msdos(external_attrs),
    };
    if is_dir {
        mode = mode.with_dir();
    }

    let modified = extra::best_timestamp(extra_field, DosDateTime::new(dos_time, dos_date));

    let entry = ZipEntry {
        name,
        is_dir,
        method,
        crc32,
        compressed_size,
        uncompressed_size,
        local_header_offset,
        mode,
        modified,
        extra: extra_field.to_vec(),
    };

    Ok((entry, &data[end..]))
}

/// Substitutes zip64 extended values for any 32-bit sentinel fields.
fn resolve_zip64(
    extra_field: &[u8],
    uncompressed_size: &mut u64,
    compressed_size: &mut u64,
    local_header_offset: &mut u64,
) -> Result<()> {
    for (id, data) in extra::fields(extra_field) {
        if id != ZIP64_EXTRA_FIELD_ID {
            continue;
        }

        let mut pos = 0;
        if *uncompressed_size == u32::MAX as u64 {
            if pos + 8 > data.len() {
                return Err(Error::InvalidExtraField("zip64 field truncated"));
            }
            *uncompressed_size = le_u64(&data[pos..]);
            pos += 8;
        }
        if *compressed_size == u32::MAX as u64 {
            if pos + 8 > data.len() {
                return Err(Error::InvalidExtraField("zip64 field truncated"));
            }
            *compressed_size = le_u64(&data[pos..]);
            pos += 8;
        }
        if *local_header_offset == u32::MAX as u64 {
            if pos + 8 > data.len() {
                return Err(Error::InvalidExtraField("zip64 field truncated"));
            }
            *local_header_offset = le_u64(&data[pos..]);
        }
        break;
    }

    Ok(())
}

struct EndOfCentralDirectory {
    entries: u64,
    central_dir_size: u64,
    central_dir_offset: u64,
}

/// Finds the end of central directory record by scanning backwards from the
/// end of the file, then follows the zip64 locator when the record carries
/// sentinel values.
fn locate_eocd<R: ReaderAt>(reader: &R, size: u64) -> Result<EndOfCentralDirectory> {
    const EOCD_FIXED_SIZE: usize = 22;
    const LOCATOR_SIZE: usize = 20;
    const ZIP64_EOCD_SIZE: usize = 56;

    if size < EOCD_FIXED_SIZE as u64 {
        return Err(Error::MissingEndOfCentralDirectory);
    }

    let window = size.min(END_OF_CENTRAL_DIR_MAX_SEARCH);
    let window_start = size - window;
    let mut tail = vec![0u8; window as usize];
    reader.read_exact_at(&mut tail, window_start).map_err(Error::Io)?;

    let signature = END_OF_CENTRAL_DIR_SIGNATURE.to_le_bytes();
    let pos = backwards_find(&tail, &signature).ok_or(Error::MissingEndOfCentralDirectory)?;
    if pos + EOCD_FIXED_SIZE > tail.len() {
        return Err(Error::Eof);
    }

    let eocd = &tail[pos..];
    let num_entries = le_u16(&eocd[10..12]);
    let central_dir_size = le_u32(&eocd[12..16]);
    let central_dir_offset = le_u32(&eocd[16..20]);

    // 4.4.22 / 4.4.24: sentinel values defer to the zip64 record.
    let is_zip64 = num_entries == u16::MAX || central_dir_offset == u32::MAX;
    if !is_zip64 {
        return Ok(EndOfCentralDirectory {
            entries: num_entries as u64,
            central_dir_size: central_dir_size as u64,
            central_dir_offset: central_dir_offset as u64,
        });
    }

    let eocd_abs = window_start + pos as u64;
    if eocd_abs < LOCATOR_SIZE as u64 {
        return Err(Error::MissingZip64EndOfCentralDirectory);
    }

    let mut locator = [0u8; LOCATOR_SIZE];
    if pos >= LOCATOR_SIZE {
        locator.copy_from_slice(&tail[pos - LOCATOR_SIZE..pos]);
    } else {
        reader
            .read_exact_at(&mut locator, eocd_abs - LOCATOR_SIZE as u64)
            .map_err(Error::Io)?;
    }

    let locator_signature = le_u32(&locator[0..4]);
    if locator_signature != END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE {
        return Err(Error::MissingZip64EndOfCentralDirectory);
    }
    let zip64_offset = le_u64(&locator[8..16]);

    let mut record = [0u8; ZIP64_EOCD_SIZE];
    reader
        .read_exact_at(&mut record, zip64_offset)
        .map_err(|_| Error::MissingZip64EndOfCentralDirectory)?;

    let record_signature = le_u32(&record[0..4]);
    if record_signature != END_OF_CENTRAL_DIR_SIGNATURE64 {
        return Err(Error::InvalidSignature {
            expected: END_OF_CENTRAL_DIR_SIGNATURE64,
            actual: record_signature,
        });
    }

    Ok(EndOfCentralDirectory {
        entries: le_u64(&record[32..40]),
        central_dir_size: le_u64(&record[40..48]),
        central_dir_offset: le_u64(&record[48..56]),
    })
}

fn backwards_find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
