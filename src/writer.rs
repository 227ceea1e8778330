//! Entry-level zip emission.
//!
//! [`ZipWriter`] appends local file headers, payloads and data descriptors
//! to a byte-counted sink and writes the central directory on
//! [`finish`](ZipWriter::finish). Two creation paths exist: [`create`]
//! compresses a payload through the registered codec for the entry's method,
//! while [`create_raw`] takes pre-computed sizes and checksum and copies
//! already-compressed bytes verbatim. The raw path deliberately derives
//! nothing: flags, DOS stamps and extra fields are the caller's to supply.
//!
//! [`create`]: ZipWriter::create
//! [`create_raw`]: ZipWriter::create_raw

use crate::errors::{Error, Result};
use crate::mode::{EntryMode, CREATOR_UNIX};
use crate::path::ZipFilePath;
use crate::reader::{
    CENTRAL_HEADER_SIGNATURE, DATA_DESCRIPTOR_SIGNATURE, END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE,
    END_OF_CENTRAL_DIR_SIGNATURE, END_OF_CENTRAL_DIR_SIGNATURE64, LOCAL_FILE_HEADER_SIGNATURE,
};
use crate::extra;
use crate::register::{CodecRegistry, METHOD_STORE};
use crate::time::{DosDateTime, UtcDateTime};
use std::io::{self, Read, Write};
use std::sync::Arc;

// ZIP64 constants
const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;
const ZIP64_VERSION_NEEDED: u16 = 45; // 4.5
const ZIP64_EOCD_SIZE: usize = 56;

// General purpose bit flags
pub(crate) const FLAG_DATA_DESCRIPTOR: u16 = 0x08; // bit 3: data descriptor present
pub(crate) const FLAG_UTF8_ENCODING: u16 = 0x800; // bit 11: UTF-8 encoding flag (EFS)

// ZIP64 thresholds - when to switch to ZIP64 format
const ZIP64_THRESHOLD_FILE_SIZE: u64 = u32::MAX as u64;
const ZIP64_THRESHOLD_OFFSET: u64 = u32::MAX as u64;
const ZIP64_THRESHOLD_ENTRIES: usize = u16::MAX as usize;

#[derive(Debug)]
struct CountWriter<W> {
    writer: W,
    count: u64,
}

impl<W> CountWriter<W> {
    fn new(writer: W, count: u64) -> Self {
        CountWriter { writer, count }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.count += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Describes an entry for the convenience creation path.
///
/// The writer derives flags, DOS stamps and the extended-timestamp, NTFS and
/// Info-ZIP New Unix extra fields from these values.
#[derive(Debug, Clone)]
pub struct EntryHeader<'a> {
    /// Normalised name with forward slashes; directories end with `/`.
    pub name: &'a str,
    /// Compression method id. Ignored for directories, which always store.
    pub method: u16,
    /// Modification time; omitted entirely when `None`.
    pub modified: Option<UtcDateTime>,
    /// File mode recorded in the central directory external attributes.
    pub mode: EntryMode,
    /// Ownership for the Info-ZIP New Unix extra field.
    pub unix_ids: Option<(u32, u32)>,
}

/// Describes an entry whose payload is already compressed.
///
/// Everything the convenience path derives is taken verbatim here.
#[derive(Debug, Clone)]
pub struct RawEntryHeader<'a> {
    pub name: &'a str,
    pub method: u16,
    pub flags: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub extra: &'a [u8],
    pub mode: EntryMode,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

/// Totals for an entry written through [`ZipWriter::create`].
#[derive(Debug, Clone, Copy)]
pub struct EntryCounts {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

/// Appends zip entries to a writer.
pub struct ZipWriter<W> {
    sink: CountWriter<W>,
    records: Vec<CentralRecord>,
    registry: Arc<CodecRegistry>,
}

impl<W: Write> ZipWriter<W> {
    /// Creates a writer with the default codecs, starting at offset zero.
    pub fn new(writer: W) -> Self {
        Self::with_registry(writer, Arc::new(CodecRegistry::with_defaults()), 0)
    }

    /// Creates a writer that assumes `offset` bytes already precede the
    /// archive in `writer`. Useful for self-extracting preambles or appending
    /// an archive to an existing file.
    pub fn at_offset(writer: W, offset: u64) -> Self {
        Self::with_registry(writer, Arc::new(CodecRegistry::with_defaults()), offset)
    }

    pub(crate) fn with_registry(writer: W, registry: Arc<CodecRegistry>, offset: u64) -> Self {
        ZipWriter {
            sink: CountWriter::new(writer, offset),
            records: Vec::new(),
            registry,
        }
    }

    /// Total bytes emitted, including any starting offset.
    pub fn offset(&self) -> u64 {
        self.sink.count()
    }

    /// Writes a directory entry. The name must end with `/`.
    pub fn create_directory(&mut self, header: &EntryHeader) -> Result<()> {
        let path = ZipFilePath::from_str(header.name);
        if !path.is_dir() {
            return Err(Error::InvalidEntryName("directory names must end with /"));
        }
        if path.len() > u16::MAX as usize {
            return Err(Error::NameTooLong);
        }

        let mut flags = 0u16;
        if path.needs_utf8_encoding() {
            flags |= FLAG_UTF8_ENCODING;
        }

        let (dos_time, dos_date) = dos_stamp(header.modified.as_ref());
        let extra = extra::build(header.modified.as_ref(), header.unix_ids);
        let local_header_offset = self.sink.count();
        self.write_local_header(path.as_ref(), flags, METHOD_STORE, dos_time, dos_date, &extra)?;

        self.records.push(CentralRecord {
            name: path.into_string(),
            flags,
            method: METHOD_STORE,
            dos_time,
            dos_date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            local_header_offset,
            extra,
            mode: header.mode,
        });

        Ok(())
    }

    /// Writes a file or symlink entry, compressing `src` through the codec
    /// registered for the header's method.
    pub fn create(&mut self, header: &EntryHeader, src: &mut dyn Read) -> Result<EntryCounts> {
        let path = ZipFilePath::from_str(header.name);
        if path.is_dir() {
            return Err(Error::InvalidEntryName("directory entries carry no data"));
        }
        if path.len() > u16::MAX as usize {
            return Err(Error::NameTooLong);
        }

        let mut flags = FLAG_DATA_DESCRIPTOR;
        if path.needs_utf8_encoding() {
            flags |= FLAG_UTF8_ENCODING;
        }

        let compressor = self.registry.require_compressor(header.method)?;
        let (dos_time, dos_date) = dos_stamp(header.modified.as_ref());
        let extra = extra::build(header.modified.as_ref(), header.unix_ids);
        let local_header_offset = self.sink.count();
        self.write_local_header(path.as_ref(), flags, header.method, dos_time, dos_date, &extra)?;

        let payload_start = self.sink.count();
        let mut crc = crc32fast::Hasher::new();
        let mut uncompressed_size = 0u64;
        {
            let mut encoder = compressor.encoder(Box::new(&mut self.sink))?;
            let mut buf = [0u8; 32 * 1024];
            loop {
                let read = src.read(&mut buf).map_err(Error::Io)?;
                if read == 0 {
                    break;
                }
                crc.update(&buf[..read]);
                uncompressed_size += read as u64;
                encoder.write_all(&buf[..read]).map_err(Error::Io)?;
            }
            encoder.finish().map_err(Error::Io)?;
        }

        let counts = EntryCounts {
            crc32: crc.finalize(),
            compressed_size: self.sink.count() - payload_start,
            uncompressed_size,
        };

        self.write_data_descriptor(counts.crc32, counts.compressed_size, counts.uncompressed_size)?;

        self.records.push(CentralRecord {
            name: path.into_string(),
            flags,
            method: header.method,
            dos_time,
            dos_date,
            crc32: counts.crc32,
            compressed_size: counts.compressed_size,
            uncompressed_size: counts.uncompressed_size,
            local_header_offset,
            extra,
            mode: header.mode,
        });

        Ok(counts)
    }

    /// Starts a raw entry. The returned writer accepts the already-compressed
    /// payload; [`RawEntryWriter::finish`] validates the byte count, writes
    /// the data descriptor and files the central directory record.
    pub fn create_raw<'a>(&'a mut self, header: &RawEntryHeader) -> Result<RawEntryWriter<'a, W>> {
        let path = ZipFilePath::from_str(header.name);
        if path.is_dir() {
            return Err(Error::InvalidEntryName("directory entries carry no data"));
        }
        if path.len() > u16::MAX as usize {
            return Err(Error::NameTooLong);
        }

        let local_header_offset = self.sink.count();
        self.write_local_header(
            path.as_ref(),
            header.flags,
            header.method,
            header.dos_time,
            header.dos_date,
            header.extra,
        )?;

        Ok(RawEntryWriter {
            record: CentralRecord {
                name: path.into_string(),
                flags: header.flags,
                method: header.method,
                dos_time: header.dos_time,
                dos_date: header.dos_date,
                crc32: header.crc32,
                compressed_size: header.compressed_size,
                uncompressed_size: header.uncompressed_size,
                local_header_offset,
                extra: header.extra.to_vec(),
                mode: header.mode,
            },
            written: 0,
            archive: self,
        })
    }

    /// Writes a local file header. CRC and sizes are always zero here: data
    /// entries carry a descriptor, and directories have no payload.
    fn write_local_header(
        &mut self,
        name: &str,
        flags: u16,
        method: u16,
        dos_time: u16,
        dos_date: u16,
        extra: &[u8],
    ) -> Result<()> {
        let w = &mut self.sink;
        w.write_all(&LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes())?;
        w.write_all(&20u16.to_le_bytes())?; // version needed
        w.write_all(&flags.to_le_bytes())?;
        w.write_all(&method.to_le_bytes())?;
        w.write_all(&dos_time.to_le_bytes())?;
        w.write_all(&dos_date.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?; // crc-32
        w.write_all(&0u32.to_le_bytes())?; // compressed size
        w.write_all(&0u32.to_le_bytes())?; // uncompressed size
        w.write_all(&(name.len() as u16).to_le_bytes())?;
        w.write_all(&(extra.len() as u16).to_le_bytes())?;
        w.write_all(name.as_bytes())?;
        w.write_all(extra)?;
        Ok(())
    }

    fn write_data_descriptor(
        &mut self,
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Result<()> {
        let w = &mut self.sink;
        w.write_all(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes())?;
        w.write_all(&crc32.to_le_bytes())?;

        if compressed_size >= ZIP64_THRESHOLD_FILE_SIZE
            || uncompressed_size >= ZIP64_THRESHOLD_FILE_SIZE
        {
            w.write_all(&compressed_size.to_le_bytes())?;
            w.write_all(&uncompressed_size.to_le_bytes())?;
        } else {
            w.write_all(&(compressed_size as u32).to_le_bytes())?;
            w.write_all(&(uncompressed_size as u32).to_le_bytes())?;
        }

        Ok(())
    }

    /// Finishes the archive: writes the central directory, the zip64 records
    /// when any threshold is exceeded, and the end of central directory
    /// record. Returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        let central_directory_offset = self.sink.count();
        let total_entries = self.records.len();

        let needs_zip64 = total_entries >= ZIP64_THRESHOLD_ENTRIES
            || central_directory_offset >= ZIP64_THRESHOLD_OFFSET
            || self.records.iter().any(|r| r.needs_zip64());

        for record in &self.records {
            let w = &mut self.sink;
            w.write_all(&CENTRAL_HEADER_SIGNATURE.to_le_bytes())?;

            let version_needed = if record.needs_zip64() {
                ZIP64_VERSION_NEEDED
            } else {
                20
            };
            let version_made_by = (CREATOR_UNIX << 8) | version_needed;
            w.write_all(&version_made_by.to_le_bytes())?;
            w.write_all(&version_needed.to_le_bytes())?;

            w.write_all(&record.flags.to_le_bytes())?;
            w.write_all(&record.method.to_le_bytes())?;
            w.write_all(&record.dos_time.to_le_bytes())?;
            w.write_all(&record.dos_date.to_le_bytes())?;
            w.write_all(&record.crc32.to_le_bytes())?;

            // Sizes and offsets: sentinel values when zip64 takes over.
            let compressed = record.compressed_size.min(ZIP64_THRESHOLD_FILE_SIZE) as u32;
            w.write_all(&compressed.to_le_bytes())?;
            let uncompressed = record.uncompressed_size.min(ZIP64_THRESHOLD_FILE_SIZE) as u32;
            w.write_all(&uncompressed.to_le_bytes())?;

            w.write_all(&(record.name.len() as u16).to_le_bytes())?;

            let extra_len = record.zip64_extra_field_size() + record.extra.len() as u16;
            w.write_all(&extra_len.to_le_bytes())?;

            w.write_all(&0u16.to_le_bytes())?; // comment length
            w.write_all(&[0u8; 4])?; // disk number start, internal attributes
            w.write_all(&record.mode.external_attrs().to_le_bytes())?;

            let offset = record.local_header_offset.min(ZIP64_THRESHOLD_OFFSET) as u32;
            w.write_all(&offset.to_le_bytes())?;

            w.write_all(record.name.as_bytes())?;
            record.write_zip64_extra_field(w)?;
            w.write_all(&record.extra)?;
        }

        let central_directory_end = self.sink.count();
        let central_directory_size = central_directory_end - central_directory_offset;

        if needs_zip64 {
            let zip64_eocd_offset = self.sink.count();
            self.write_zip64_eocd(
                total_entries as u64,
                central_directory_size,
                central_directory_offset,
            )?;
            self.write_zip64_eocd_locator(zip64_eocd_offset)?;
        }

        let w = &mut self.sink;
        w.write_all(&END_OF_CENTRAL_DIR_SIGNATURE.to_le_bytes())?;
        w.write_all(&[0u8; 4])?; // disk numbers

        let entries_count = total_entries.min(ZIP64_THRESHOLD_ENTRIES) as u16;
        w.write_all(&entries_count.to_le_bytes())?;
        w.write_all(&entries_count.to_le_bytes())?;

        let cd_size = central_directory_size.min(ZIP64_THRESHOLD_OFFSET) as u32;
        w.write_all(&cd_size.to_le_bytes())?;
        let cd_offset = central_directory_offset.min(ZIP64_THRESHOLD_OFFSET) as u32;
        w.write_all(&cd_offset.to_le_bytes())?;

        w.write_all(&0u16.to_le_bytes())?; // comment length
        w.flush()?;

        Ok(self.sink.writer)
    }

    fn write_zip64_eocd(
        &mut self,
        total_entries: u64,
        central_directory_size: u64,
        central_directory_offset: u64,
    ) -> Result<()> {
        let w = &mut self.sink;
        w.write_all(&END_OF_CENTRAL_DIR_SIGNATURE64.to_le_bytes())?;
        w.write_all(&((ZIP64_EOCD_SIZE - 12) as u64).to_le_bytes())?; // size of remaining record
        w.write_all(&ZIP64_VERSION_NEEDED.to_le_bytes())?; // version made by
        w.write_all(&ZIP64_VERSION_NEEDED.to_le_bytes())?; // version needed
        w.write_all(&0u32.to_le_bytes())?; // disk number
        w.write_all(&0u32.to_le_bytes())?; // central directory disk
        w.write_all(&total_entries.to_le_bytes())?; // entries on this disk
        w.write_all(&total_entries.to_le_bytes())?; // total entries
        w.write_all(&central_directory_size.to_le_bytes())?;
        w.write_all(&central_directory_offset.to_le_bytes())?;
        Ok(())
    }

    fn write_zip64_eocd_locator(&mut self, zip64_eocd_offset: u64) -> Result<()> {
        let w = &mut self.sink;
        w.write_all(&END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?; // disk with the zip64 eocd
        w.write_all(&zip64_eocd_offset.to_le_bytes())?;
        w.write_all(&1u32.to_le_bytes())?; // total disks
        Ok(())
    }
}

/// Writer for the already-compressed payload of a raw entry.
pub struct RawEntryWriter<'a, W> {
    archive: &'a mut ZipWriter<W>,
    record: CentralRecord,
    written: u64,
}

impl<W: Write> RawEntryWriter<'_, W> {
    /// Completes the entry, verifying the payload length against the
    /// pre-computed compressed size.
    pub fn finish(self) -> Result<()> {
        if self.written != self.record.compressed_size {
            return Err(Error::InvalidSize {
                expected: self.record.compressed_size,
                actual: self.written,
            });
        }

        self.archive.write_data_descriptor(
            self.record.crc32,
            self.record.compressed_size,
            self.record.uncompressed_size,
        )?;
        self.archive.records.push(self.record);
        Ok(())
    }
}

impl<W: Write> Write for RawEntryWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.archive.sink.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.archive.sink.flush()
    }
}

fn dos_stamp(modified: Option<&UtcDateTime>) -> (u16, u16) {
    modified
        .map(|dt| DosDateTime::from(dt).into_parts())
        .unwrap_or((0, 0))
}

#[derive(Debug)]
struct CentralRecord {
    name: String,
    flags: u16,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
    extra: Vec<u8>,
    mode: EntryMode,
}

impl CentralRecord {
    fn needs_zip64(&self) -> bool {
        self.compressed_size >= ZIP64_THRESHOLD_FILE_SIZE
            || self.uncompressed_size >= ZIP64_THRESHOLD_FILE_SIZE
            || self.local_header_offset >= ZIP64_THRESHOLD_OFFSET
    }

    /// Writes the zip64 extended information extra field for this record.
    fn write_zip64_extra_field<W: Write>(&self, writer: &mut W) -> Result<()> {
        if !self.needs_zip64() {
            return Ok(());
        }

        writer.write_all(&ZIP64_EXTRA_FIELD_ID.to_le_bytes())?;
        writer.write_all(&(self.zip64_extra_field_size() - 4).to_le_bytes())?;

        // Fields appear in spec order, only when their 32-bit form overflows.
        if self.uncompressed_size >= ZIP64_THRESHOLD_FILE_SIZE {
            writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        }
        if self.compressed_size >= ZIP64_THRESHOLD_FILE_SIZE {
            writer.write_all(&self.compressed_size.to_le_bytes())?;
        }
        if self.local_header_offset >= ZIP64_THRESHOLD_OFFSET {
            writer.write_all(&self.local_header_offset.to_le_bytes())?;
        }

        Ok(())
    }

    fn zip64_extra_field_size(&self) -> u16 {
        if !self.needs_zip64() {
            return 0;
        }

        let mut size = 4u16; // header (id + size)
        if self.uncompressed_size >= ZIP64_THRESHOLD_FILE_SIZE {
            size += 8;
        }
        if self.compressed_size >= ZIP64_THRESHOLD_FILE_SIZE {
            size += 8;
        }
        if self.local_header_offset >= ZIP64_THRESHOLD_OFFSET {
            size += 8;
        }
        size
    }
}
