//! Encoding and decoding of the extra fields fastzip cares about: the
//! extended timestamp (0x5455), the NTFS timestamp (0x000a) and the Info-ZIP
//! New Unix field (0x7875) carrying uid/gid.

use crate::errors::{Error, Result};
use crate::time::{DosDateTime, UtcDateTime, NTFS_EPOCH_OFFSET};
use crate::utils::{le_u16, le_u32, le_u64};

pub(crate) const EXTENDED_TIMESTAMP_ID: u16 = 0x5455; // "UT"
pub(crate) const UNIX_TIMESTAMP_ID: u16 = 0x5855; // "UX" - obsolete
pub(crate) const NTFS_TIMESTAMP_ID: u16 = 0x000a;
pub(crate) const INFOZIP_UNIX_NEW_ID: u16 = 0x7875; // "ux"

/// Iterates `(id, data)` records in an extra field blob. A truncated
/// trailing record ends iteration.
pub(crate) fn fields(extra: &[u8]) -> ExtraFields<'_> {
    ExtraFields { extra, pos: 0 }
}

pub(crate) struct ExtraFields<'a> {
    extra: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ExtraFields<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<(u16, &'a [u8])> {
        if self.pos + 4 > self.extra.len() {
            return None;
        }

        let id = le_u16(&self.extra[self.pos..]);
        let size = le_u16(&self.extra[self.pos + 2..]) as usize;
        self.pos += 4;

        if self.pos + size > self.extra.len() {
            self.pos = self.extra.len();
            return None;
        }

        let data = &self.extra[self.pos..self.pos + size];
        self.pos += size;
        Some((id, data))
    }
}

/// Extracts the modification time using a "last field wins" strategy over
/// the known timestamp fields, falling back to the MS-DOS stamp. This
/// matches Go's zip reader behavior.
pub(crate) fn best_timestamp(extra: &[u8], dos: DosDateTime) -> UtcDateTime {
    let mut last = None;

    for (id, data) in fields(extra) {
        let parsed = match id {
            EXTENDED_TIMESTAMP_ID => parse_extended_timestamp(data),
            NTFS_TIMESTAMP_ID => parse_ntfs_timestamp(data),
            UNIX_TIMESTAMP_ID => parse_unix_timestamp(data),
            _ => None,
        };
        if parsed.is_some() {
            last = parsed;
        }
    }

    last.unwrap_or_else(|| UtcDateTime::from_dos(dos))
}

/// Parses an extended timestamp field: flags byte then, when bit 0 is set,
/// a u32 Unix modification time.
pub(crate) fn parse_extended_timestamp(data: &[u8]) -> Option<UtcDateTime> {
    if data.len() < 5 {
        return None;
    }

    if data[0] & 0x01 != 0 {
        return Some(UtcDateTime::from_unix(le_u32(&data[1..5])));
    }

    None
}

/// Parses an NTFS timestamp field: 4 reserved bytes, then attribute records
/// of which tag 0x0001 carries modification/access/creation times as 100ns
/// ticks since 1601.
pub(crate) fn parse_ntfs_timestamp(data: &[u8]) -> Option<UtcDateTime> {
    if data.len() < 32 {
        return None;
    }

    let tag = le_u16(&data[4..6]);
    if tag != 0x0001 {
        return None;
    }

    let size = le_u16(&data[6..8]) as usize;
    if size < 24 || data.len() < 8 + size {
        return None;
    }

    Some(UtcDateTime::from_ntfs(le_u64(&data[8..16])))
}

/// Parses the obsolete unix timestamp field: access time then modification
/// time, both u32.
pub(crate) fn parse_unix_timestamp(data: &[u8]) -> Option<UtcDateTime> {
    if data.len() < 8 {
        return None;
    }

    Some(UtcDateTime::from_unix(le_u32(&data[4..8])))
}

/// Parses an Info-ZIP New Unix field into `(uid, gid)` if one is present.
///
/// The field is version 1 followed by two little-endian variable-width
/// integers, each preceded by its byte width.
pub(crate) fn unix_ids(extra: &[u8]) -> Result<Option<(u32, u32)>> {
    for (id, data) in fields(extra) {
        if id != INFOZIP_UNIX_NEW_ID {
            continue;
        }

        if data.is_empty() {
            return Err(Error::InvalidExtraField("unix field empty"));
        }
        if data[0] != 1 {
            return Err(Error::InvalidExtraField("unsupported unix field version"));
        }

        let (uid, rest) = parse_varwidth_int(&data[1..])?;
        let (gid, rest) = parse_varwidth_int(rest)?;
        if !rest.is_empty() {
            return Err(Error::InvalidExtraField("trailing unix field bytes"));
        }

        return Ok(Some((uid, gid)));
    }

    Ok(None)
}

fn parse_varwidth_int(data: &[u8]) -> Result<(u32, &[u8])> {
    let Some((&width, rest)) = data.split_first() else {
        return Err(Error::InvalidExtraField("unix field truncated"));
    };

    let width = width as usize;
    if width == 0 || width > 8 || rest.len() < width {
        return Err(Error::InvalidExtraField("unix field id width"));
    }

    let mut value: u64 = 0;
    for (i, &b) in rest[..width].iter().enumerate() {
        value |= (b as u64) << (8 * i);
    }

    let value = u32::try_from(value).map_err(|_| Error::InvalidExtraField("unix id too large"))?;
    Ok((value, &rest[width..]))
}

/// Builds the standard per-entry extra blob: extended timestamp, NTFS
/// timestamp and, when ownership is known, the Info-ZIP New Unix field.
pub(crate) fn build(modified: Option<&UtcDateTime>, unix_ids: Option<(u32, u32)>) -> Vec<u8> {
    let mut extra = Vec::new();
    if let Some(modified) = modified {
        encode_extended_timestamp(&mut extra, modified);
        encode_ntfs_timestamp(&mut extra, modified);
    }
    if let Some((uid, gid)) = unix_ids {
        encode_unix_ids(&mut extra, uid, gid);
    }
    extra
}

pub(crate) fn encode_extended_timestamp(extra: &mut Vec<u8>, modified: &UtcDateTime) {
    let unix_time = modified.to_unix().clamp(0, u32::MAX as i64) as u32;
    extra.extend_from_slice(&EXTENDED_TIMESTAMP_ID.to_le_bytes());
    extra.extend_from_slice(&5u16.to_le_bytes()); // 1 byte flags + 4 bytes timestamp
    extra.push(1); // flags: modification time present
    extra.extend_from_slice(&unix_time.to_le_bytes());
}

pub(crate) fn encode_ntfs_timestamp(extra: &mut Vec<u8>, modified: &UtcDateTime) {
    let seconds = modified.to_unix().max(0) as u64 + NTFS_EPOCH_OFFSET;
    let ticks = seconds * 10_000_000 + (modified.nanosecond() / 100) as u64;

    extra.extend_from_slice(&NTFS_TIMESTAMP_ID.to_le_bytes());
    extra.extend_from_slice(&32u16.to_le_bytes());
    extra.extend_from_slice(&0u32.to_le_bytes()); // reserved
    extra.extend_from_slice(&0x0001u16.to_le_bytes()); // attribute tag
    extra.extend_from_slice(&24u16.to_le_bytes()); // attribute size
    extra.extend_from_slice(&ticks.to_le_bytes()); // modification time
    extra.extend_from_slice(&ticks.to_le_bytes()); // access time
    extra.extend_from_slice(&ticks.to_le_bytes()); // creation time
}

pub(crate) fn encode_unix_ids(extra: &mut Vec<u8>, uid: u32, gid: u32) {
    extra.extend_from_slice(&INFOZIP_UNIX_NEW_ID.to_le_bytes());
    extra.extend_from_slice(&11u16.to_le_bytes()); // version + 2 x (width + u32)
    extra.push(1); // field version
    extra.push(4);
    extra.extend_from_slice(&uid.to_le_bytes());
    extra.push(4);
    extra.extend_from_slice(&gid.to_le_bytes());
}
