//! Little-endian decoding of fixed-width zip record fields.
//!
//! Callers are expected to have bounds-checked the record first; these
//! helpers only read the leading bytes of the slice they are given.

pub(crate) fn le_u16(data: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&data[..2]);
    u16::from_le_bytes(raw)
}

pub(crate) fn le_u32(data: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[..4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn le_u64(data: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[..8]);
    u64::from_le_bytes(raw)
}
