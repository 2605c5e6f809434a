//! Utility functions for binary fields, string conversion and name ordering.

use crate::error::{RegistryError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;
use std::cmp::Ordering;
use std::io::Cursor;

/// File offset where the hive data region (the first bin) starts.
pub const BIN_START: u64 = 0x1000;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Reads a Latin-1 string from a byte slice, trimming null terminators.
///
/// Compressed key and value names store one byte per character.
pub fn read_latin1_string(data: &[u8]) -> String {
    data.iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
///
/// # Errors
///
/// Returns an error if the data length is odd or the UTF-16 decoding fails.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);

    if had_errors {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Encodes a string as UTF-16LE bytes (no terminator).
pub fn encode_utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

/// Encodes a key or value name for storage.
///
/// Returns the bytes and whether the compressed (Latin-1) form was used.
/// Names containing characters above U+00FF fall back to UTF-16LE.
pub fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if name.chars().all(|c| (c as u32) <= 0xFF) {
        (name.chars().map(|c| c as u8).collect(), true)
    } else {
        (encode_utf16(name), false)
    }
}

/// Decodes a stored key or value name.
pub fn decode_name(data: &[u8], compressed: bool, offset: u32) -> Result<String> {
    if compressed {
        Ok(read_latin1_string(data))
    } else {
        read_utf16_string(data, offset)
    }
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 8]);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

/// Writes a u16 at the given offset. The buffer must be large enough.
#[inline]
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut data[offset..offset + 2], value);
}

/// Writes a u32 at the given offset. The buffer must be large enough.
#[inline]
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..offset + 4], value);
}

/// Writes an i32 at the given offset. The buffer must be large enough.
#[inline]
pub fn write_i32_le(data: &mut [u8], offset: usize, value: i32) {
    LittleEndian::write_i32(&mut data[offset..offset + 4], value);
}

/// Writes a u64 at the given offset. The buffer must be large enough.
#[inline]
pub fn write_u64_le(data: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut data[offset..offset + 8], value);
}

/// Calculates XOR checksum for the first 508 bytes of the hive header.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;

    // XOR all DWORDs except the checksum field itself (at offset 0x1FC)
    for i in (0..0x1FC).step_by(4) {
        if let Ok(dword) = read_u32_le(data, i) {
            checksum ^= dword;
        }
    }

    checksum
}

/// Converts a cell index (offset within the data region) to a file offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidFormat` for negative indices.
#[inline]
pub fn cell_index_to_file_offset(index: i32) -> Result<u64> {
    if index < 0 {
        return Err(RegistryError::InvalidFormat(format!(
            "Cell index {:#x} is negative",
            index
        )));
    }
    Ok(BIN_START + index as u64)
}

/// Rounds `value` up to the next multiple of `multiple`.
#[inline]
pub fn round_up(value: usize, multiple: usize) -> usize {
    ((value + multiple - 1) / multiple) * multiple
}

/// Upcases a single character, keeping it unchanged when the uppercase form
/// is not a single character.
#[inline]
pub fn upcase(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}

/// Compares two names case-insensitively, character by character.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars().map(upcase).cmp(b.chars().map(upcase))
}

/// Returns true if two names are equal ignoring case.
pub fn names_equal(a: &str, b: &str) -> bool {
    compare_names(a, b) == Ordering::Equal
}

/// Current time as a Windows FILETIME.
pub fn filetime_now() -> u64 {
    datetime_to_filetime(Utc::now())
}

/// Converts a Windows FILETIME (100ns intervals since 1601) to UTC.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;

    DateTime::from_timestamp(seconds, nanos)
}

/// Converts a UTC timestamp to a Windows FILETIME, clamping pre-1601 dates to 0.
pub fn datetime_to_filetime(datetime: DateTime<Utc>) -> u64 {
    let seconds = datetime.timestamp() + FILETIME_UNIX_DIFF;
    if seconds < 0 {
        return 0;
    }
    seconds as u64 * 10_000_000 + u64::from(datetime.timestamp_subsec_nanos() / 100)
}
