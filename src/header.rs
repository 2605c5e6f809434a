//! Hive header parsing and serialization.
//!
//! The header occupies the first 512 bytes of a hive file. The remainder of
//! the first 4 KiB is padding; bins start at file offset 0x1000. The header
//! records the root key cell, the length of the data region and two
//! sequence counters that must agree for the hive to be consistent.

use crate::error::{RegistryError, Result};
use crate::utils::{
    calculate_checksum, encode_utf16, filetime_now, filetime_to_datetime, read_i32_le,
    read_u32_le, read_u64_le, read_utf16_string, write_i32_le, write_u32_le, write_u64_le,
};
use std::fmt;
use uuid::Uuid;

/// Size of the serialized header in bytes.
pub const HEADER_SIZE: usize = 512;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the embedded hive path.
const PATH_OFFSET: usize = 0x30;

/// Length of the embedded hive path field in bytes (32 UTF-16 units).
const PATH_LENGTH: usize = 0x40;

const GUID1_OFFSET: usize = 0x70;
const GUID2_OFFSET: usize = 0x94;

/// Offset of the checksum field.
const CHECKSUM_OFFSET: usize = 0x1FC;

/// Hive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiveHeader {
    /// Primary sequence number.
    pub sequence1: u32,

    /// Secondary sequence number.
    pub sequence2: u32,

    /// Last written timestamp (Windows FILETIME).
    pub timestamp: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = primary hive).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Index of the root key cell.
    pub root_cell: i32,

    /// Length of the data region in bytes (sum of all bin sizes).
    pub length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// Embedded hive path.
    pub path: String,

    /// First header GUID.
    pub guid1: Uuid,

    /// Second header GUID.
    pub guid2: Uuid,

    /// XOR checksum of the first 508 bytes.
    pub checksum: u32,
}

impl HiveHeader {
    /// Creates a header for a fresh, empty hive.
    pub fn new(path: &str) -> Self {
        Self {
            sequence1: 1,
            sequence2: 1,
            timestamp: filetime_now(),
            major_version: 1,
            minor_version: 3,
            file_type: 0,
            file_format: 1,
            root_cell: -1,
            length: 0,
            clustering_factor: 1,
            path: path.to_string(),
            guid1: Uuid::new_v4(),
            guid2: Uuid::new_v4(),
            checksum: 0,
        }
    }

    /// Parses a header from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Sequence counters differ (log replay would be required)
    /// - Checksum doesn't match
    /// - Version is unsupported
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: HEADER_SIZE,
            });
        }

        if &data[0..4] != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &data[0..4]));
        }

        let sequence1 = read_u32_le(data, 0x04)?;
        let sequence2 = read_u32_le(data, 0x08)?;
        if sequence1 != sequence2 {
            return Err(RegistryError::SequenceMismatch {
                primary: sequence1,
                secondary: sequence2,
            });
        }

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;
        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(RegistryError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        if major_version != 1 || !(3..=6).contains(&minor_version) {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        let path = read_utf16_string(
            &data[PATH_OFFSET..PATH_OFFSET + PATH_LENGTH],
            PATH_OFFSET as u32,
        )?;

        Ok(HiveHeader {
            sequence1,
            sequence2,
            timestamp: read_u64_le(data, 0x0C)?,
            major_version,
            minor_version,
            file_type: read_u32_le(data, 0x1C)?,
            file_format: read_u32_le(data, 0x20)?,
            root_cell: read_i32_le(data, 0x24)?,
            length: read_u32_le(data, 0x28)?,
            clustering_factor: read_u32_le(data, 0x2C)?,
            path,
            guid1: read_guid(data, GUID1_OFFSET),
            guid2: read_guid(data, GUID2_OFFSET),
            checksum,
        })
    }

    /// Serializes the header into `buffer`, recomputing the checksum.
    ///
    /// Bytes not covered by a known field are left untouched, so rewriting a
    /// header read from disk preserves whatever else was stored there.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::HiveTooSmall` if `buffer` is shorter than
    /// [`HEADER_SIZE`].
    pub fn write_to(&mut self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() < HEADER_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: buffer.len(),
                minimum: HEADER_SIZE,
            });
        }

        buffer[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(buffer, 0x04, self.sequence1);
        write_u32_le(buffer, 0x08, self.sequence2);
        write_u64_le(buffer, 0x0C, self.timestamp);
        write_u32_le(buffer, 0x14, self.major_version);
        write_u32_le(buffer, 0x18, self.minor_version);
        write_u32_le(buffer, 0x1C, self.file_type);
        write_u32_le(buffer, 0x20, self.file_format);
        write_i32_le(buffer, 0x24, self.root_cell);
        write_u32_le(buffer, 0x28, self.length);
        write_u32_le(buffer, 0x2C, self.clustering_factor);

        let path_field = &mut buffer[PATH_OFFSET..PATH_OFFSET + PATH_LENGTH];
        path_field.fill(0);
        let encoded = encode_utf16(&self.path);
        let len = encoded.len().min(PATH_LENGTH - 2);
        path_field[..len].copy_from_slice(&encoded[..len]);

        buffer[GUID1_OFFSET..GUID1_OFFSET + 16].copy_from_slice(&self.guid1.to_bytes_le());
        buffer[GUID2_OFFSET..GUID2_OFFSET + 16].copy_from_slice(&self.guid2.to_bytes_le());

        self.checksum = calculate_checksum(buffer);
        write_u32_le(buffer, CHECKSUM_OFFSET, self.checksum);

        Ok(())
    }

    /// Serializes the header into a fresh 512-byte buffer.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; HEADER_SIZE];
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when both sequence numbers match.
    pub fn is_consistent(&self) -> bool {
        self.sequence1 == self.sequence2
    }

    /// Marks the hive as modified: bumps both sequence counters and the
    /// timestamp.
    pub fn touch(&mut self) {
        self.sequence1 = self.sequence1.wrapping_add(1);
        self.sequence2 = self.sequence2.wrapping_add(1);
        self.timestamp = filetime_now();
    }

    /// Converts the last written timestamp to a UTC date.
    pub fn timestamp_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        filetime_to_datetime(self.timestamp)
    }
}

fn read_guid(data: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&data[offset..offset + 16]);
    Uuid::from_bytes_le(bytes)
}

impl fmt::Display for HiveHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Sequence: {}/{}\n\
             - Path: {}",
            self.major_version,
            self.minor_version,
            self.root_cell,
            self.length,
            self.sequence1,
            self.sequence2,
            self.path
        )
    }
}
