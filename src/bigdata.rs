//! Big data (db) records.
//!
//! Hives of format 1.4 and later store value payloads larger than 16,344
//! bytes as a `db` cell pointing at a list of segment cells. Each segment
//! holds up to [`BIG_DATA_SEGMENT_SIZE`] bytes of the payload.
//!
//! Format:
//! ```text
//! Offset  Size  Description
//! 0x00    2     Signature ("db")
//! 0x02    2     Number of segments
//! 0x04    4     Cell index of the segment list
//! ```

use crate::cell::{impl_cell_variant, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::hive::RegistryHive;
use crate::utils::{read_i32_le, read_u16_le, write_i32_le, write_u16_le};
use std::io::{Read, Seek, Write};
use tracing::debug;

/// Largest payload kept in a single data cell, and the size of each segment.
pub const BIG_DATA_SEGMENT_SIZE: usize = 16344;

/// First minor version whose hives use `db` records.
pub const BIG_DATA_MIN_MINOR_VERSION: u32 = 4;

/// Big data (db) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigDataCell {
    /// Cell index.
    pub index: i32,

    /// Number of data segments.
    pub segment_count: u16,

    /// Index of the segment list cell.
    pub segment_list: i32,
}

impl BigDataCell {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;

    /// Creates an unpersisted cell.
    pub fn new(segment_count: u16, segment_list: i32) -> Self {
        Self {
            index: NO_INDEX,
            segment_count,
            segment_list,
        }
    }

    /// Parses a big data block header from cell data.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: index as u32,
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"db" {
            return Err(RegistryError::invalid_signature(b"db", &data[0..2]));
        }

        Ok(BigDataCell {
            index,
            segment_count: read_u16_le(data, 0x02)?,
            segment_list: read_i32_le(data, 0x04)?,
        })
    }

    fn serialized_size(&self) -> usize {
        Self::MIN_SIZE
    }

    fn serialize(&self, buffer: &mut [u8]) {
        buffer[0..2].copy_from_slice(b"db");
        write_u16_le(buffer, 0x02, self.segment_count);
        write_i32_le(buffer, 0x04, self.segment_list);
    }
}

impl_cell_variant!(BigDataCell, BigData, "BigDataCell");

impl<S: Read + Write + Seek> RegistryHive<S> {
    /// Returns true if a payload of `length` bytes is stored as big data in
    /// this hive.
    pub fn uses_big_data(&self, length: usize) -> bool {
        length > BIG_DATA_SEGMENT_SIZE && self.header().minor_version >= BIG_DATA_MIN_MINOR_VERSION
    }

    /// Reads `length` bytes of payload through the `db` cell at `index`.
    pub fn read_big_data(&self, index: i32, length: usize) -> Result<Vec<u8>> {
        let db: BigDataCell = self.cell(index)?;
        let segments = self.big_data_segments(&db)?;

        let mut data = Vec::with_capacity(length);
        for segment in segments {
            if data.len() >= length {
                break;
            }
            let wanted = (length - data.len()).min(BIG_DATA_SEGMENT_SIZE);
            data.extend(self.raw_cell_data(segment, wanted)?);
        }

        if data.len() < length {
            return Err(RegistryError::TruncatedData {
                offset: index as u32,
                expected: length,
                actual: data.len(),
            });
        }

        Ok(data)
    }

    /// Stores `data` as segments behind a new `db` cell and returns its index.
    pub fn write_big_data(&mut self, data: &[u8]) -> Result<i32> {
        let chunks: Vec<&[u8]> = data.chunks(BIG_DATA_SEGMENT_SIZE).collect();
        let count = u16::try_from(chunks.len()).map_err(|_| {
            RegistryError::InvalidArgument(format!("Value of {} bytes is too large", data.len()))
        })?;

        let mut list = Vec::with_capacity(chunks.len() * 4);
        for chunk in chunks {
            let segment = self.allocate_raw_cell(chunk.len())?;
            self.write_raw_cell_data(segment, chunk)?;
            list.extend_from_slice(&segment.to_le_bytes());
        }

        let segment_list = self.allocate_raw_cell(list.len())?;
        self.write_raw_cell_data(segment_list, &list)?;

        let mut db = BigDataCell::new(count, segment_list);
        let index = self.update_cell(&mut db, true)?;

        debug!(
            index = format_args!("{:#x}", index),
            segments = count,
            bytes = data.len(),
            "Wrote big data"
        );
        Ok(index)
    }

    /// Frees a `db` cell together with its segment list and segments.
    pub fn free_big_data(&mut self, index: i32) -> Result<()> {
        let db: BigDataCell = self.cell(index)?;
        for segment in self.big_data_segments(&db)? {
            self.free_cell(segment)?;
        }
        self.free_cell(db.segment_list)?;
        self.free_cell(index)
    }

    /// Returns true if the cell at `index` carries the `db` tag.
    pub(crate) fn is_big_data_cell(&self, index: i32) -> Result<bool> {
        Ok(self.raw_cell_data(index, 2)? == b"db")
    }

    fn big_data_segments(&self, db: &BigDataCell) -> Result<Vec<i32>> {
        let count = db.segment_count as usize;
        let raw = self.raw_cell_data(db.segment_list, count * 4)?;
        if raw.len() < count * 4 {
            return Err(RegistryError::TruncatedData {
                offset: db.segment_list as u32,
                expected: count * 4,
                actual: raw.len(),
            });
        }
        (0..count).map(|i| read_i32_le(&raw, i * 4)).collect()
    }
}
