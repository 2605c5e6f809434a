//! Hive bins.
//!
//! A bin is a 4 KiB-aligned page of the hive's data region. It carries a
//! 32-byte header followed by a packed sequence of cell records; every record
//! starts with a signed 32-bit length (negative when allocated, positive when
//! free). [`Bin`] keeps a loaded copy of the page plus a sorted list of free
//! ranges and writes every change straight through to the backing stream.

use crate::cell::{Cell, CellRecord};
use crate::error::{RegistryError, Result};
use crate::utils::{cell_index_to_file_offset, filetime_now, read_i32_le, read_u32_le, read_u64_le, write_i32_le, write_u32_le, write_u64_le, BIN_START};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of a bin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Bins are always a multiple of this size.
pub const HBIN_ALIGNMENT: u32 = 0x1000;

/// Bin header structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinHeader {
    /// Offset of this bin within the data region (relative to 0x1000).
    pub offset: u32,

    /// Size of this bin in bytes (including header).
    pub size: u32,

    /// Timestamp (Windows FILETIME).
    pub timestamp: u64,
}

impl BinHeader {
    /// Creates a header for a new bin.
    pub fn new(offset: u32, size: u32) -> Self {
        Self {
            offset,
            size,
            timestamp: filetime_now(),
        }
    }

    /// Parses a bin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the bin header.
    /// * `expected_offset` - Offset the bin is being loaded from.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Offset doesn't match expected value
    /// - Size is zero or not a multiple of 4 KiB
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..4] != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &data[0..4]));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(RegistryError::InvalidFormat(format!(
                "Bin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        if size == 0 || size % HBIN_ALIGNMENT != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Bin at {:#x} has invalid size {:#x}",
                offset, size
            )));
        }

        Ok(BinHeader {
            offset,
            size,
            timestamp: read_u64_le(data, 0x14)?,
        })
    }

    /// Serializes the header into the first 32 bytes of `buffer`.
    pub fn write_to(&self, buffer: &mut [u8]) {
        buffer[0..4].copy_from_slice(HBIN_SIGNATURE);
        write_u32_le(buffer, 0x04, self.offset);
        write_u32_le(buffer, 0x08, self.size);
        buffer[0x0C..0x14].fill(0);
        write_u64_le(buffer, 0x14, self.timestamp);
        write_u32_le(buffer, 0x1C, 0);
    }

    /// Returns the size of the data area (excluding the header).
    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }
}

/// A span of bytes within a bin, relative to the start of the bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSpan {
    /// Offset of the record's length prefix from the start of the bin.
    pub offset: u32,
    /// Length of the record including its prefix.
    pub len: u32,
}

/// Iterator over the records within a bin.
pub struct RecordIterator<'a> {
    data: &'a [u8],
    offset: usize,
    bin_offset: u32,
}

impl<'a> RecordIterator<'a> {
    /// Creates a record iterator over a whole bin buffer (header included).
    pub fn new(data: &'a [u8], bin_offset: u32) -> Self {
        Self {
            data,
            offset: HBIN_HEADER_SIZE,
            bin_offset,
        }
    }
}

impl<'a> Iterator for RecordIterator<'a> {
    type Item = Result<RecordInfo<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let index = (self.bin_offset as usize + self.offset) as i32;
        let raw = match read_i32_le(self.data, self.offset) {
            Ok(raw) => raw,
            Err(e) => {
                self.offset = self.data.len();
                return Some(Err(e));
            }
        };

        let len = raw.unsigned_abs() as usize;
        if len == 0 || len % 8 != 0 || self.offset + len > self.data.len() {
            self.offset = self.data.len();
            return Some(Err(RegistryError::invalid_cell_size(raw, index)));
        }

        let info = RecordInfo {
            index,
            len: len as u32,
            is_allocated: raw < 0,
            data: &self.data[self.offset + 4..self.offset + len],
        };

        self.offset += len;
        Some(Ok(info))
    }
}

/// A single record found while walking a bin.
#[derive(Debug)]
pub struct RecordInfo<'a> {
    /// Cell index of the record.
    pub index: i32,

    /// Length of the record (including the length prefix).
    pub len: u32,

    /// Whether this record is allocated (true) or free (false).
    pub is_allocated: bool,

    /// Record payload (excluding the length prefix).
    pub data: &'a [u8],
}

/// One loaded bin.
#[derive(Debug, Clone)]
pub struct Bin {
    header: BinHeader,
    buffer: Vec<u8>,
    free_ranges: Vec<CellSpan>,
}

impl Bin {
    /// Reads and validates the bin at `offset` from a stream.
    ///
    /// `limit` is the number of data-region bytes left from `offset`; a bin
    /// claiming to be larger is rejected.
    pub fn read_from<R: Read + Seek + ?Sized>(stream: &mut R, offset: u32, limit: u32) -> Result<Self> {
        stream.seek(SeekFrom::Start(BIN_START + u64::from(offset)))?;

        let mut head = [0u8; HBIN_HEADER_SIZE];
        stream.read_exact(&mut head)?;
        let header = BinHeader::parse(&head, offset)?;

        if header.size > limit {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: header.size as usize,
                actual: limit as usize,
            });
        }

        let mut buffer = vec![0u8; header.size as usize];
        buffer[..HBIN_HEADER_SIZE].copy_from_slice(&head);
        stream.read_exact(&mut buffer[HBIN_HEADER_SIZE..])?;

        Self::from_buffer(buffer, offset)
    }

    /// Builds a bin from a complete in-memory copy of its page.
    ///
    /// Validates the header and every record length, and collects the free
    /// ranges (merging any that happen to be adjacent).
    pub fn from_buffer(buffer: Vec<u8>, offset: u32) -> Result<Self> {
        let header = BinHeader::parse(&buffer, offset)?;
        if buffer.len() != header.size as usize {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: header.size as usize,
                actual: buffer.len(),
            });
        }

        let mut free_ranges: Vec<CellSpan> = Vec::new();
        for record in RecordIterator::new(&buffer, offset) {
            let record = record?;
            if record.is_allocated {
                continue;
            }

            let rel = (record.index as u32) - offset;
            match free_ranges.last_mut() {
                Some(last) if last.offset + last.len == rel => last.len += record.len,
                _ => free_ranges.push(CellSpan {
                    offset: rel,
                    len: record.len,
                }),
            }
        }

        Ok(Self {
            header,
            buffer,
            free_ranges,
        })
    }

    /// Creates a new, entirely free bin and writes it to the stream.
    pub fn create<W: Write + Seek + ?Sized>(stream: &mut W, offset: u32, size: u32) -> Result<Self> {
        if size == 0 || size % HBIN_ALIGNMENT != 0 {
            return Err(RegistryError::InvalidArgument(format!(
                "Bin size {:#x} is not a multiple of {:#x}",
                size, HBIN_ALIGNMENT
            )));
        }

        let header = BinHeader::new(offset, size);
        let mut buffer = vec![0u8; size as usize];
        header.write_to(&mut buffer);

        let free_len = header.data_size();
        write_i32_le(&mut buffer, HBIN_HEADER_SIZE, free_len as i32);

        let bin = Self {
            header,
            buffer,
            free_ranges: vec![CellSpan {
                offset: HBIN_HEADER_SIZE as u32,
                len: free_len,
            }],
        };

        bin.persist(stream, 0, size as usize)?;
        debug!(offset = format_args!("{:#x}", offset), size, "Created bin");

        Ok(bin)
    }

    /// Returns the bin header.
    pub fn header(&self) -> &BinHeader {
        &self.header
    }

    /// Offset of the bin within the data region.
    pub fn offset(&self) -> u32 {
        self.header.offset
    }

    /// Size of the bin in bytes.
    pub fn size(&self) -> u32 {
        self.header.size
    }

    /// Returns true if `index` falls within this bin.
    pub fn contains(&self, index: i32) -> bool {
        index >= 0 && {
            let index = index as u32;
            index >= self.header.offset && index - self.header.offset < self.header.size
        }
    }

    /// Returns the free ranges, sorted by offset.
    pub fn free_ranges(&self) -> &[CellSpan] {
        &self.free_ranges
    }

    /// Total bytes held by free records.
    pub fn free_space(&self) -> u32 {
        self.free_ranges.iter().map(|r| r.len).sum()
    }

    /// Walks the bin and returns every allocated record.
    pub fn allocated_ranges(&self) -> Result<Vec<CellSpan>> {
        let mut ranges = Vec::new();
        for record in self.records() {
            let record = record?;
            if record.is_allocated {
                ranges.push(CellSpan {
                    offset: record.index as u32 - self.header.offset,
                    len: record.len,
                });
            }
        }
        Ok(ranges)
    }

    /// Iterates over every record in the bin.
    pub fn records(&self) -> RecordIterator<'_> {
        RecordIterator::new(&self.buffer, self.header.offset)
    }

    /// Reads the cell at `index`, or `None` if the record there is free.
    pub fn try_get_cell(&self, index: i32) -> Result<Option<Cell>> {
        let (rel, raw) = self.record_at(index)?;
        if raw > 0 || self.in_free_range(rel as u32) {
            return Ok(None);
        }

        let payload = &self.buffer[rel + 4..rel + raw.unsigned_abs() as usize];
        Cell::parse(payload, index).map(Some)
    }

    /// Allocates a record of exactly `size` bytes (length prefix included).
    ///
    /// Uses the first free range that is large enough, splitting it when it
    /// is bigger than needed. Returns `None` if no range fits.
    ///
    /// # Errors
    ///
    /// `size` must be a non-zero multiple of 8.
    pub fn allocate_cell<W: Write + Seek + ?Sized>(&mut self, size: usize, stream: &mut W) -> Result<Option<i32>> {
        if size < 8 || size % 8 != 0 {
            return Err(RegistryError::InvalidAllocationSize { size });
        }
        let size = size as u32;

        let Some(pos) = self.free_ranges.iter().position(|r| r.len >= size) else {
            return Ok(None);
        };

        let range = self.free_ranges[pos];
        let rel = range.offset as usize;
        write_i32_le(&mut self.buffer, rel, -(size as i32));
        self.persist(stream, rel, 4)?;

        if range.len > size {
            let rest = CellSpan {
                offset: range.offset + size,
                len: range.len - size,
            };
            write_i32_le(&mut self.buffer, rest.offset as usize, rest.len as i32);
            self.persist(stream, rest.offset as usize, 4)?;
            self.free_ranges[pos] = rest;
        } else {
            self.free_ranges.remove(pos);
        }

        Ok(Some((self.header.offset + range.offset) as i32))
    }

    /// Frees the record at `index`, merging it with free neighbours.
    pub fn free_cell<W: Write + Seek + ?Sized>(&mut self, index: i32, stream: &mut W) -> Result<()> {
        let (rel, raw) = self.record_at(index)?;
        if raw >= 0 || self.in_free_range(rel as u32) {
            return Err(RegistryError::CellAlreadyFree { index });
        }

        let mut start = rel as u32;
        let mut len = raw.unsigned_abs();

        let mut i = 0;
        while i < self.free_ranges.len() && self.free_ranges[i].offset < start {
            let prev = self.free_ranges[i];
            if prev.offset + prev.len == start {
                start = prev.offset;
                len += prev.len;
                self.free_ranges.remove(i);
            } else {
                i += 1;
            }
        }

        if i < self.free_ranges.len() && self.free_ranges[i].offset == start + len {
            len += self.free_ranges[i].len;
            self.free_ranges.remove(i);
        }

        self.free_ranges.insert(i, CellSpan { offset: start, len });

        write_i32_le(&mut self.buffer, start as usize, len as i32);
        self.persist(stream, start as usize, 4)
    }

    /// Rewrites a cell in place.
    ///
    /// Returns `false` (without touching anything) if the serialized cell no
    /// longer fits its allocation.
    pub fn update_cell<C: CellRecord, W: Write + Seek + ?Sized>(&mut self, cell: &C, stream: &mut W) -> Result<bool> {
        let (rel, raw) = self.record_at(cell.index())?;
        let allocated = raw.unsigned_abs() as usize;

        let needed = cell.size() + 4;
        if raw >= 0 || needed > allocated {
            return Ok(false);
        }

        cell.write_to(&mut self.buffer[rel + 4..rel + needed]);
        self.persist(stream, rel, needed)?;

        Ok(true)
    }

    /// Reads up to `max_bytes` of a record's payload.
    pub fn read_raw_cell_data(&self, index: i32, max_bytes: usize) -> Result<Vec<u8>> {
        let (rel, raw) = self.record_at(index)?;
        let available = raw.unsigned_abs() as usize - 4;
        let len = available.min(max_bytes);
        Ok(self.buffer[rel + 4..rel + 4 + len].to_vec())
    }

    /// Overwrites the start of a record's payload.
    ///
    /// Returns `false` if `data` does not fit the allocation.
    pub fn write_raw_cell_data<W: Write + Seek + ?Sized>(&mut self, index: i32, data: &[u8], stream: &mut W) -> Result<bool> {
        let (rel, raw) = self.record_at(index)?;
        let allocated = raw.unsigned_abs() as usize;

        let needed = data.len() + 4;
        if needed > allocated {
            return Ok(false);
        }

        self.buffer[rel + 4..rel + needed].copy_from_slice(data);
        self.persist(stream, rel, needed)?;

        Ok(true)
    }

    /// Resolves `index` to its offset in the buffer and its raw length prefix.
    fn record_at(&self, index: i32) -> Result<(usize, i32)> {
        if !self.contains(index) {
            return Err(RegistryError::NoOwningBin {
                index,
                hive_length: self.header.offset + self.header.size,
            });
        }

        let rel = (index as u32 - self.header.offset) as usize;
        if rel < HBIN_HEADER_SIZE {
            return Err(RegistryError::invalid_cell_size(0, index));
        }

        let raw = read_i32_le(&self.buffer, rel)?;
        let len = raw.unsigned_abs() as usize;
        if len < 8 || rel + len > self.buffer.len() {
            return Err(RegistryError::invalid_cell_size(raw, index));
        }

        Ok((rel, raw))
    }

    /// A record merged into a free neighbour keeps its stale length prefix.
    fn in_free_range(&self, rel: u32) -> bool {
        let pos = self.free_ranges.partition_point(|r| r.offset <= rel);
        pos > 0 && {
            let range = self.free_ranges[pos - 1];
            rel < range.offset + range.len
        }
    }

    fn persist<W: Write + Seek + ?Sized>(&self, stream: &mut W, start: usize, len: usize) -> Result<()> {
        let pos = cell_index_to_file_offset((self.header.offset + start as u32) as i32)?;
        stream.seek(SeekFrom::Start(pos))?;
        stream.write_all(&self.buffer[start..start + len])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_bin(size: u32) -> (Bin, Cursor<Vec<u8>>) {
        let mut stream = Cursor::new(vec![0u8; BIN_START as usize]);
        let bin = Bin::create(&mut stream, 0, size).unwrap();
        (bin, stream)
    }

    fn accounted(bin: &Bin) -> u32 {
        let allocated: u32 = bin.allocated_ranges().unwrap().iter().map(|r| r.len).sum();
        allocated + bin.free_space()
    }

    #[test]
    fn test_hbin_header_size() {
        assert_eq!(HBIN_HEADER_SIZE, 32);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = BinHeader::parse(&data, 0);
        assert!(matches!(result.unwrap_err(), RegistryError::InvalidSignature { .. }));
    }

    #[test]
    fn test_offset_mismatch() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        BinHeader::new(0x1000, 0x1000).write_to(&mut data);
        assert!(BinHeader::parse(&data, 0x2000).is_err());
        assert!(BinHeader::parse(&data, 0x1000).is_ok());
    }

    #[test]
    fn test_create_is_one_free_range() {
        let (bin, stream) = new_bin(0x1000);
        assert_eq!(bin.free_ranges(), &[CellSpan { offset: 0x20, len: 0xFE0 }]);
        assert_eq!(stream.get_ref().len(), 0x2000);
        assert_eq!(&stream.get_ref()[0x1000..0x1004], HBIN_SIGNATURE);
    }

    #[test]
    fn test_allocate_splits_and_persists() {
        let (mut bin, mut stream) = new_bin(0x1000);

        let a = bin.allocate_cell(0x20, &mut stream).unwrap().unwrap();
        let b = bin.allocate_cell(0x18, &mut stream).unwrap().unwrap();
        assert_eq!(a, 0x20);
        assert_eq!(b, 0x40);
        assert_eq!(bin.free_ranges(), &[CellSpan { offset: 0x58, len: 0xFA8 }]);

        let reloaded = Bin::from_buffer(stream.get_ref()[0x1000..0x2000].to_vec(), 0).unwrap();
        assert_eq!(reloaded.free_ranges(), bin.free_ranges());
        assert_eq!(accounted(&bin), 0x1000 - 32);
    }

    #[test]
    fn test_allocate_invalid_size() {
        let (mut bin, mut stream) = new_bin(0x1000);
        assert!(matches!(
            bin.allocate_cell(12, &mut stream).unwrap_err(),
            RegistryError::InvalidAllocationSize { size: 12 }
        ));
        assert!(bin.allocate_cell(0, &mut stream).is_err());
    }

    #[test]
    fn test_allocate_exhausted() {
        let (mut bin, mut stream) = new_bin(0x1000);
        assert!(bin.allocate_cell(0xFE0, &mut stream).unwrap().is_some());
        assert!(bin.free_ranges().is_empty());
        assert_eq!(bin.allocate_cell(8, &mut stream).unwrap(), None);
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let (mut bin, mut stream) = new_bin(0x1000);
        let a = bin.allocate_cell(0x10, &mut stream).unwrap().unwrap();
        let b = bin.allocate_cell(0x10, &mut stream).unwrap().unwrap();
        let c = bin.allocate_cell(0x10, &mut stream).unwrap().unwrap();

        bin.free_cell(a, &mut stream).unwrap();
        bin.free_cell(b, &mut stream).unwrap();
        assert_eq!(bin.free_ranges()[0], CellSpan { offset: 0x20, len: 0x20 });

        bin.free_cell(c, &mut stream).unwrap();
        assert_eq!(bin.free_ranges(), &[CellSpan { offset: 0x20, len: 0xFE0 }]);
    }

    #[test]
    fn test_double_free() {
        let (mut bin, mut stream) = new_bin(0x1000);
        let a = bin.allocate_cell(0x10, &mut stream).unwrap().unwrap();
        bin.free_cell(a, &mut stream).unwrap();
        assert!(matches!(
            bin.free_cell(a, &mut stream).unwrap_err(),
            RegistryError::CellAlreadyFree { .. }
        ));
    }

    #[test]
    fn test_raw_cell_data() {
        let (mut bin, mut stream) = new_bin(0x1000);
        let a = bin.allocate_cell(0x10, &mut stream).unwrap().unwrap();

        assert!(bin.write_raw_cell_data(a, &[1, 2, 3, 4], &mut stream).unwrap());
        assert_eq!(bin.read_raw_cell_data(a, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(bin.read_raw_cell_data(a, 100).unwrap().len(), 12);
        assert!(!bin.write_raw_cell_data(a, &[0u8; 13], &mut stream).unwrap());
    }

    #[test]
    fn test_free_record_reads_as_none() {
        let (bin, _) = new_bin(0x1000);
        assert!(bin.try_get_cell(0x20).unwrap().is_none());
        assert!(matches!(
            bin.try_get_cell(0x2000).unwrap_err(),
            RegistryError::NoOwningBin { .. }
        ));
    }

    #[test]
    fn test_load_rejects_bad_record() {
        let (_, stream) = new_bin(0x1000);
        let mut page = stream.get_ref()[0x1000..0x2000].to_vec();
        write_i32_le(&mut page, 0x20, 0x12);
        assert!(matches!(
            Bin::from_buffer(page, 0).unwrap_err(),
            RegistryError::InvalidCellSize { .. }
        ));
    }
}
