//! Read/write registry hive over a seekable byte stream.
//!
//! [`RegistryHive`] owns the loaded bins and the parsed header. It resolves
//! cell indices to their owning bin, allocates and frees records, relocates
//! cells that outgrow their allocation and appends bins when every existing
//! bin is full. Every change is written straight through to the stream.

use crate::cell::{Cell, CellRecord, KeyNodeFlags, NO_INDEX};
use crate::config::HiveOptions;
use crate::error::{RegistryError, Result};
use crate::hbin::{Bin, HBIN_ALIGNMENT, HBIN_HEADER_SIZE};
use crate::header::{HiveHeader, HEADER_SIZE};
use crate::key::KeyNode;
use crate::registry_key::RegistryKey;
use crate::utils::{round_up, BIN_START};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, instrument};

/// Name given to the root key of a new hive.
pub const ROOT_KEY_NAME: &str = "root";

/// A registry hive backed by a `Read + Write + Seek` stream.
///
/// The stream is either owned (`RegistryHive<File>`) or borrowed
/// (`RegistryHive<&mut Cursor<Vec<u8>>>`); it is released by
/// [`into_inner`](Self::into_inner) or by dropping the hive.
///
/// # Examples
///
/// ```rust
/// use reg_hive::{RegistryHive, ValueData};
/// use std::io::Cursor;
///
/// let mut hive = RegistryHive::create(Cursor::new(Vec::new())).unwrap();
/// let mut root = hive.root_key().unwrap();
/// let mut key = root.create_subkey("Software\\Vendor").unwrap();
/// key.set_value("Count", &ValueData::Dword(42)).unwrap();
///
/// let stream = hive.into_inner();
/// let mut hive = RegistryHive::open(stream).unwrap();
/// let mut root = hive.root_key().unwrap();
/// let key = root.open_subkey("SOFTWARE\\vendor").unwrap().unwrap();
/// assert_eq!(key.get_value("count").unwrap(), Some(ValueData::Dword(42)));
/// ```
pub struct RegistryHive<S> {
    stream: S,
    header: HiveHeader,
    bins: Vec<Bin>,
    options: HiveOptions,
}

impl RegistryHive<File> {
    /// Opens an existing hive file for reading and writing.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::open(file)
    }

    /// Creates (or truncates) a hive file and initializes an empty hive in it.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn create_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Self::create(file)
    }
}

impl<S: Read + Write + Seek> RegistryHive<S> {
    /// Opens an existing hive with default options.
    pub fn open(stream: S) -> Result<Self> {
        Self::open_with_options(stream, HiveOptions::default())
    }

    /// Opens an existing hive.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The stream is shorter than a header or than the recorded length
    /// - The header is invalid (signature, sequence, checksum, version)
    /// - Any bin or record length is malformed
    /// - The root cell is not a key node
    #[instrument(skip_all)]
    pub fn open_with_options(mut stream: S, options: HiveOptions) -> Result<Self> {
        let stream_len = stream.seek(SeekFrom::End(0))?;
        if stream_len < HEADER_SIZE as u64 {
            return Err(RegistryError::HiveTooSmall {
                size: stream_len as usize,
                minimum: HEADER_SIZE,
            });
        }

        let mut raw = vec![0u8; HEADER_SIZE];
        stream.seek(SeekFrom::Start(0))?;
        stream.read_exact(&mut raw)?;
        let header = HiveHeader::parse(&raw)?;
        debug!(length = header.length, minor = header.minor_version, "Parsed hive header");

        let data_len = stream_len.saturating_sub(BIN_START);
        if u64::from(header.length) > data_len {
            return Err(RegistryError::TruncatedData {
                offset: 0,
                expected: header.length as usize,
                actual: data_len as usize,
            });
        }

        let mut bins = Vec::new();
        let mut pos = 0u32;
        while pos < header.length {
            let bin = Bin::read_from(&mut stream, pos, header.length - pos)?;
            pos += bin.size();
            bins.push(bin);
        }

        let hive = Self {
            stream,
            header,
            bins,
            options,
        };

        let root = hive.root_node()?;
        info!(
            bins = hive.bins.len(),
            length = hive.header.length,
            root = %root.name,
            "Opened registry hive"
        );
        Ok(hive)
    }

    /// Initializes a new, empty hive with default options.
    pub fn create(stream: S) -> Result<Self> {
        Self::create_with_options(stream, HiveOptions::default())
    }

    /// Initializes a new hive: a header, one 4 KiB bin, and a root key
    /// holding the configured security descriptor.
    #[instrument(skip_all, fields(file_name = %options.file_name))]
    pub fn create_with_options(mut stream: S, options: HiveOptions) -> Result<Self> {
        let mut header = HiveHeader::new(&options.file_name);
        let mut page = vec![0u8; BIN_START as usize];
        header.write_to(&mut page)?;
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(&page)?;

        let bin = Bin::create(&mut stream, 0, HBIN_ALIGNMENT)?;
        header.length = bin.size();

        let mut hive = Self {
            stream,
            header,
            bins: vec![bin],
            options,
        };

        let mut root = KeyNode::new(ROOT_KEY_NAME, NO_INDEX);
        root.flags.set(KeyNodeFlags::ROOT_KEY, true);
        hive.header.root_cell = hive.update_cell(&mut root, true)?;

        let descriptor = hive.options.security_descriptor.clone();
        root.security = hive.add_security_cell(&descriptor)?;
        hive.update_cell(&mut root, false)?;
        hive.write_header()?;

        info!(
            root = format_args!("{:#x}", hive.header.root_cell),
            "Created registry hive"
        );
        Ok(hive)
    }

    /// Releases the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Flushes the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    /// Returns the parsed header.
    pub fn header(&self) -> &HiveHeader {
        &self.header
    }

    /// Returns the loaded bins in offset order.
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Returns the options this hive was opened or created with.
    pub fn options(&self) -> &HiveOptions {
        &self.options
    }

    /// Index of the root key node.
    pub fn root_index(&self) -> i32 {
        self.header.root_cell
    }

    /// Reads the root key node.
    pub fn root_node(&self) -> Result<KeyNode> {
        self.cell(self.header.root_cell)
    }

    /// Returns the root key.
    pub fn root_key(&mut self) -> Result<RegistryKey<'_, S>> {
        let index = self.root_node()?.index;
        Ok(RegistryKey::new(self, index))
    }

    /// Reads the cell at `index` as variant `T`.
    ///
    /// Returns `None` for [`NO_INDEX`] and for free records.
    ///
    /// # Errors
    ///
    /// Fails if no bin holds `index`, if the record is malformed, or if it
    /// holds a different variant.
    pub fn get_cell<T: CellRecord>(&self, index: i32) -> Result<Option<T>> {
        if index == NO_INDEX {
            return Ok(None);
        }
        let bin = self.find_bin(index)?;
        match self.bins[bin].try_get_cell(index)? {
            Some(cell) => T::from_cell(cell).map(Some),
            None => Ok(None),
        }
    }

    /// Reads a cell that must be allocated.
    pub fn cell<T: CellRecord>(&self, index: i32) -> Result<T> {
        self.get_cell(index)?
            .ok_or(RegistryError::CellNotAllocated { index })
    }

    /// Reads an allocated cell of any variant.
    pub fn any_cell(&self, index: i32) -> Result<Cell> {
        if index == NO_INDEX {
            return Err(RegistryError::CellNotAllocated { index });
        }
        let bin = self.find_bin(index)?;
        self.bins[bin]
            .try_get_cell(index)?
            .ok_or(RegistryError::CellNotAllocated { index })
    }

    /// Persists a cell and returns its (possibly new) index.
    ///
    /// A cell that was never persisted is allocated first. An existing cell
    /// is rewritten in place when it fits; otherwise it is moved to a fresh
    /// allocation and the old record freed, or, when `can_relocate` is false,
    /// the call fails with [`RegistryError::CellSizeExceeded`].
    pub fn update_cell<T: CellRecord>(&mut self, cell: &mut T, can_relocate: bool) -> Result<i32> {
        if cell.index() == NO_INDEX {
            if !can_relocate {
                return Err(RegistryError::InvalidArgument(format!(
                    "{} was never persisted and relocation is disabled",
                    T::NAME
                )));
            }
            let index = self.allocate_raw_cell(cell.size())?;
            cell.set_index(index);
        }

        let index = cell.index();
        let bin = self.find_bin(index)?;
        if self.bins[bin].update_cell(cell, &mut self.stream)? {
            return Ok(index);
        }

        if !can_relocate {
            let allocated = self.bins[bin].read_raw_cell_data(index, usize::MAX)?.len() + 4;
            return Err(RegistryError::CellSizeExceeded {
                index,
                required: cell.size() + 4,
                allocated,
            });
        }

        let new_index = self.allocate_raw_cell(cell.size())?;
        cell.set_index(new_index);
        let new_bin = self.find_bin(new_index)?;
        if !self.bins[new_bin].update_cell(cell, &mut self.stream)? {
            return Err(RegistryError::RelocationFailed { index });
        }
        self.free_cell(index)?;

        debug!(
            cell = T::NAME,
            from = format_args!("{:#x}", index),
            to = format_args!("{:#x}", new_index),
            "Relocated cell"
        );
        Ok(new_index)
    }

    /// Allocates a record able to hold `capacity` payload bytes, appending a
    /// bin if no existing bin has room.
    pub fn allocate_raw_cell(&mut self, capacity: usize) -> Result<i32> {
        let size = round_up(capacity + 4, 8);

        for bin in self.bins.iter_mut() {
            if let Some(index) = bin.allocate_cell(size, &mut self.stream)? {
                debug!(index = format_args!("{:#x}", index), size, "Allocated cell");
                return Ok(index);
            }
        }

        let bin = self.grow(size)?;
        match self.bins[bin].allocate_cell(size, &mut self.stream)? {
            Some(index) => {
                debug!(index = format_args!("{:#x}", index), size, "Allocated cell in new bin");
                Ok(index)
            }
            None => Err(RegistryError::AllocationFailed { size }),
        }
    }

    /// Frees the record at `index`.
    pub fn free_cell(&mut self, index: i32) -> Result<()> {
        let bin = self.find_bin(index)?;
        self.bins[bin].free_cell(index, &mut self.stream)
    }

    /// Reads up to `max_bytes` of a record's payload.
    pub fn raw_cell_data(&self, index: i32, max_bytes: usize) -> Result<Vec<u8>> {
        let bin = self.find_bin(index)?;
        self.bins[bin].read_raw_cell_data(index, max_bytes)
    }

    /// Writes `data` at the start of a record's payload.
    ///
    /// Returns `false` if it does not fit.
    pub fn write_raw_cell_data(&mut self, index: i32, data: &[u8]) -> Result<bool> {
        let bin = self.find_bin(index)?;
        self.bins[bin].write_raw_cell_data(index, data, &mut self.stream)
    }

    /// Finds the bin holding `index` by binary search over bin offsets.
    fn find_bin(&self, index: i32) -> Result<usize> {
        let missing = || RegistryError::NoOwningBin {
            index,
            hive_length: self.header.length,
        };
        if index < 0 {
            return Err(missing());
        }

        let pos = self.bins.partition_point(|bin| bin.offset() <= index as u32);
        match pos.checked_sub(1) {
            Some(bin) if self.bins[bin].contains(index) => Ok(bin),
            _ => Err(missing()),
        }
    }

    /// Appends a bin with room for a `min_size` record and records the new
    /// length in the header.
    fn grow(&mut self, min_size: usize) -> Result<usize> {
        let bin_size = round_up(min_size + HBIN_HEADER_SIZE, HBIN_ALIGNMENT as usize);
        let bin_size =
            u32::try_from(bin_size).map_err(|_| RegistryError::AllocationFailed { size: min_size })?;
        let offset = self
            .bins
            .last()
            .map(|bin| bin.offset() + bin.size())
            .unwrap_or(0);

        let bin = Bin::create(&mut self.stream, offset, bin_size)?;
        self.bins.push(bin);

        self.header.length = offset + bin_size;
        self.header.touch();
        self.write_header()?;

        debug!(
            offset = format_args!("{:#x}", offset),
            size = bin_size,
            length = self.header.length,
            "Appended bin"
        );
        Ok(self.bins.len() - 1)
    }

    /// Re-reads the on-disk header block, applies the in-memory fields and
    /// writes it back.
    fn write_header(&mut self) -> Result<()> {
        let mut raw = vec![0u8; HEADER_SIZE];
        self.stream.seek(SeekFrom::Start(0))?;
        self.stream.read_exact(&mut raw)?;

        self.header.write_to(&mut raw)?;

        self.stream.seek(SeekFrom::Start(0))?;
        self.stream.write_all(&raw)?;
        Ok(())
    }
}
