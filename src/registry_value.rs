//! Registry values and value storage.

use crate::cell::{ValueType, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::hive::RegistryHive;
use crate::key::KeyNode;
use crate::utils::{compare_names, names_equal, read_i32_le};
use crate::value::{ValueCell, ValueData};
use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Seek, Write};
use tracing::debug;

/// A value read from a key.
pub struct RegistryValue<'h, S> {
    hive: &'h RegistryHive<S>,
    cell: ValueCell,
}

impl<'h, S: Read + Write + Seek> RegistryValue<'h, S> {
    pub(crate) fn new(hive: &'h RegistryHive<S>, cell: ValueCell) -> Self {
        Self { hive, cell }
    }

    /// Returns the value name; empty for the default value.
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Returns the value data type.
    pub fn data_type(&self) -> ValueType {
        self.cell.data_type
    }

    /// Returns the underlying value cell.
    pub fn cell(&self) -> &ValueCell {
        &self.cell
    }

    /// Returns the raw value data as bytes.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        self.hive.value_bytes(&self.cell)
    }

    /// Returns the parsed value data.
    pub fn data(&self) -> Result<ValueData> {
        ValueData::parse(&self.raw_data()?, self.cell.data_type, self.cell.index as u32)
    }
}

impl<'h, S: Read + Write + Seek> fmt::Display for RegistryValue<'h, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data() {
            Ok(data) => write!(f, "{}:{}:{}", self.name(), self.data_type(), data),
            Err(_) => write!(f, "{}:{}:<unreadable>", self.name(), self.data_type()),
        }
    }
}

impl<S: Read + Write + Seek> RegistryHive<S> {
    /// Reads a value's payload, following inline storage and big data.
    pub fn value_bytes(&self, cell: &ValueCell) -> Result<Vec<u8>> {
        if cell.inline {
            return Ok(cell.inline_data());
        }

        let length = cell.data_length as usize;
        if cell.data_index == NO_INDEX || length == 0 {
            return Ok(Vec::new());
        }

        if self.uses_big_data(length) && self.is_big_data_cell(cell.data_index)? {
            return self.read_big_data(cell.data_index, length);
        }

        let data = self.raw_cell_data(cell.data_index, length)?;
        if data.len() < length {
            return Err(RegistryError::TruncatedData {
                offset: cell.data_index as u32,
                expected: length,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Stores `data` for a value and persists the value cell.
    ///
    /// Dword and DwordBigEndian payloads of up to 4 bytes are kept inline.
    /// Other payloads reuse the existing data cell when they fit, and move
    /// to a new cell otherwise.
    pub fn write_value_data(&mut self, cell: &mut ValueCell, value_type: ValueType, data: &[u8]) -> Result<()> {
        let old_big = cell.has_data_cell() && self.holds_big_data(cell)?;
        let old = cell.has_data_cell().then_some(cell.data_index);

        if value_type.allows_inline() && data.len() <= 4 {
            if let Some(old) = old {
                self.free_data_cell(old, old_big)?;
            }
            let mut inline = [0u8; 4];
            inline[..data.len()].copy_from_slice(data);
            cell.data_index = i32::from_le_bytes(inline);
            cell.inline = true;
        } else if data.is_empty() {
            if let Some(old) = old {
                self.free_data_cell(old, old_big)?;
            }
            cell.data_index = NO_INDEX;
            cell.inline = false;
        } else if self.uses_big_data(data.len()) {
            if let Some(old) = old {
                self.free_data_cell(old, old_big)?;
            }
            cell.data_index = self.write_big_data(data)?;
            cell.inline = false;
        } else {
            let reused = match old {
                Some(old) if !old_big => self.write_raw_cell_data(old, data)?,
                _ => false,
            };
            if !reused {
                let index = self.allocate_raw_cell(data.len())?;
                self.write_raw_cell_data(index, data)?;
                if let Some(old) = old {
                    self.free_data_cell(old, old_big)?;
                }
                cell.data_index = index;
            }
            cell.inline = false;
        }

        cell.data_length = data.len() as u32;
        cell.data_type = value_type;
        self.update_cell(cell, false)?;
        Ok(())
    }

    /// Value cell indices of a key, in list order.
    pub fn value_indices(&self, node: &KeyNode) -> Result<Vec<i32>> {
        if !node.has_values() || node.value_list == NO_INDEX {
            return Ok(Vec::new());
        }

        let count = node.value_count as usize;
        let raw = self.raw_cell_data(node.value_list, count * 4)?;
        if raw.len() < count * 4 {
            return Err(RegistryError::TruncatedData {
                offset: node.value_list as u32,
                expected: count * 4,
                actual: raw.len(),
            });
        }
        (0..count).map(|i| read_i32_le(&raw, i * 4)).collect()
    }

    /// Looks a value up by name (case-insensitive), returning its position in
    /// the value list and its cell.
    pub fn find_value(&self, node: &KeyNode, name: &str) -> Result<Option<(usize, ValueCell)>> {
        for (pos, index) in self.value_indices(node)?.into_iter().enumerate() {
            let cell: ValueCell = self.cell(index)?;
            if names_equal(&cell.name, name) {
                return Ok(Some((pos, cell)));
            }
        }
        Ok(None)
    }

    /// Creates an empty value on `node`, keeping the value list sorted, and
    /// persists the node.
    pub(crate) fn add_value(&mut self, node: &mut KeyNode, name: &str) -> Result<ValueCell> {
        let mut cell = ValueCell::new(name);
        self.update_cell(&mut cell, true)?;

        let mut indices = self.value_indices(node)?;
        let mut pos = indices.len();
        for (i, &index) in indices.iter().enumerate() {
            let existing: ValueCell = self.cell(index)?;
            if compare_names(name, &existing.name) == Ordering::Less {
                pos = i;
                break;
            }
        }
        indices.insert(pos, cell.index);

        node.value_list = self.write_value_list(node.value_list, &indices)?;
        node.value_count = indices.len() as u32;
        node.max_value_name_len = node.max_value_name_len.max(utf16_len(name));
        self.update_cell(node, false)?;

        debug!(
            key = %node.name,
            value = %name,
            index = format_args!("{:#x}", cell.index),
            "Added value"
        );
        Ok(cell)
    }

    /// Removes the value at `pos` of `node`'s value list, frees its cell and
    /// data, and persists the node.
    pub(crate) fn remove_value(&mut self, node: &mut KeyNode, pos: usize) -> Result<()> {
        let mut indices = self.value_indices(node)?;
        if pos >= indices.len() {
            return Err(RegistryError::InvalidArgument(format!(
                "Value position {} out of range ({} values)",
                pos,
                indices.len()
            )));
        }
        let removed = indices.remove(pos);

        if indices.is_empty() {
            self.free_cell(node.value_list)?;
            node.value_list = NO_INDEX;
        } else {
            node.value_list = self.write_value_list(node.value_list, &indices)?;
        }
        node.value_count = indices.len() as u32;

        self.free_value(removed)?;
        self.update_cell(node, false)?;
        Ok(())
    }

    /// Frees a value cell together with its data.
    pub(crate) fn free_value(&mut self, index: i32) -> Result<()> {
        let cell: ValueCell = self.cell(index)?;
        if cell.has_data_cell() {
            let big = self.holds_big_data(&cell)?;
            self.free_data_cell(cell.data_index, big)?;
        }
        self.free_cell(index)
    }

    /// Writes a value list, reallocating it when it no longer fits.
    fn write_value_list(&mut self, list: i32, indices: &[i32]) -> Result<i32> {
        let bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_le_bytes()).collect();

        if list != NO_INDEX && self.write_raw_cell_data(list, &bytes)? {
            return Ok(list);
        }

        let new_list = self.allocate_raw_cell(bytes.len())?;
        self.write_raw_cell_data(new_list, &bytes)?;
        if list != NO_INDEX {
            self.free_cell(list)?;
        }
        Ok(new_list)
    }

    fn holds_big_data(&self, cell: &ValueCell) -> Result<bool> {
        Ok(self.uses_big_data(cell.data_length as usize) && self.is_big_data_cell(cell.data_index)?)
    }

    fn free_data_cell(&mut self, index: i32, big: bool) -> Result<()> {
        if big {
            self.free_big_data(index)
        } else {
            self.free_cell(index)
        }
    }
}

/// Length of a name in UTF-16 bytes.
pub(crate) fn utf16_len(name: &str) -> u32 {
    (name.encode_utf16().count() * 2) as u32
}
