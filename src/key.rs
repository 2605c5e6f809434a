//! Key node (nk) cells.

use crate::cell::{impl_cell_variant, KeyNodeFlags, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::utils::{
    decode_name, encode_name, filetime_now, filetime_to_datetime, read_i32_le, read_u16_le,
    read_u32_le, read_u64_le, write_i32_le, write_u16_le, write_u32_le, write_u64_le,
};

/// Minimum size of a key node structure in bytes.
const KEY_NODE_MIN_SIZE: usize = 0x4C;

/// Offset of the key name in the key node structure.
const KEY_NAME_OFFSET: usize = 0x4C;

/// Key node (nk) cell.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys, values, security and class name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNode {
    /// Cell index of this node.
    pub index: i32,

    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub timestamp: u64,

    /// Access bits.
    pub access_bits: u32,

    /// Index of the parent key node.
    pub parent: i32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,

    /// Index of the subkey list.
    pub subkey_list: i32,

    /// Index of the volatile subkey list.
    pub volatile_subkey_list: i32,

    /// Number of values.
    pub value_count: u32,

    /// Index of the value list.
    pub value_list: i32,

    /// Index of the security cell.
    pub security: i32,

    /// Index of the class name cell.
    pub class_name: i32,

    /// Largest subkey name, in UTF-16 bytes.
    pub max_subkey_name_len: u32,

    /// Largest subkey class name, in bytes.
    pub max_subkey_class_len: u32,

    /// Largest value name, in UTF-16 bytes.
    pub max_value_name_len: u32,

    /// Largest value data, in bytes.
    pub max_value_data_len: u32,

    /// Work variable.
    pub work_var: u32,

    /// Length of the class name in bytes.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Creates an unpersisted key node.
    pub fn new(name: &str, parent: i32) -> Self {
        Self {
            index: NO_INDEX,
            flags: KeyNodeFlags::default(),
            timestamp: filetime_now(),
            access_bits: 0,
            parent,
            subkey_count: 0,
            volatile_subkey_count: 0,
            subkey_list: NO_INDEX,
            volatile_subkey_list: NO_INDEX,
            value_count: 0,
            value_list: NO_INDEX,
            security: NO_INDEX,
            class_name: NO_INDEX,
            max_subkey_name_len: 0,
            max_subkey_class_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            work_var: 0,
            class_name_length: 0,
            name: name.to_string(),
        }
    }

    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `index` - Index of this cell.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        let offset = index as u32;
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"nk" {
            return Err(RegistryError::invalid_signature(b"nk", &data[0..2]));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);
        let name_length = read_u16_le(data, 0x48)? as usize;

        let name_end = KEY_NAME_OFFSET + name_length;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: name_end,
                actual: data.len(),
            });
        }
        let name = decode_name(&data[KEY_NAME_OFFSET..name_end], flags.is_compressed(), offset)?;

        Ok(KeyNode {
            index,
            flags,
            timestamp: read_u64_le(data, 0x04)?,
            access_bits: read_u32_le(data, 0x0C)?,
            parent: read_i32_le(data, 0x10)?,
            subkey_count: read_u32_le(data, 0x14)?,
            volatile_subkey_count: read_u32_le(data, 0x18)?,
            subkey_list: read_i32_le(data, 0x1C)?,
            volatile_subkey_list: read_i32_le(data, 0x20)?,
            value_count: read_u32_le(data, 0x24)?,
            value_list: read_i32_le(data, 0x28)?,
            security: read_i32_le(data, 0x2C)?,
            class_name: read_i32_le(data, 0x30)?,
            max_subkey_name_len: read_u32_le(data, 0x34)?,
            max_subkey_class_len: read_u32_le(data, 0x38)?,
            max_value_name_len: read_u32_le(data, 0x3C)?,
            max_value_data_len: read_u32_le(data, 0x40)?,
            work_var: read_u32_le(data, 0x44)?,
            class_name_length: read_u16_le(data, 0x4A)?,
            name,
        })
    }

    fn serialized_size(&self) -> usize {
        KEY_NAME_OFFSET + encode_name(&self.name).0.len()
    }

    fn serialize(&self, buffer: &mut [u8]) {
        let (name, compressed) = encode_name(&self.name);
        let mut flags = self.flags;
        flags.set(KeyNodeFlags::COMP_NAME, compressed);

        buffer[0..2].copy_from_slice(b"nk");
        write_u16_le(buffer, 0x02, flags.0);
        write_u64_le(buffer, 0x04, self.timestamp);
        write_u32_le(buffer, 0x0C, self.access_bits);
        write_i32_le(buffer, 0x10, self.parent);
        write_u32_le(buffer, 0x14, self.subkey_count);
        write_u32_le(buffer, 0x18, self.volatile_subkey_count);
        write_i32_le(buffer, 0x1C, self.subkey_list);
        write_i32_le(buffer, 0x20, self.volatile_subkey_list);
        write_u32_le(buffer, 0x24, self.value_count);
        write_i32_le(buffer, 0x28, self.value_list);
        write_i32_le(buffer, 0x2C, self.security);
        write_i32_le(buffer, 0x30, self.class_name);
        write_u32_le(buffer, 0x34, self.max_subkey_name_len);
        write_u32_le(buffer, 0x38, self.max_subkey_class_len);
        write_u32_le(buffer, 0x3C, self.max_value_name_len);
        write_u32_le(buffer, 0x40, self.max_value_data_len);
        write_u32_le(buffer, 0x44, self.work_var);
        write_u16_le(buffer, 0x48, name.len() as u16);
        write_u16_le(buffer, 0x4A, self.class_name_length);
        buffer[KEY_NAME_OFFSET..KEY_NAME_OFFSET + name.len()].copy_from_slice(&name);
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }

    /// Last written time as a UTC date.
    pub fn timestamp_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        filetime_to_datetime(self.timestamp)
    }
}

impl_cell_variant!(KeyNode, KeyNode, "KeyNode");
