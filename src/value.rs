//! Value (vk) cells and value data marshalling.

use crate::cell::{impl_cell_variant, ValueType, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::utils::{
    decode_name, encode_name, encode_utf16, read_i32_le, read_u16_le, read_u32_le,
    read_utf16_string, write_i32_le, write_u16_le, write_u32_le,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Fixed part of a value cell.
const VALUE_MIN_SIZE: usize = 0x14;

/// Top bit of the stored data length: data lives in the data index field.
const INLINE_FLAG: u32 = 0x8000_0000;

/// Value flag: name is stored as Latin-1.
const VALUE_COMP_NAME: u16 = 0x0001;

/// Value (vk) cell.
///
/// Represents a registry value with its name, type and a reference to its
/// data (or the data itself when it is small enough to be inlined).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueCell {
    /// Cell index of this value.
    pub index: i32,

    /// Value name; empty for the default value.
    pub name: String,

    /// Length of the value data in bytes.
    pub data_length: u32,

    /// True when the data is stored in `data_index` itself.
    pub inline: bool,

    /// Index of the data cell, or the inline bytes.
    pub data_index: i32,

    /// Value data type.
    pub data_type: ValueType,

    /// Raw flags.
    pub flags: u16,
}

impl ValueCell {
    /// Creates an unpersisted value with no data.
    pub fn new(name: &str) -> Self {
        Self {
            index: NO_INDEX,
            name: name.to_string(),
            data_length: 0,
            inline: false,
            data_index: NO_INDEX,
            data_type: ValueType::None,
            flags: 0,
        }
    }

    /// Parses a value cell from cell data.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated, or if inline
    /// data is flagged on a type that never stores data inline.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        let offset = index as u32;
        if data.len() < VALUE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"vk" {
            return Err(RegistryError::invalid_signature(b"vk", &data[0..2]));
        }

        let name_length = read_u16_le(data, 0x02)? as usize;

        // Data length is stored with the high bit marking inline data
        let raw_length = read_u32_le(data, 0x04)?;
        let inline = raw_length & INLINE_FLAG != 0;
        let data_length = raw_length & !INLINE_FLAG;

        let data_index = read_i32_le(data, 0x08)?;
        let data_type = ValueType::from_u32(read_u32_le(data, 0x0C)?);
        let flags = read_u16_le(data, 0x10)?;

        if inline && (!data_type.allows_inline() || data_length > 4) {
            return Err(RegistryError::InvalidInlineData {
                value_type: data_type.to_u32(),
                length: data_length,
            });
        }

        let name_end = VALUE_MIN_SIZE + name_length;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: name_end,
                actual: data.len(),
            });
        }
        let name = decode_name(
            &data[VALUE_MIN_SIZE..name_end],
            flags & VALUE_COMP_NAME != 0,
            offset,
        )?;

        Ok(ValueCell {
            index,
            name,
            data_length,
            inline,
            data_index,
            data_type,
            flags,
        })
    }

    fn serialized_size(&self) -> usize {
        VALUE_MIN_SIZE + encode_name(&self.name).0.len()
    }

    fn serialize(&self, buffer: &mut [u8]) {
        let (name, compressed) = encode_name(&self.name);
        let flags = if compressed && !name.is_empty() {
            self.flags | VALUE_COMP_NAME
        } else {
            self.flags & !VALUE_COMP_NAME
        };
        let raw_length = if self.inline {
            self.data_length | INLINE_FLAG
        } else {
            self.data_length
        };

        buffer[0..2].copy_from_slice(b"vk");
        write_u16_le(buffer, 0x02, name.len() as u16);
        write_u32_le(buffer, 0x04, raw_length);
        write_i32_le(buffer, 0x08, self.data_index);
        write_u32_le(buffer, 0x0C, self.data_type.to_u32());
        write_u16_le(buffer, 0x10, flags);
        write_u16_le(buffer, 0x12, 0);
        buffer[VALUE_MIN_SIZE..VALUE_MIN_SIZE + name.len()].copy_from_slice(&name);
    }

    /// Returns true for the unnamed (default) value.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Returns the inline data bytes.
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_index.to_le_bytes();
        bytes[..(self.data_length as usize).min(4)].to_vec()
    }

    /// Returns true if a separate data cell is referenced.
    pub fn has_data_cell(&self) -> bool {
        !self.inline && self.data_index != NO_INDEX
    }
}

impl_cell_variant!(ValueCell, Value, "ValueCell");

/// Typed registry value data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ValueData {
    /// No data.
    None,

    /// String value.
    String(String),

    /// Expandable string value (stored unexpanded).
    ExpandString(String),

    /// Symbolic link target.
    Link(String),

    /// Binary data.
    Binary(Vec<u8>),

    /// 32-bit little-endian integer.
    Dword(u32),

    /// 32-bit big-endian integer.
    DwordBigEndian(u32),

    /// Multiple strings.
    MultiString(Vec<String>),

    /// 64-bit little-endian integer.
    Qword(u64),

    /// Data of any other type, kept as raw bytes.
    Raw(ValueType, Vec<u8>),
}

impl ValueData {
    /// Decodes raw value data according to the value type.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw value data bytes.
    /// * `value_type` - Type of the value.
    /// * `offset` - Value cell index for error reporting.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        match value_type {
            ValueType::None if data.is_empty() => Ok(ValueData::None),

            ValueType::String => Ok(ValueData::String(read_utf16_string(even(data), offset)?)),
            ValueType::ExpandString => {
                Ok(ValueData::ExpandString(read_utf16_string(even(data), offset)?))
            }
            ValueType::Link => Ok(ValueData::Link(read_utf16_string(even(data), offset)?)),

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                let mut cursor = Cursor::new(fixed::<4>(data, offset)?);
                Ok(ValueData::Dword(cursor.read_u32::<LittleEndian>()?))
            }

            ValueType::DwordBigEndian => {
                let mut cursor = Cursor::new(fixed::<4>(data, offset)?);
                Ok(ValueData::DwordBigEndian(cursor.read_u32::<BigEndian>()?))
            }

            ValueType::Qword => {
                let mut cursor = Cursor::new(fixed::<8>(data, offset)?);
                Ok(ValueData::Qword(cursor.read_u64::<LittleEndian>()?))
            }

            ValueType::MultiString => {
                let joined = read_utf16_string(even(data), offset)?;
                if joined.is_empty() {
                    return Ok(ValueData::MultiString(Vec::new()));
                }
                Ok(ValueData::MultiString(
                    joined.split('\0').map(str::to_string).collect(),
                ))
            }

            other => Ok(ValueData::Raw(other, data.to_vec())),
        }
    }

    /// Returns the value type this data is stored as.
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueData::None => ValueType::None,
            ValueData::String(_) => ValueType::String,
            ValueData::ExpandString(_) => ValueType::ExpandString,
            ValueData::Link(_) => ValueType::Link,
            ValueData::Binary(_) => ValueType::Binary,
            ValueData::Dword(_) => ValueType::Dword,
            ValueData::DwordBigEndian(_) => ValueType::DwordBigEndian,
            ValueData::MultiString(_) => ValueType::MultiString,
            ValueData::Qword(_) => ValueType::Qword,
            ValueData::Raw(value_type, _) => *value_type,
        }
    }

    /// Encodes the data into its stored byte form.
    ///
    /// Strings gain a terminating NUL; multi-strings are NUL separated and
    /// end with a double NUL.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ValueData::None => Vec::new(),
            ValueData::String(s) | ValueData::ExpandString(s) | ValueData::Link(s) => {
                let mut bytes = encode_utf16(s);
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
            ValueData::Binary(bytes) | ValueData::Raw(_, bytes) => bytes.clone(),
            ValueData::Dword(v) => v.to_le_bytes().to_vec(),
            ValueData::DwordBigEndian(v) => {
                let mut bytes = vec![0u8; 4];
                BigEndian::write_u32(&mut bytes, *v);
                bytes
            }
            ValueData::MultiString(strings) => {
                let mut bytes = Vec::new();
                for s in strings {
                    bytes.extend(encode_utf16(s));
                    bytes.extend_from_slice(&[0, 0]);
                }
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
            ValueData::Qword(v) => v.to_le_bytes().to_vec(),
        }
    }
}

impl fmt::Display for ValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueData::None => Ok(()),
            ValueData::String(s) | ValueData::ExpandString(s) | ValueData::Link(s) => {
                f.write_str(s)
            }
            ValueData::Dword(v) | ValueData::DwordBigEndian(v) => write!(f, "{}", v),
            ValueData::Qword(v) => write!(f, "{}", v),
            ValueData::MultiString(strings) => f.write_str(&strings.join(",")),
            ValueData::Binary(bytes) | ValueData::Raw(_, bytes) => {
                let shown = &bytes[..bytes.len().min(8)];
                write!(f, "{} ({} bytes)", hex::encode_upper(shown), bytes.len())
            }
        }
    }
}

/// Drops a trailing odd byte so UTF-16 decoding sees whole code units.
fn even(data: &[u8]) -> &[u8] {
    &data[..data.len() & !1]
}

fn fixed<const N: usize>(data: &[u8], offset: u32) -> Result<&[u8]> {
    if data.len() < N {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: N,
            actual: data.len(),
        });
    }
    Ok(&data[..N])
}
