//! Cell type definitions and the cell factory.
//!
//! Every allocated record in a bin holds one cell whose first two bytes are a
//! tag identifying its variant. [`Cell`] is the closed set of variants this
//! crate reads and writes; [`CellRecord`] is the common surface each variant
//! implements so the hive can allocate, relocate and persist them uniformly.

use crate::bigdata::BigDataCell;
use crate::error::{RegistryError, Result};
use crate::key::KeyNode;
use crate::security::SecurityCell;
use crate::subkey_list::{SubKeyHashedList, SubKeyIndirectList};
use crate::value::ValueCell;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Index used for "no cell" / "not yet persisted".
pub const NO_INDEX: i32 = -1;

/// Cell type signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Key node (nk) - represents a registry key.
    KeyNode,

    /// Value (vk) - represents a registry value.
    Value,

    /// Security descriptor (sk).
    Security,

    /// Index leaf (li) - list of subkey indices.
    IndexLeaf,

    /// Fast leaf (lf) - list of subkeys with name prefixes.
    FastLeaf,

    /// Hash leaf (lh) - list of subkeys with name hashes.
    HashLeaf,

    /// Index root (ri) - list of subkey list indices.
    IndexRoot,

    /// Data block (db) - big data header.
    DataBlock,
}

impl CellType {
    /// Parses a cell type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2], index: i32) -> Result<Self> {
        match sig {
            b"nk" => Ok(CellType::KeyNode),
            b"vk" => Ok(CellType::Value),
            b"sk" => Ok(CellType::Security),
            b"li" => Ok(CellType::IndexLeaf),
            b"lf" => Ok(CellType::FastLeaf),
            b"lh" => Ok(CellType::HashLeaf),
            b"ri" => Ok(CellType::IndexRoot),
            b"db" => Ok(CellType::DataBlock),
            _ => Err(RegistryError::unknown_cell_type(*sig, index)),
        }
    }

    /// Returns the 2-byte signature for this cell type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            CellType::KeyNode => b"nk",
            CellType::Value => b"vk",
            CellType::Security => b"sk",
            CellType::IndexLeaf => b"li",
            CellType::FastLeaf => b"lf",
            CellType::HashLeaf => b"lh",
            CellType::IndexRoot => b"ri",
            CellType::DataBlock => b"db",
        }
    }
}

/// Flags for key nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyNodeFlags(pub u16);

impl KeyNodeFlags {
    /// Key is volatile (not stored on disk).
    pub const VOLATILE: u16 = 0x0001;

    /// Key is a mount point for another hive.
    pub const HIVE_EXIT: u16 = 0x0002;

    /// Key is the root key.
    pub const ROOT_KEY: u16 = 0x0004;

    /// Key cannot be deleted.
    pub const NO_DELETE: u16 = 0x0008;

    /// Key is a symbolic link.
    pub const SYM_LINK: u16 = 0x0010;

    /// Key name is in compressed format (Latin-1).
    pub const COMP_NAME: u16 = 0x0020;

    /// Key is a predefined handle.
    pub const PREDEF_HANDLE: u16 = 0x0040;

    /// Key is a virtualization source.
    pub const VIRT_SOURCE: u16 = 0x0080;

    /// Key is a virtual target.
    pub const VIRT_TARGET: u16 = 0x0100;

    /// Key is part of a virtual store.
    pub const VIRT_STORE: u16 = 0x0200;

    /// Creates a new KeyNodeFlags from a u16 value.
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Returns true if the specified flag is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Sets or clears a flag.
    pub fn set(&mut self, flag: u16, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Returns true if the key name is compressed (Latin-1).
    pub fn is_compressed(&self) -> bool {
        self.has_flag(Self::COMP_NAME)
    }

    /// Returns true if this is a volatile key.
    pub fn is_volatile(&self) -> bool {
        self.has_flag(Self::VOLATILE)
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.has_flag(Self::ROOT_KEY)
    }
}

/// Registry value data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ValueType {
    /// No value type.
    None,

    /// String (null-terminated).
    String,

    /// String with environment variables.
    ExpandString,

    /// Binary data.
    Binary,

    /// 32-bit little-endian integer.
    Dword,

    /// 32-bit big-endian integer.
    DwordBigEndian,

    /// Symbolic link (Unicode).
    Link,

    /// Multiple strings.
    MultiString,

    /// Resource list.
    ResourceList,

    /// Full resource descriptor.
    FullResourceDescriptor,

    /// Resource requirements list.
    ResourceRequirementsList,

    /// 64-bit little-endian integer.
    Qword,

    /// Any other type tag, kept verbatim.
    Unknown(u32),
}

impl ValueType {
    /// Maps a stored type tag to a value type. Unknown tags are preserved.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ValueType::None,
            1 => ValueType::String,
            2 => ValueType::ExpandString,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiString,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            _ => ValueType::Unknown(value),
        }
    }

    /// Returns the stored type tag.
    pub fn to_u32(self) -> u32 {
        match self {
            ValueType::None => 0,
            ValueType::String => 1,
            ValueType::ExpandString => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiString => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(value) => value,
        }
    }

    /// Returns true if values of this type may keep up to 4 bytes inline.
    pub fn allows_inline(self) -> bool {
        matches!(self, ValueType::Dword | ValueType::DwordBigEndian)
    }

    /// Returns the name of this value type.
    pub fn name(&self) -> String {
        match self {
            ValueType::None => "REG_NONE".to_string(),
            ValueType::String => "REG_SZ".to_string(),
            ValueType::ExpandString => "REG_EXPAND_SZ".to_string(),
            ValueType::Binary => "REG_BINARY".to_string(),
            ValueType::Dword => "REG_DWORD".to_string(),
            ValueType::DwordBigEndian => "REG_DWORD_BIG_ENDIAN".to_string(),
            ValueType::Link => "REG_LINK".to_string(),
            ValueType::MultiString => "REG_MULTI_SZ".to_string(),
            ValueType::ResourceList => "REG_RESOURCE_LIST".to_string(),
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR".to_string(),
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST".to_string(),
            ValueType::Qword => "REG_QWORD".to_string(),
            ValueType::Unknown(value) => format!("REG_UNKNOWN_{:#010x}", value),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Behaviour shared by every cell variant.
pub trait CellRecord: Sized {
    /// Variant name used in error messages.
    const NAME: &'static str;

    /// Cell index, or [`NO_INDEX`] if not yet persisted.
    fn index(&self) -> i32;

    /// Records where the cell now lives.
    fn set_index(&mut self, index: i32);

    /// Serialized length in bytes, excluding the 4-byte length prefix.
    fn size(&self) -> usize;

    /// Serializes the cell (tag first) into `buffer`, which holds at least
    /// [`size`](Self::size) bytes.
    fn write_to(&self, buffer: &mut [u8]);

    /// Wraps the cell in the [`Cell`] sum type.
    fn into_cell(self) -> Cell;

    /// Unwraps a [`Cell`], failing if it is a different variant.
    fn from_cell(cell: Cell) -> Result<Self>;
}

/// A parsed cell of any variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// Key node (nk).
    KeyNode(KeyNode),
    /// Value (vk).
    Value(ValueCell),
    /// Security descriptor (sk).
    Security(SecurityCell),
    /// Hashed subkey list (lf/lh).
    SubKeyHashedList(SubKeyHashedList),
    /// Indirect subkey list (li/ri).
    SubKeyIndirectList(SubKeyIndirectList),
    /// Big data header (db).
    BigData(BigDataCell),
}

impl Cell {
    /// Parses a cell payload (tag first, length prefix excluded).
    ///
    /// `data` may extend past the cell's real contents up to the end of its
    /// allocation; each variant only consumes what it needs.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        if data.len() < 2 {
            return Err(RegistryError::TruncatedData {
                offset: index as u32,
                expected: 2,
                actual: data.len(),
            });
        }

        let tag = [data[0], data[1]];
        let cell = match CellType::from_signature(&tag, index)? {
            CellType::KeyNode => Cell::KeyNode(KeyNode::parse(data, index)?),
            CellType::Value => Cell::Value(ValueCell::parse(data, index)?),
            CellType::Security => Cell::Security(SecurityCell::parse(data, index)?),
            CellType::FastLeaf | CellType::HashLeaf => {
                Cell::SubKeyHashedList(SubKeyHashedList::parse(data, index)?)
            }
            CellType::IndexLeaf | CellType::IndexRoot => {
                Cell::SubKeyIndirectList(SubKeyIndirectList::parse(data, index)?)
            }
            CellType::DataBlock => Cell::BigData(BigDataCell::parse(data, index)?),
        };

        Ok(cell)
    }

    /// Name of this cell's variant.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Cell::KeyNode(_) => KeyNode::NAME,
            Cell::Value(_) => ValueCell::NAME,
            Cell::Security(_) => SecurityCell::NAME,
            Cell::SubKeyHashedList(_) => SubKeyHashedList::NAME,
            Cell::SubKeyIndirectList(_) => SubKeyIndirectList::NAME,
            Cell::BigData(_) => BigDataCell::NAME,
        }
    }

    /// Cell index.
    pub fn index(&self) -> i32 {
        match self {
            Cell::KeyNode(c) => c.index(),
            Cell::Value(c) => c.index(),
            Cell::Security(c) => c.index(),
            Cell::SubKeyHashedList(c) => c.index(),
            Cell::SubKeyIndirectList(c) => c.index(),
            Cell::BigData(c) => c.index(),
        }
    }

    /// Serialized length excluding the length prefix.
    pub fn size(&self) -> usize {
        match self {
            Cell::KeyNode(c) => c.size(),
            Cell::Value(c) => c.size(),
            Cell::Security(c) => c.size(),
            Cell::SubKeyHashedList(c) => c.size(),
            Cell::SubKeyIndirectList(c) => c.size(),
            Cell::BigData(c) => c.size(),
        }
    }

    /// Serializes the cell into `buffer`.
    pub fn write_to(&self, buffer: &mut [u8]) {
        match self {
            Cell::KeyNode(c) => c.write_to(buffer),
            Cell::Value(c) => c.write_to(buffer),
            Cell::Security(c) => c.write_to(buffer),
            Cell::SubKeyHashedList(c) => c.write_to(buffer),
            Cell::SubKeyIndirectList(c) => c.write_to(buffer),
            Cell::BigData(c) => c.write_to(buffer),
        }
    }
}

/// Implements [`CellRecord`] boilerplate for a variant with an `index` field.
macro_rules! impl_cell_variant {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl $crate::cell::CellRecord for $ty {
            const NAME: &'static str = $name;

            fn index(&self) -> i32 {
                self.index
            }

            fn set_index(&mut self, index: i32) {
                self.index = index;
            }

            fn size(&self) -> usize {
                self.serialized_size()
            }

            fn write_to(&self, buffer: &mut [u8]) {
                self.serialize(buffer)
            }

            fn into_cell(self) -> $crate::cell::Cell {
                $crate::cell::Cell::$variant(self)
            }

            fn from_cell(cell: $crate::cell::Cell) -> $crate::error::Result<Self> {
                match cell {
                    $crate::cell::Cell::$variant(inner) => Ok(inner),
                    other => Err($crate::error::RegistryError::UnexpectedCellType {
                        expected: $name,
                        found: other.variant_name(),
                        index: other.index(),
                    }),
                }
            }
        }
    };
}

pub(crate) use impl_cell_variant;
