//! # Windows Registry Hive Engine
//!
//! Reads and writes Windows registry hive files over any
//! `Read + Write + Seek` stream.
//!
//! ## Architecture
//!
//! The engine is built on several layers:
//!
//! 1. **Header (regf)**: Hive metadata, root cell index, used length, checksum
//! 2. **Bins (hbin)**: 4KB-aligned pages holding cell records, each with its own
//!    first-fit allocator
//! 3. **Cells**: Variable-sized records (keys, values, lists, security, big data)
//! 4. **Hive**: Resolves cell indices, allocates, relocates and grows the file
//! 5. **Keys and values**: Path navigation and typed value access
//!
//! ## Binary Layout
//!
//! ```text
//! [Header - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, timestamp, version, root cell
//!   - Checksum
//!
//! [Bins - variable size, 4KB aligned]
//!   [Bin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Values (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//!       - Big data (db)
//! ```
//!
//! ## Examples
//!
//! ```rust
//! use reg_hive::{RegistryHive, ValueData, ValueType};
//! use std::io::Cursor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = RegistryHive::create(Cursor::new(Vec::new()))?;
//! let mut root = hive.root_key()?;
//!
//! let mut key = root.create_subkey("Software\\Example")?;
//! key.set_value("Count", &ValueData::Dword(42))?;
//! key.set_value("", &ValueData::String("default".into()))?;
//!
//! assert_eq!(key.name()?, "Software\\Example");
//! assert_eq!(key.get_value_type("count")?, Some(ValueType::Dword));
//! for value in key.values()? {
//!     println!("{}", value);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Files are opened with [`RegistryHive::open_file`]; every change is written
//! through to the file immediately.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bigdata;
pub mod cell;
pub mod config;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod key;
pub mod registry_key;
pub mod registry_value;
pub mod security;
pub mod subkey_list;
pub mod utils;
pub mod value;

// Re-export main types for convenience
pub use bigdata::BigDataCell;
pub use cell::{Cell, CellRecord, CellType, KeyNodeFlags, ValueType, NO_INDEX};
pub use config::{HiveOptions, DEFAULT_MAX_LEAF_ENTRIES};
pub use error::{ErrorKind, RegistryError, Result};
pub use hbin::{Bin, BinHeader, CellSpan};
pub use header::HiveHeader;
pub use hive::RegistryHive;
pub use key::KeyNode;
pub use registry_key::{RegistryKey, MAX_KEY_NAME_LEN, MAX_VALUE_NAME_LEN};
pub use registry_value::RegistryValue;
pub use security::{SecurityCell, DEFAULT_SECURITY_DESCRIPTOR};
pub use subkey_list::{
    KeyLookup, SubKeyHashedList, SubKeyIndirectList, SubkeyListEntry, SubkeyListType, MAX_LIST_ENTRIES,
};
pub use value::{ValueCell, ValueData};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
