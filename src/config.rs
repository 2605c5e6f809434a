//! Construction-time hive options.

use crate::security::DEFAULT_SECURITY_DESCRIPTOR;
use crate::subkey_list::{SubkeyListType, MAX_LIST_ENTRIES};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options used when creating or opening a hive.
///
/// # Examples
///
/// ```rust
/// use reg_hive::{HiveOptions, SubkeyListType};
///
/// let options = HiveOptions::default()
///     .with_file_name("\\REGISTRY\\MACHINE\\TEST")
///     .with_subkey_list_type(SubkeyListType::HashLeaf);
/// assert_eq!(options.subkey_list_type, SubkeyListType::HashLeaf);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HiveOptions {
    /// Path recorded in the header of newly created hives.
    pub file_name: String,

    /// List kind used for newly created child indices (`lf` or `lh`).
    pub subkey_list_type: SubkeyListType,

    /// Security descriptor given to the root key of a new hive.
    pub security_descriptor: Vec<u8>,

    /// Children a single leaf list holds before it is split under an `ri`.
    pub max_leaf_entries: usize,
}

/// Leaf size at which Windows splits child lists.
pub const DEFAULT_MAX_LEAF_ENTRIES: usize = 1012;

impl Default for HiveOptions {
    fn default() -> Self {
        Self {
            file_name: String::new(),
            subkey_list_type: SubkeyListType::FastLeaf,
            security_descriptor: DEFAULT_SECURITY_DESCRIPTOR.to_vec(),
            max_leaf_entries: DEFAULT_MAX_LEAF_ENTRIES,
        }
    }
}

impl HiveOptions {
    /// Sets the path recorded in the header.
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Sets the list kind for new child indices.
    ///
    /// Only `FastLeaf` and `HashLeaf` are used; other kinds fall back to
    /// `FastLeaf` when a list is created.
    pub fn with_subkey_list_type(mut self, list_type: SubkeyListType) -> Self {
        self.subkey_list_type = list_type;
        self
    }

    /// Sets how many children a leaf list holds before it is split.
    ///
    /// Clamped to between 2 and [`MAX_LIST_ENTRIES`].
    pub fn with_max_leaf_entries(mut self, max: usize) -> Self {
        self.max_leaf_entries = max.clamp(2, MAX_LIST_ENTRIES);
        self
    }

    /// Sets the root key's security descriptor.
    pub fn with_security_descriptor(mut self, descriptor: impl Into<Vec<u8>>) -> Self {
        self.security_descriptor = descriptor.into();
        self
    }
}
