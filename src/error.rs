//! Error types for hive operations.
//!
//! Every failure surfaced by this crate is a [`RegistryError`]. Errors are
//! grouped into broad classes by [`RegistryError::kind`] so callers can tell a
//! damaged hive apart from a mistake in how the API was driven.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Broad classification of a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The hive's on-disk structures are damaged or not understood.
    Corruption,
    /// The caller asked for something the hive state does not allow.
    Misuse,
    /// An allocation could not be satisfied even after growing the hive.
    Capacity,
    /// The backing stream failed.
    Io,
}

/// Errors that can occur while reading or mutating a hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error from the backing stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in a header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        /// Signature that should have been present.
        expected: Vec<u8>,
        /// Bytes actually found.
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Hive is too small to hold the structure being read.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        /// Bytes available.
        size: usize,
        /// Bytes required.
        minimum: usize,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum computed over the header bytes.
        calculated: u32,
    },

    /// The two header sequence counters differ, meaning a log was never replayed.
    #[error("Sequence mismatch: primary {primary}, secondary {secondary} (log replay required)")]
    SequenceMismatch {
        /// First sequence counter.
        primary: u32,
        /// Second sequence counter.
        secondary: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version found.
        major: u32,
        /// Minor version found.
        minor: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        /// Offset or cell index being read.
        offset: u32,
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Cell length prefix is invalid or corrupted.
    #[error("Invalid cell size: {size} at index {index:#x}")]
    InvalidCellSize {
        /// Raw length prefix.
        size: i32,
        /// Index of the record.
        index: i32,
    },

    /// Unknown or unsupported cell type tag.
    #[error("Unknown cell type: {cell_type:?} at index {index:#x}")]
    UnknownCellType {
        /// The two tag bytes.
        cell_type: [u8; 2],
        /// Index of the record.
        index: i32,
    },

    /// A cell of one variant was found where another was required.
    #[error("Unexpected cell at index {index:#x}: expected {expected}, found {found}")]
    UnexpectedCellType {
        /// Variant that was required.
        expected: &'static str,
        /// Variant that was found.
        found: &'static str,
        /// Index of the record.
        index: i32,
    },

    /// No bin contains the given cell index.
    #[error("No bin contains cell index {index:#x} (hive length: {hive_length:#x})")]
    NoOwningBin {
        /// Index that could not be resolved.
        index: i32,
        /// Hive data length at the time.
        hive_length: u32,
    },

    /// A cell that had to be allocated is free (or absent).
    #[error("No allocated cell at index {index:#x}")]
    CellNotAllocated {
        /// Index of the record.
        index: i32,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList {
        /// The two tag bytes.
        list_type: [u8; 2],
    },

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        /// Index of the record holding the string.
        offset: u32,
    },

    /// Inline value data on a type that never stores it inline.
    #[error("Inline data not valid for value type {value_type:#x} (length {length})")]
    InvalidInlineData {
        /// Raw value type.
        value_type: u32,
        /// Inline length.
        length: u32,
    },

    /// Attempt to free a cell that is already free.
    #[error("Attempt to free non-allocated cell at index {index:#x}")]
    CellAlreadyFree {
        /// Index of the record.
        index: i32,
    },

    /// Allocation size must be a positive multiple of 8.
    #[error("Invalid cell allocation size: {size}")]
    InvalidAllocationSize {
        /// Requested size.
        size: usize,
    },

    /// Cell outgrew its allocation and relocation was not permitted.
    #[error("Cell at index {index:#x} needs {required} bytes but only {allocated} are allocated, and relocation is disabled")]
    CellSizeExceeded {
        /// Index of the record.
        index: i32,
        /// Bytes the record now needs (with length prefix).
        required: usize,
        /// Bytes currently allocated.
        allocated: usize,
    },

    /// A relocated cell did not fit its freshly allocated space.
    #[error("Failed to migrate cell at index {index:#x} to a new location")]
    RelocationFailed {
        /// Original index of the record.
        index: i32,
    },

    /// The allocator could not satisfy a request even after growing the hive.
    #[error("Unable to allocate {size} bytes")]
    AllocationFailed {
        /// Requested size.
        size: usize,
    },

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key still has children and cannot be deleted.
    #[error("The registry key has subkeys: {0}")]
    HasSubkeys(String),

    /// The root key can never be deleted.
    #[error("Attempt to delete the root key")]
    DeleteRoot,

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    ///
    /// # Arguments
    ///
    /// * `expected` - Expected signature bytes
    /// * `found` - Actual signature bytes found
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid cell size error with context.
    pub fn invalid_cell_size(size: i32, index: i32) -> Self {
        Self::InvalidCellSize { size, index }
    }

    /// Creates a format error with detailed context.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_hive::error::RegistryError;
    /// let err = RegistryError::format_error(
    ///     format!("Bin offset mismatch at {:#x}", 0x1000)
    /// );
    /// ```
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error with context about what was being searched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_hive::error::RegistryError;
    /// let err = RegistryError::not_found("value", "DisplayName");
    /// assert_eq!(err.to_string(), "Not found: value 'DisplayName'");
    /// ```
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates an unknown cell type error.
    pub fn unknown_cell_type(cell_type: [u8; 2], index: i32) -> Self {
        Self::UnknownCellType { cell_type, index }
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::AllocationFailed { .. } => ErrorKind::Capacity,
            Self::CellAlreadyFree { .. }
            | Self::InvalidAllocationSize { .. }
            | Self::CellSizeExceeded { .. }
            | Self::NotFound(_)
            | Self::HasSubkeys(_)
            | Self::DeleteRoot
            | Self::InvalidArgument(_) => ErrorKind::Misuse,
            _ => ErrorKind::Corruption,
        }
    }

    /// Returns true if this error indicates a damaged hive.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}
