//! Subkey list cells (lf, lh, li, ri) and child lookup.
//!
//! Children of a key are reached through one of four list shapes:
//!
//! - `lf` / `lh`: (child index, name hash) pairs sorted by child name.
//! - `li`: a flat array of child indices.
//! - `ri`: an array of sub-list indices, each sub-list sorted on its own.
//!
//! The cell types here are plain data. Lookup and maintenance need the child
//! names, so they are implemented on [`RegistryHive`].

use crate::cell::{impl_cell_variant, Cell, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::hive::RegistryHive;
use crate::key::KeyNode;
use crate::utils::{compare_names, names_equal, read_i32_le, read_u16_le, read_u32_le, upcase, write_i32_le, write_u16_le, write_u32_le};
use std::cmp::Ordering;
use std::io::{Read, Seek, Write};
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Most entries any list is allowed to reach, one below what its 16-bit
/// count can hold so a leaf can take one child before it is split.
pub const MAX_LIST_ENTRIES: usize = u16::MAX as usize - 1;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of indices.
    IndexLeaf,

    /// Fast leaf (lf) - list with 4-byte name prefixes.
    #[default]
    FastLeaf,

    /// Hash leaf (lh) - list with name hashes.
    HashLeaf,

    /// Index root (ri) - list of sub-list indices.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }

    /// Returns the 2-byte signature.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            SubkeyListType::IndexLeaf => b"li",
            SubkeyListType::FastLeaf => b"lf",
            SubkeyListType::HashLeaf => b"lh",
            SubkeyListType::IndexRoot => b"ri",
        }
    }
}

/// `lh` name hash: `h = h * 37 + upcase(c)` over every character.
pub fn lh_hash(name: &str) -> u32 {
    name.chars()
        .fold(0u32, |h, c| h.wrapping_mul(37).wrapping_add(upcase(c) as u32))
}

/// `lf` name hint: the low byte of the first four characters, NUL padded,
/// packed little-endian.
pub fn lf_hash(name: &str) -> u32 {
    name.chars()
        .chain(std::iter::repeat('\0'))
        .take(4)
        .enumerate()
        .fold(0u32, |h, (i, c)| h | ((c as u32 & 0xFF) << (i * 8)))
}

/// Checks whether an `lf` hint could belong to `name`.
///
/// Non-ASCII positions always match; the caller verifies the full name.
fn lf_prefix_matches(hint: u32, name: &str) -> bool {
    let mut chars = name.chars().chain(std::iter::repeat('\0'));
    (0..4).all(|i| {
        let stored = ((hint >> (i * 8)) & 0xFF) as u8;
        let wanted = chars.next().unwrap_or('\0');
        if !wanted.is_ascii() || !stored.is_ascii() {
            return true;
        }
        stored.to_ascii_uppercase() == (wanted as u8).to_ascii_uppercase()
    })
}

/// Subkey list entry (for lf/lh lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubkeyListEntry {
    /// Index of the child key node.
    pub key_index: i32,

    /// Name hint (first 4 chars for lf, hash for lh).
    pub hash: u32,
}

/// Hashed subkey list (lf/lh) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubKeyHashedList {
    /// Cell index.
    pub index: i32,

    /// `FastLeaf` or `HashLeaf`.
    pub list_type: SubkeyListType,

    /// Entries sorted by child name.
    pub entries: Vec<SubkeyListEntry>,
}

impl SubKeyHashedList {
    /// Creates an empty, unpersisted list.
    ///
    /// Only `FastLeaf` and `HashLeaf` are hashed kinds; anything else falls
    /// back to `FastLeaf`.
    pub fn new(list_type: SubkeyListType) -> Self {
        let list_type = match list_type {
            SubkeyListType::HashLeaf => SubkeyListType::HashLeaf,
            _ => SubkeyListType::FastLeaf,
        };
        Self {
            index: NO_INDEX,
            list_type,
            entries: Vec::new(),
        }
    }

    /// Parses an lf/lh list from cell data.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        check_list_header(data, index)?;
        let list_type = SubkeyListType::from_signature(&[data[0], data[1]])?;
        if !matches!(list_type, SubkeyListType::FastLeaf | SubkeyListType::HashLeaf) {
            return Err(RegistryError::InvalidSubkeyList {
                list_type: [data[0], data[1]],
            });
        }

        let count = read_u16_le(data, 0x02)? as usize;
        let expected_size = 4 + count * 8;
        if data.len() < expected_size {
            return Err(RegistryError::TruncatedData {
                offset: index as u32,
                expected: expected_size,
                actual: data.len(),
            });
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let pos = 4 + i * 8;
            entries.push(SubkeyListEntry {
                key_index: read_i32_le(data, pos)?,
                hash: read_u32_le(data, pos + 4)?,
            });
        }

        Ok(Self {
            index,
            list_type,
            entries,
        })
    }

    fn serialized_size(&self) -> usize {
        4 + self.entries.len() * 8
    }

    fn serialize(&self, buffer: &mut [u8]) {
        buffer[0..2].copy_from_slice(self.list_type.signature());
        write_u16_le(buffer, 0x02, self.entries.len() as u16);
        for (i, entry) in self.entries.iter().enumerate() {
            write_i32_le(buffer, 4 + i * 8, entry.key_index);
            write_u32_le(buffer, 4 + i * 8 + 4, entry.hash);
        }
    }

    /// Computes this list's hash for `name`.
    pub fn calc_hash(&self, name: &str) -> u32 {
        match self.list_type {
            SubkeyListType::HashLeaf => lh_hash(name),
            _ => lf_hash(name),
        }
    }

    /// Positions whose hash could belong to `name`.
    pub fn candidates<'a>(&'a self, name: &'a str) -> impl Iterator<Item = usize> + 'a {
        let lh = (self.list_type == SubkeyListType::HashLeaf).then(|| lh_hash(name));
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, entry)| match lh {
                Some(hash) => entry.hash == hash,
                None => lf_prefix_matches(entry.hash, name),
            })
            .map(|(i, _)| i)
    }

    /// Inserts a child at `pos`.
    pub fn insert(&mut self, pos: usize, name: &str, key_index: i32) {
        let hash = self.calc_hash(name);
        self.entries.insert(pos, SubkeyListEntry { key_index, hash });
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl_cell_variant!(SubKeyHashedList, SubKeyHashedList, "SubKeyHashedList");

/// Indirect subkey list (li/ri) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubKeyIndirectList {
    /// Cell index.
    pub index: i32,

    /// `IndexLeaf` or `IndexRoot`.
    pub list_type: SubkeyListType,

    /// Child key indices (li) or sub-list indices (ri).
    pub entries: Vec<i32>,
}

impl SubKeyIndirectList {
    /// Creates an empty, unpersisted list.
    pub fn new(list_type: SubkeyListType) -> Self {
        Self {
            index: NO_INDEX,
            list_type,
            entries: Vec::new(),
        }
    }

    /// Parses an li/ri list from cell data.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        check_list_header(data, index)?;
        let list_type = SubkeyListType::from_signature(&[data[0], data[1]])?;
        if !matches!(list_type, SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot) {
            return Err(RegistryError::InvalidSubkeyList {
                list_type: [data[0], data[1]],
            });
        }

        let count = read_u16_le(data, 0x02)? as usize;
        let expected_size = 4 + count * 4;
        if data.len() < expected_size {
            return Err(RegistryError::TruncatedData {
                offset: index as u32,
                expected: expected_size,
                actual: data.len(),
            });
        }

        let entries = (0..count)
            .map(|i| read_i32_le(data, 4 + i * 4))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            index,
            list_type,
            entries,
        })
    }

    fn serialized_size(&self) -> usize {
        4 + self.entries.len() * 4
    }

    fn serialize(&self, buffer: &mut [u8]) {
        buffer[0..2].copy_from_slice(self.list_type.signature());
        write_u16_le(buffer, 0x02, self.entries.len() as u16);
        for (i, entry) in self.entries.iter().enumerate() {
            write_i32_le(buffer, 4 + i * 4, *entry);
        }
    }

    /// Returns true if this is an index root (contains sub-lists).
    pub fn is_index_root(&self) -> bool {
        self.list_type == SubkeyListType::IndexRoot
    }
}

impl_cell_variant!(SubKeyIndirectList, SubKeyIndirectList, "SubKeyIndirectList");

/// Where a name falls relative to a subkey list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookup {
    /// The child with this name, by cell index.
    Found(i32),
    /// Absent; the name sorts before the last entry of the list.
    Before,
    /// Absent; the name sorts after every entry of the list.
    After,
}

impl<S: Read + Write + Seek> RegistryHive<S> {
    /// Looks a child name up in the list at `list_index`.
    pub fn find_subkey_in(&self, list_index: i32, name: &str) -> Result<KeyLookup> {
        match self.any_cell(list_index)? {
            Cell::SubKeyHashedList(list) => {
                let keys: Vec<i32> = list.entries.iter().map(|e| e.key_index).collect();
                if let Some(lookup) = self.check_bounds(&keys, name)? {
                    return Ok(lookup);
                }
                for pos in list.candidates(name) {
                    let node: KeyNode = self.cell(list.entries[pos].key_index)?;
                    if names_equal(&node.name, name) {
                        return Ok(KeyLookup::Found(node.index));
                    }
                }
                Ok(KeyLookup::Before)
            }
            Cell::SubKeyIndirectList(list) if !list.is_index_root() => {
                if let Some(lookup) = self.check_bounds(&list.entries, name)? {
                    return Ok(lookup);
                }
                for &key_index in &list.entries {
                    let node: KeyNode = self.cell(key_index)?;
                    if names_equal(&node.name, name) {
                        return Ok(KeyLookup::Found(key_index));
                    }
                }
                Ok(KeyLookup::Before)
            }
            Cell::SubKeyIndirectList(list) => {
                let (Some(&first), Some(&last)) = (list.entries.first(), list.entries.last()) else {
                    return Ok(KeyLookup::Before);
                };

                let result = self.find_subkey_in(first, name)?;
                if result != KeyLookup::After {
                    return Ok(result);
                }

                let result = self.find_subkey_in(last, name)?;
                if result != KeyLookup::Before {
                    return Ok(result);
                }

                for &sub_list in &list.entries[1..list.entries.len() - 1] {
                    if let KeyLookup::Found(index) = self.find_subkey_in(sub_list, name)? {
                        return Ok(KeyLookup::Found(index));
                    }
                }
                Ok(KeyLookup::Before)
            }
            other => Err(not_a_list(&other)),
        }
    }

    /// Links a child into the list at `list_index`, keeping it sorted.
    ///
    /// A leaf that grows past [`HiveOptions::max_leaf_entries`] is split in
    /// two; a top-level leaf is then placed under a new `ri`. Returns the
    /// list's index, which changes if the list was relocated or wrapped.
    ///
    /// [`HiveOptions::max_leaf_entries`]: crate::HiveOptions::max_leaf_entries
    pub fn link_subkey_in(&mut self, list_index: i32, name: &str, key_index: i32) -> Result<i32> {
        let list_index = self.insert_child(list_index, name, key_index)?;
        if let Cell::SubKeyIndirectList(list) = self.any_cell(list_index)? {
            if list.is_index_root() {
                return Ok(list_index);
            }
        }

        let leaves = self.split_leaf(list_index)?;
        if leaves.len() == 1 {
            return Ok(list_index);
        }

        let mut root = SubKeyIndirectList::new(SubkeyListType::IndexRoot);
        root.entries = leaves;
        let root_index = self.update_cell(&mut root, true)?;
        debug!(
            index = format_args!("{:#x}", root_index),
            "Moved full subkey leaf under an index root"
        );
        Ok(root_index)
    }

    fn insert_child(&mut self, list_index: i32, name: &str, key_index: i32) -> Result<i32> {
        match self.any_cell(list_index)? {
            Cell::SubKeyHashedList(mut list) => {
                let keys: Vec<i32> = list.entries.iter().map(|e| e.key_index).collect();
                let pos = self.insert_position(&keys, name)?;
                list.insert(pos, name, key_index);
                self.update_cell(&mut list, true)
            }
            Cell::SubKeyIndirectList(mut list) if !list.is_index_root() => {
                let pos = self.insert_position(&list.entries, name)?;
                list.entries.insert(pos, key_index);
                self.update_cell(&mut list, true)
            }
            Cell::SubKeyIndirectList(mut list) => {
                if list.entries.is_empty() {
                    warn!(
                        index = format_args!("{:#x}", list_index),
                        "Index root has no sub-lists, starting a new one"
                    );
                    let mut sub_list = SubKeyHashedList::new(self.options().subkey_list_type);
                    sub_list.insert(0, name, key_index);
                    let sub_index = self.update_cell(&mut sub_list, true)?;
                    list.entries.push(sub_index);
                } else {
                    if list.entries.len() >= MAX_LIST_ENTRIES {
                        return Err(RegistryError::InvalidArgument(format!(
                            "Index root {:#x} cannot hold more sub-lists",
                            list_index
                        )));
                    }
                    let last = list.entries.len() - 1;
                    let mut target = last;
                    for i in 0..last {
                        if self.find_subkey_in(list.entries[i], name)? != KeyLookup::After {
                            target = i;
                            break;
                        }
                    }
                    let sub_index = self.insert_child(list.entries[target], name, key_index)?;
                    let leaves = self.split_leaf(sub_index)?;
                    list.entries[target] = leaves[0];
                    if let Some(&upper) = leaves.get(1) {
                        list.entries.insert(target + 1, upper);
                    }
                }
                self.update_cell(&mut list, true)
            }
            other => Err(not_a_list(&other)),
        }
    }

    /// Removes a child from the list at `list_index`.
    ///
    /// Returns the list's index. Emptied `ri` sub-lists are freed.
    pub fn unlink_subkey_in(&mut self, list_index: i32, name: &str) -> Result<i32> {
        match self.any_cell(list_index)? {
            Cell::SubKeyHashedList(mut list) => {
                let mut found = None;
                for pos in list.candidates(name) {
                    let node: KeyNode = self.cell(list.entries[pos].key_index)?;
                    if names_equal(&node.name, name) {
                        found = Some(pos);
                        break;
                    }
                }
                match found {
                    Some(pos) => {
                        list.entries.remove(pos);
                        self.update_cell(&mut list, true)
                    }
                    None => Ok(list.index),
                }
            }
            Cell::SubKeyIndirectList(mut list) if !list.is_index_root() => {
                let mut found = None;
                for (pos, &key_index) in list.entries.iter().enumerate() {
                    let node: KeyNode = self.cell(key_index)?;
                    if names_equal(&node.name, name) {
                        found = Some(pos);
                        break;
                    }
                }
                match found {
                    Some(pos) => {
                        list.entries.remove(pos);
                        self.update_cell(&mut list, true)
                    }
                    None => Ok(list.index),
                }
            }
            Cell::SubKeyIndirectList(mut list) => {
                for i in 0..list.entries.len() {
                    if self.find_subkey_in(list.entries[i], name)? == KeyLookup::After {
                        continue;
                    }

                    let sub_index = self.unlink_subkey_in(list.entries[i], name)?;
                    if self.subkey_count_in(sub_index)? == 0 {
                        self.free_subkey_list(sub_index)?;
                        list.entries.remove(i);
                    } else {
                        list.entries[i] = sub_index;
                    }
                    return self.update_cell(&mut list, true);
                }
                Ok(list.index)
            }
            other => Err(not_a_list(&other)),
        }
    }

    /// Number of children reachable through the list at `list_index`.
    pub fn subkey_count_in(&self, list_index: i32) -> Result<usize> {
        match self.any_cell(list_index)? {
            Cell::SubKeyHashedList(list) => Ok(list.len()),
            Cell::SubKeyIndirectList(list) if !list.is_index_root() => Ok(list.entries.len()),
            Cell::SubKeyIndirectList(list) => {
                let mut total = 0;
                for sub in list.entries {
                    total += self.subkey_count_in(sub)?;
                }
                Ok(total)
            }
            other => Err(not_a_list(&other)),
        }
    }

    /// Child key indices reachable through the list at `list_index`, in
    /// list order.
    pub fn subkey_indices_in(&self, list_index: i32) -> Result<Vec<i32>> {
        let mut indices = Vec::new();
        self.collect_subkey_indices(list_index, &mut indices)?;
        Ok(indices)
    }

    fn collect_subkey_indices(&self, list_index: i32, out: &mut Vec<i32>) -> Result<()> {
        match self.any_cell(list_index)? {
            Cell::SubKeyHashedList(list) => out.extend(list.entries.iter().map(|e| e.key_index)),
            Cell::SubKeyIndirectList(list) if !list.is_index_root() => out.extend(&list.entries),
            Cell::SubKeyIndirectList(list) => {
                for sub in list.entries {
                    self.collect_subkey_indices(sub, out)?;
                }
            }
            other => return Err(not_a_list(&other)),
        }
        Ok(())
    }

    /// Frees a subkey list cell and, for `ri`, every sub-list.
    pub fn free_subkey_list(&mut self, list_index: i32) -> Result<()> {
        if let Cell::SubKeyIndirectList(list) = self.any_cell(list_index)? {
            if list.is_index_root() {
                for sub in list.entries {
                    self.free_subkey_list(sub)?;
                }
            }
        }
        self.free_cell(list_index)
    }

    /// Splits a leaf holding more than the configured maximum into two
    /// halves, returning the leaves that replace it in order.
    fn split_leaf(&mut self, leaf_index: i32) -> Result<Vec<i32>> {
        let max = self.options().max_leaf_entries.clamp(2, MAX_LIST_ENTRIES);
        let split_index = match self.any_cell(leaf_index)? {
            Cell::SubKeyHashedList(mut list) if list.len() > max => {
                let half = list.len() / 2;
                let tail = list.entries.split_off(half);
                self.update_cell(&mut list, true)?;
                let mut upper = SubKeyHashedList {
                    index: NO_INDEX,
                    list_type: list.list_type,
                    entries: tail,
                };
                self.update_cell(&mut upper, true)?
            }
            Cell::SubKeyIndirectList(mut list) if !list.is_index_root() && list.entries.len() > max => {
                let half = list.entries.len() / 2;
                let tail = list.entries.split_off(half);
                self.update_cell(&mut list, true)?;
                let mut upper = SubKeyIndirectList {
                    index: NO_INDEX,
                    list_type: list.list_type,
                    entries: tail,
                };
                self.update_cell(&mut upper, true)?
            }
            _ => return Ok(vec![leaf_index]),
        };

        debug!(
            leaf = format_args!("{:#x}", leaf_index),
            upper = format_args!("{:#x}", split_index),
            "Split subkey leaf"
        );
        Ok(vec![leaf_index, split_index])
    }

    /// Compares `name` against the first and last children of a leaf list.
    fn check_bounds(&self, keys: &[i32], name: &str) -> Result<Option<KeyLookup>> {
        let (Some(&first), Some(&last)) = (keys.first(), keys.last()) else {
            return Ok(Some(KeyLookup::Before));
        };

        let node: KeyNode = self.cell(first)?;
        match compare_names(name, &node.name) {
            Ordering::Less => return Ok(Some(KeyLookup::Before)),
            Ordering::Equal => return Ok(Some(KeyLookup::Found(first))),
            Ordering::Greater => {}
        }

        let node: KeyNode = self.cell(last)?;
        match compare_names(name, &node.name) {
            Ordering::Greater => Ok(Some(KeyLookup::After)),
            Ordering::Equal => Ok(Some(KeyLookup::Found(last))),
            Ordering::Less => Ok(None),
        }
    }

    /// First position whose child name sorts after `name`.
    fn insert_position(&self, keys: &[i32], name: &str) -> Result<usize> {
        for (pos, &key_index) in keys.iter().enumerate() {
            let node: KeyNode = self.cell(key_index)?;
            if compare_names(name, &node.name) == Ordering::Less {
                return Ok(pos);
            }
        }
        Ok(keys.len())
    }
}

fn check_list_header(data: &[u8], index: i32) -> Result<()> {
    if data.len() < 4 {
        return Err(RegistryError::TruncatedData {
            offset: index as u32,
            expected: 4,
            actual: data.len(),
        });
    }
    Ok(())
}

fn not_a_list(cell: &Cell) -> RegistryError {
    RegistryError::UnexpectedCellType {
        expected: "subkey list",
        found: cell.variant_name(),
        index: cell.index(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellRecord;

    #[test]
    fn test_subkey_list_type() {
        assert_eq!(
            SubkeyListType::from_signature(b"li").unwrap(),
            SubkeyListType::IndexLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lf").unwrap(),
            SubkeyListType::FastLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lh").unwrap(),
            SubkeyListType::HashLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"ri").unwrap(),
            SubkeyListType::IndexRoot
        );
        assert!(SubkeyListType::from_signature(b"XX").is_err());
    }

    #[test]
    fn test_lh_hash() {
        assert_eq!(lh_hash(""), 0);
        assert_eq!(lh_hash("a"), 'A' as u32);
        assert_eq!(lh_hash("ab"), ('A' as u32) * 37 + 'B' as u32);
        assert_eq!(lh_hash("Software"), lh_hash("SOFTWARE"));
    }

    #[test]
    fn test_lf_hash() {
        assert_eq!(lf_hash("Ab"), u32::from_le_bytes([b'A', b'b', 0, 0]));
        assert_eq!(lf_hash("Software"), u32::from_le_bytes(*b"Soft"));
        assert!(lf_prefix_matches(lf_hash("Software"), "SOFTWARE"));
        assert!(lf_prefix_matches(lf_hash("Ab"), "ab"));
        assert!(!lf_prefix_matches(lf_hash("Ab"), "abc"));
        assert!(!lf_prefix_matches(lf_hash("Alpha"), "Bravo"));
    }

    #[test]
    fn test_hashed_candidates() {
        let mut list = SubKeyHashedList::new(SubkeyListType::HashLeaf);
        list.insert(0, "Alpha", 0x20);
        list.insert(1, "Bravo", 0x40);
        assert_eq!(list.candidates("BRAVO").collect::<Vec<_>>(), vec![1]);
        assert_eq!(list.candidates("Delta").count(), 0);

        let mut list = SubKeyHashedList::new(SubkeyListType::FastLeaf);
        list.insert(0, "Alpha1", 0x20);
        list.insert(1, "Alpha2", 0x40);
        assert_eq!(list.candidates("alpha2").count(), 2);
    }

    #[test]
    fn test_hashed_list_round_trip() {
        let mut list = SubKeyHashedList::new(SubkeyListType::HashLeaf);
        list.index = 0x80;
        list.insert(0, "Alpha", 0x20);
        list.insert(1, "Bravo", 0x40);

        let mut buffer = vec![0u8; list.size()];
        list.write_to(&mut buffer);
        assert_eq!(&buffer[0..2], b"lh");
        assert_eq!(SubKeyHashedList::parse(&buffer, 0x80).unwrap(), list);
    }

    #[test]
    fn test_indirect_list_round_trip() {
        let mut list = SubKeyIndirectList::new(SubkeyListType::IndexRoot);
        list.index = 0x100;
        list.entries = vec![0x20, 0x40, 0x60];

        let mut buffer = vec![0u8; list.size()];
        list.write_to(&mut buffer);
        assert_eq!(buffer.len(), 16);
        assert_eq!(SubKeyIndirectList::parse(&buffer, 0x100).unwrap(), list);

        match Cell::parse(&buffer, 0x100).unwrap() {
            Cell::SubKeyIndirectList(parsed) => assert!(parsed.is_index_root()),
            other => panic!("unexpected cell {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_list_tag() {
        let data = [b'l', b'i', 0, 0];
        assert!(SubKeyHashedList::parse(&data, 0).is_err());
    }

    type MemHive = RegistryHive<std::io::Cursor<Vec<u8>>>;

    /// Creates `names` under a fresh key and returns the hive, that key's
    /// index and the children's indices.
    fn hive_with_children(names: &[&str]) -> (MemHive, i32, Vec<i32>) {
        let mut hive = RegistryHive::create(std::io::Cursor::new(Vec::new())).unwrap();
        let (parent, children) = {
            let mut root = hive.root_key().unwrap();
            let mut parent = root.create_subkey("Parent").unwrap();
            let children: Vec<i32> = names
                .iter()
                .map(|name| parent.create_subkey(name).unwrap().index())
                .collect();
            (parent.index(), children)
        };
        (hive, parent, children)
    }

    fn persist_leaf(hive: &mut MemHive, children: &[(&str, i32)]) -> i32 {
        let mut list = SubKeyHashedList::new(SubkeyListType::FastLeaf);
        for (pos, (name, index)) in children.iter().enumerate() {
            list.insert(pos, name, *index);
        }
        hive.update_cell(&mut list, true).unwrap()
    }

    #[test]
    fn test_find_in_hashed_lists() {
        for list_type in [SubkeyListType::FastLeaf, SubkeyListType::HashLeaf] {
            let (mut hive, _, children) = hive_with_children(&["Alpha", "Bravo", "Charlie"]);
            let mut list = SubKeyHashedList::new(list_type);
            for (pos, (name, index)) in ["Alpha", "Bravo", "Charlie"].iter().zip(&children).enumerate() {
                list.insert(pos, name, *index);
            }
            let list_index = hive.update_cell(&mut list, true).unwrap();

            for (name, index) in ["alpha", "BRAVO", "Charlie"].iter().zip(&children) {
                assert_eq!(hive.find_subkey_in(list_index, name).unwrap(), KeyLookup::Found(*index));
            }
            assert_eq!(hive.find_subkey_in(list_index, "Delta").unwrap(), KeyLookup::After);
            assert_eq!(hive.find_subkey_in(list_index, "Bz").unwrap(), KeyLookup::Before);
            assert_eq!(hive.find_subkey_in(list_index, "Aa").unwrap(), KeyLookup::Before);
        }
    }

    #[test]
    fn test_index_root_link_and_unlink() {
        let names = ["Alpha", "Bravo", "Charlie", "Delta", "Echo"];
        let (mut hive, parent_index, children) = hive_with_children(&names);

        let first = persist_leaf(&mut hive, &[("Alpha", children[0]), ("Bravo", children[1])]);
        let last = persist_leaf(&mut hive, &[("Delta", children[3]), ("Echo", children[4])]);
        let mut root_list = SubKeyIndirectList::new(SubkeyListType::IndexRoot);
        root_list.entries = vec![first, last];
        let ri = hive.update_cell(&mut root_list, true).unwrap();

        let mut parent: KeyNode = hive.cell(parent_index).unwrap();
        hive.free_subkey_list(parent.subkey_list).unwrap();
        parent.subkey_list = ri;
        hive.update_cell(&mut parent, false).unwrap();

        assert_eq!(hive.find_subkey_in(ri, "Charlie").unwrap(), KeyLookup::Before);
        assert_eq!(hive.find_subkey_in(ri, "echo").unwrap(), KeyLookup::Found(children[4]));
        assert_eq!(hive.find_subkey_in(ri, "Zulu").unwrap(), KeyLookup::After);

        let ri = hive.link_subkey_in(ri, "Charlie", children[2]).unwrap();
        assert_eq!(hive.find_subkey_in(ri, "CHARLIE").unwrap(), KeyLookup::Found(children[2]));
        assert_eq!(hive.subkey_count_in(ri).unwrap(), 5);
        assert_eq!(hive.subkey_indices_in(ri).unwrap(), children);
        assert_eq!(hive.find_child(parent_index, "charlie").unwrap(), Some(children[2]));

        let ri = hive.unlink_subkey_in(ri, "Alpha").unwrap();
        let ri = hive.unlink_subkey_in(ri, "Bravo").unwrap();
        assert_eq!(hive.get_cell::<SubKeyHashedList>(first).unwrap(), None);
        match hive.any_cell(ri).unwrap() {
            Cell::SubKeyIndirectList(list) => assert_eq!(list.entries.len(), 1),
            other => panic!("unexpected cell {:?}", other),
        }
        assert_eq!(hive.subkey_count_in(ri).unwrap(), 3);

        let remaining = hive.subkey_indices_in(ri).unwrap();
        assert_eq!(remaining, children[2..].to_vec());
        let Cell::SubKeyIndirectList(list) = hive.any_cell(ri).unwrap() else {
            panic!("index root expected");
        };
        hive.free_subkey_list(ri).unwrap();
        assert_eq!(hive.get_cell::<SubKeyHashedList>(list.entries[0]).unwrap(), None);
        assert_eq!(hive.get_cell::<SubKeyIndirectList>(ri).unwrap(), None);
    }

    #[test]
    fn test_full_leaf_splits_under_index_root() {
        let options = crate::HiveOptions::default().with_max_leaf_entries(4);
        let mut hive = RegistryHive::create_with_options(std::io::Cursor::new(Vec::new()), options).unwrap();
        let root_index = hive.root_index();
        let names: Vec<String> = (0..5).map(|i| format!("Key{}", i)).collect();

        {
            let mut root = hive.root_key().unwrap();
            for name in &names[..4] {
                root.create_subkey(name).unwrap();
            }
        }
        let list = hive.root_node().unwrap().subkey_list;
        assert!(matches!(hive.any_cell(list).unwrap(), Cell::SubKeyHashedList(leaf) if leaf.len() == 4));

        hive.root_key().unwrap().create_subkey(&names[4]).unwrap();
        let list = hive.root_node().unwrap().subkey_list;
        let Cell::SubKeyIndirectList(ri) = hive.any_cell(list).unwrap() else {
            panic!("index root expected");
        };
        assert!(ri.is_index_root());
        let sizes: Vec<usize> = ri.entries.iter().map(|&leaf| hive.subkey_count_in(leaf).unwrap()).collect();
        assert_eq!(sizes, vec![2, 3]);

        for name in &names {
            assert!(hive.find_child(root_index, name).unwrap().is_some(), "missing {}", name);
        }
        let found: Vec<String> = hive
            .subkey_indices_in(list)
            .unwrap()
            .into_iter()
            .map(|index| hive.cell::<KeyNode>(index).unwrap().name)
            .collect();
        assert_eq!(found, names);
    }

    #[test]
    fn test_link_into_empty_index_root() {
        let (mut hive, _, children) = hive_with_children(&["Only"]);
        let mut root_list = SubKeyIndirectList::new(SubkeyListType::IndexRoot);
        let ri = hive.update_cell(&mut root_list, true).unwrap();

        assert_eq!(hive.find_subkey_in(ri, "Only").unwrap(), KeyLookup::Before);
        let ri = hive.link_subkey_in(ri, "Only", children[0]).unwrap();
        assert_eq!(hive.find_subkey_in(ri, "only").unwrap(), KeyLookup::Found(children[0]));
    }
}
