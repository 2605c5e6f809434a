//! Registry keys: path navigation, subkey and value maintenance.
//!
//! A [`RegistryKey`] is a handle holding a mutable borrow of its hive and the
//! index of its key node. The node itself is re-read from the hive on every
//! call, so a handle never works on stale data after a mutation.

use crate::cell::{KeyNodeFlags, ValueType, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::hive::RegistryHive;
use crate::key::KeyNode;
use crate::registry_value::{utf16_len, RegistryValue};
use crate::security::SecurityCell;
use crate::subkey_list::{KeyLookup, SubKeyHashedList};
use crate::utils::{encode_utf16, filetime_now, read_utf16_string};
use crate::value::{ValueCell, ValueData};
use chrono::{DateTime, Utc};
use std::io::{Read, Seek, Write};
use tracing::debug;

/// Longest key name accepted, in characters.
pub const MAX_KEY_NAME_LEN: usize = 255;

/// Longest value name accepted, in characters.
pub const MAX_VALUE_NAME_LEN: usize = 16_383;

/// Deepest parent chain followed when building a key path.
const MAX_KEY_DEPTH: usize = 512;

/// A key in a hive.
pub struct RegistryKey<'h, S> {
    hive: &'h mut RegistryHive<S>,
    index: i32,
}

impl<'h, S: Read + Write + Seek> RegistryKey<'h, S> {
    pub(crate) fn new(hive: &'h mut RegistryHive<S>, index: i32) -> Self {
        Self { hive, index }
    }

    /// Cell index of this key's node.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Reads this key's node.
    pub fn node(&self) -> Result<KeyNode> {
        self.hive.cell(self.index)
    }

    /// Returns the hive this key lives in.
    pub fn hive(&self) -> &RegistryHive<S> {
        &*self.hive
    }

    /// Returns this key's own name (last path segment).
    pub fn local_name(&self) -> Result<String> {
        Ok(self.node()?.name)
    }

    /// Returns the key's full path.
    ///
    /// The root key is named by its own name; every other key's path is
    /// its ancestors' names below the root joined with `\`.
    pub fn name(&self) -> Result<String> {
        let mut node = self.node()?;
        if node.is_root() {
            return Ok(node.name);
        }

        let mut segments = Vec::new();
        while !node.is_root() {
            if segments.len() >= MAX_KEY_DEPTH {
                return Err(RegistryError::InvalidFormat(format!(
                    "Parent chain of key {:#x} is deeper than {}",
                    self.index, MAX_KEY_DEPTH
                )));
            }
            let parent = node.parent;
            segments.push(node.name);
            node = self.hive.cell(parent)?;
        }

        segments.reverse();
        Ok(segments.join("\\"))
    }

    /// Returns the parent key, or `None` for the root.
    pub fn parent(&mut self) -> Result<Option<RegistryKey<'_, S>>> {
        let node = self.node()?;
        if node.is_root() {
            return Ok(None);
        }
        let parent: KeyNode = self.hive.cell(node.parent)?;
        Ok(Some(RegistryKey::new(&mut *self.hive, parent.index)))
    }

    /// Returns the key's flags.
    pub fn flags(&self) -> Result<KeyNodeFlags> {
        Ok(self.node()?.flags)
    }

    /// Returns the last written time.
    pub fn timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.node()?.timestamp_datetime())
    }

    /// Number of direct subkeys.
    pub fn subkey_count(&self) -> Result<u32> {
        Ok(self.node()?.subkey_count)
    }

    /// Number of values.
    pub fn value_count(&self) -> Result<u32> {
        Ok(self.node()?.value_count)
    }

    /// Opens a subkey by relative path (case-insensitive).
    ///
    /// An empty path opens this key again. Returns `None` if any segment is
    /// missing.
    pub fn open_subkey(&mut self, path: &str) -> Result<Option<RegistryKey<'_, S>>> {
        match self.resolve(path)? {
            Some(index) => Ok(Some(RegistryKey::new(&mut *self.hive, index))),
            None => Ok(None),
        }
    }

    /// Opens a subkey, creating every missing segment of `path`.
    pub fn create_subkey(&mut self, path: &str) -> Result<RegistryKey<'_, S>> {
        let mut current = self.index;
        for segment in split_path(path) {
            if segment.chars().count() > MAX_KEY_NAME_LEN {
                return Err(RegistryError::InvalidArgument(format!(
                    "Key name longer than {} characters: {}",
                    MAX_KEY_NAME_LEN, segment
                )));
            }
            current = match self.hive.find_child(current, segment)? {
                Some(child) => child,
                None => self.hive.create_child(current, segment)?,
            };
        }
        Ok(RegistryKey::new(&mut *self.hive, current))
    }

    /// Deletes a subkey that has no subkeys of its own.
    ///
    /// A missing key is an error when `throw_on_missing` is set and a no-op
    /// otherwise.
    pub fn delete_subkey(&mut self, path: &str, throw_on_missing: bool) -> Result<()> {
        let Some(target) = self.resolve_for_delete(path, throw_on_missing)? else {
            return Ok(());
        };
        self.hive.delete_key(target)
    }

    /// Deletes a subkey and everything below it. A missing key is a no-op.
    pub fn delete_subkey_tree(&mut self, path: &str) -> Result<()> {
        let Some(target) = self.resolve_for_delete(path, false)? else {
            return Ok(());
        };
        self.hive.delete_tree(target)
    }

    /// Names of the direct subkeys, in index order.
    pub fn subkey_names(&self) -> Result<Vec<String>> {
        let node = self.node()?;
        if !node.has_subkeys() || node.subkey_list == NO_INDEX {
            return Ok(Vec::new());
        }
        self.hive
            .subkey_indices_in(node.subkey_list)?
            .into_iter()
            .map(|index| self.hive.cell::<KeyNode>(index).map(|node| node.name))
            .collect()
    }

    /// Reads a value's data. Empty `name` is the default value.
    pub fn get_value(&self, name: &str) -> Result<Option<ValueData>> {
        match self.value(name)? {
            Some(value) => value.data().map(Some),
            None => Ok(None),
        }
    }

    /// Looks a value up by name.
    pub fn value(&self, name: &str) -> Result<Option<RegistryValue<'_, S>>> {
        let node = self.node()?;
        let hive = &*self.hive;
        Ok(hive
            .find_value(&node, name)?
            .map(|(_, cell)| RegistryValue::new(hive, cell)))
    }

    /// Returns a value's type.
    pub fn get_value_type(&self, name: &str) -> Result<Option<ValueType>> {
        let node = self.node()?;
        Ok(self.hive.find_value(&node, name)?.map(|(_, cell)| cell.data_type))
    }

    /// Sets a value, creating it if needed.
    pub fn set_value(&mut self, name: &str, data: &ValueData) -> Result<()> {
        self.set_value_raw(name, data.value_type(), &data.to_bytes())
    }

    /// Sets a value from raw bytes and an explicit type.
    pub fn set_value_raw(&mut self, name: &str, value_type: ValueType, data: &[u8]) -> Result<()> {
        if name.chars().count() > MAX_VALUE_NAME_LEN {
            return Err(RegistryError::InvalidArgument(format!(
                "Value name longer than {} characters",
                MAX_VALUE_NAME_LEN
            )));
        }

        let mut node = self.node()?;
        let mut cell = match self.hive.find_value(&node, name)? {
            Some((_, cell)) => cell,
            None => self.hive.add_value(&mut node, name)?,
        };

        self.hive.write_value_data(&mut cell, value_type, data)?;

        let mut node = self.node()?;
        node.max_value_data_len = node.max_value_data_len.max(data.len() as u32);
        node.timestamp = filetime_now();
        self.hive.update_cell(&mut node, false)?;
        Ok(())
    }

    /// Deletes a value.
    ///
    /// A missing value is an error when `throw_on_missing` is set and a no-op
    /// otherwise.
    pub fn delete_value(&mut self, name: &str, throw_on_missing: bool) -> Result<()> {
        let mut node = self.node()?;
        match self.hive.find_value(&node, name)? {
            Some((pos, _)) => {
                self.hive.remove_value(&mut node, pos)?;
                debug!(key = %node.name, value = %name, "Deleted value");
                Ok(())
            }
            None if throw_on_missing => Err(RegistryError::not_found("value", name)),
            None => Ok(()),
        }
    }

    /// Names of all values, in list order (sorted, default value first).
    pub fn value_names(&self) -> Result<Vec<String>> {
        Ok(self.values()?.into_iter().map(|v| v.name().to_string()).collect())
    }

    /// All values of this key.
    pub fn values(&self) -> Result<Vec<RegistryValue<'_, S>>> {
        let node = self.node()?;
        let hive = &*self.hive;
        hive.value_indices(&node)?
            .into_iter()
            .map(|index| {
                hive.cell::<ValueCell>(index)
                    .map(|cell| RegistryValue::new(hive, cell))
            })
            .collect()
    }

    /// Returns the class name, if any.
    pub fn class_name(&self) -> Result<Option<String>> {
        let node = self.node()?;
        if node.class_name == NO_INDEX {
            return Ok(None);
        }
        let raw = self
            .hive
            .raw_cell_data(node.class_name, node.class_name_length as usize)?;
        read_utf16_string(&raw, node.class_name as u32).map(Some)
    }

    /// Replaces the class name. `None` or an empty string removes it.
    pub fn set_class_name(&mut self, class_name: Option<&str>) -> Result<()> {
        let mut node = self.node()?;
        if node.class_name != NO_INDEX {
            self.hive.free_cell(node.class_name)?;
            node.class_name = NO_INDEX;
            node.class_name_length = 0;
        }

        if let Some(class_name) = class_name.filter(|c| !c.is_empty()) {
            let bytes = encode_utf16(class_name);
            let length = u16::try_from(bytes.len()).map_err(|_| {
                RegistryError::InvalidArgument(format!("Class name of {} bytes is too long", bytes.len()))
            })?;
            let index = self.hive.allocate_raw_cell(bytes.len())?;
            self.hive.write_raw_cell_data(index, &bytes)?;
            node.class_name = index;
            node.class_name_length = length;

            if !node.is_root() {
                let mut parent: KeyNode = self.hive.cell(node.parent)?;
                if u32::from(length) > parent.max_subkey_class_len {
                    parent.max_subkey_class_len = u32::from(length);
                    self.hive.update_cell(&mut parent, false)?;
                }
            }
        }

        node.timestamp = filetime_now();
        self.hive.update_cell(&mut node, false)?;
        Ok(())
    }

    /// Returns the key's security descriptor.
    pub fn security_descriptor(&self) -> Result<Option<Vec<u8>>> {
        let node = self.node()?;
        Ok(self
            .hive
            .get_cell::<SecurityCell>(node.security)?
            .map(|cell| cell.descriptor))
    }

    /// Gives the key a security descriptor, sharing an existing `sk` cell
    /// when an identical descriptor is already in the hive.
    pub fn set_security_descriptor(&mut self, descriptor: &[u8]) -> Result<()> {
        let new_security = self.hive.add_security_cell(descriptor)?;

        let mut node = self.node()?;
        if node.security != NO_INDEX {
            self.hive.dereference_security_cell(node.security)?;
        }
        node.security = new_security;
        self.hive.update_cell(&mut node, false)?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<Option<i32>> {
        let mut current = self.index;
        for segment in split_path(path) {
            match self.hive.find_child(current, segment)? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn resolve_for_delete(&self, path: &str, throw_on_missing: bool) -> Result<Option<i32>> {
        let Some(target) = self.resolve(path)? else {
            if throw_on_missing {
                return Err(RegistryError::not_found("key", path));
            }
            return Ok(None);
        };

        if self.hive.cell::<KeyNode>(target)?.is_root() {
            return Err(RegistryError::DeleteRoot);
        }
        if target == self.index {
            return Err(RegistryError::InvalidArgument(
                "A key cannot delete itself; pass a subkey path".to_string(),
            ));
        }
        Ok(Some(target))
    }
}

impl<S: Read + Write + Seek> RegistryHive<S> {
    /// Finds a direct child of `parent` by name.
    pub fn find_child(&self, parent: i32, name: &str) -> Result<Option<i32>> {
        let node: KeyNode = self.cell(parent)?;
        if !node.has_subkeys() || node.subkey_list == NO_INDEX {
            return Ok(None);
        }
        match self.find_subkey_in(node.subkey_list, name)? {
            KeyLookup::Found(index) => Ok(Some(index)),
            KeyLookup::Before | KeyLookup::After => Ok(None),
        }
    }

    /// Creates a child key under `parent` and links it into the parent's
    /// subkey list. The child shares the parent's security cell.
    fn create_child(&mut self, parent_index: i32, name: &str) -> Result<i32> {
        let mut parent: KeyNode = self.cell(parent_index)?;
        let mut child = KeyNode::new(name, parent_index);

        if parent.security != NO_INDEX {
            self.reference_security_cell(parent.security)?;
            child.security = parent.security;
        }
        let child_index = self.update_cell(&mut child, true)?;

        parent.subkey_list = if parent.subkey_list == NO_INDEX {
            let mut list = SubKeyHashedList::new(self.options().subkey_list_type);
            list.insert(0, name, child_index);
            self.update_cell(&mut list, true)?
        } else {
            self.link_subkey_in(parent.subkey_list, name, child_index)?
        };
        parent.subkey_count += 1;
        parent.max_subkey_name_len = parent.max_subkey_name_len.max(utf16_len(name));
        parent.timestamp = filetime_now();
        self.update_cell(&mut parent, false)?;

        debug!(
            parent = %parent.name,
            name = %name,
            index = format_args!("{:#x}", child_index),
            "Created key"
        );
        Ok(child_index)
    }

    /// Deletes a key with no subkeys, releasing everything it owns.
    fn delete_key(&mut self, index: i32) -> Result<()> {
        let node: KeyNode = self.cell(index)?;
        if node.is_root() {
            return Err(RegistryError::DeleteRoot);
        }
        if node.has_subkeys() {
            return Err(RegistryError::HasSubkeys(node.name));
        }

        if node.class_name != NO_INDEX {
            self.free_cell(node.class_name)?;
        }
        if node.security != NO_INDEX {
            self.dereference_security_cell(node.security)?;
        }
        if node.subkey_list != NO_INDEX {
            self.free_subkey_list(node.subkey_list)?;
        }
        for value in self.value_indices(&node)? {
            self.free_value(value)?;
        }
        if node.value_list != NO_INDEX {
            self.free_cell(node.value_list)?;
        }

        let mut parent: KeyNode = self.cell(node.parent)?;
        parent.subkey_list = self.unlink_subkey_in(parent.subkey_list, &node.name)?;
        parent.subkey_count = parent.subkey_count.saturating_sub(1);
        if !parent.has_subkeys() {
            self.free_subkey_list(parent.subkey_list)?;
            parent.subkey_list = NO_INDEX;
        }
        parent.timestamp = filetime_now();

        self.free_cell(index)?;
        self.update_cell(&mut parent, false)?;

        debug!(
            parent = %parent.name,
            name = %node.name,
            index = format_args!("{:#x}", index),
            "Deleted key"
        );
        Ok(())
    }

    /// Deletes a key and its descendants, children first.
    fn delete_tree(&mut self, index: i32) -> Result<()> {
        let node: KeyNode = self.cell(index)?;
        if node.is_root() {
            return Err(RegistryError::DeleteRoot);
        }
        if node.has_subkeys() && node.subkey_list != NO_INDEX {
            for child in self.subkey_indices_in(node.subkey_list)? {
                self.delete_tree(child)?;
            }
        }
        self.delete_key(index)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('\\').filter(|segment| !segment.is_empty())
}
