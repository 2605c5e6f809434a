//! Security (sk) cells and the hive's security descriptor ring.
//!
//! Key nodes with identical descriptors share one reference-counted `sk`
//! cell. All `sk` cells in a hive form a circular doubly linked ring through
//! their previous/next indices; the ring head is the root key's cell.

use crate::cell::{impl_cell_variant, NO_INDEX};
use crate::error::{RegistryError, Result};
use crate::hive::RegistryHive;
use crate::utils::{read_i32_le, read_u32_le, write_i32_le, write_u16_le, write_u32_le};
use std::io::{Read, Seek, Write};
use tracing::debug;

const SECURITY_HEADER_SIZE: usize = 0x14;

/// Self-relative security descriptor `O:BAG:BAD:PAI(A;;KA;;;SY)(A;CI;KA;;;BA)`:
/// owned by Administrators, full control for SYSTEM and Administrators.
#[rustfmt::skip]
pub const DEFAULT_SECURITY_DESCRIPTOR: [u8; 104] = [
    // Header: revision 1, control 0x9404 (self-relative, DACL present/protected/auto-inherited)
    0x01, 0x00, 0x04, 0x94,
    // Owner, group, SACL, DACL offsets
    0x14, 0x00, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x34, 0x00, 0x00, 0x00,
    // Owner: S-1-5-32-544
    0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20, 0x02, 0x00, 0x00,
    // Group: S-1-5-32-544
    0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20, 0x02, 0x00, 0x00,
    // DACL: revision 2, size 0x34, 2 ACEs
    0x02, 0x00, 0x34, 0x00, 0x02, 0x00, 0x00, 0x00,
    // ACCESS_ALLOWED, no inheritance, KEY_ALL_ACCESS, S-1-5-18
    0x00, 0x00, 0x14, 0x00, 0x3F, 0x00, 0x0F, 0x00,
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x00, 0x00,
    // ACCESS_ALLOWED, CONTAINER_INHERIT, KEY_ALL_ACCESS, S-1-5-32-544
    0x00, 0x02, 0x18, 0x00, 0x3F, 0x00, 0x0F, 0x00,
    0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20, 0x02, 0x00, 0x00,
];

/// Security (sk) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityCell {
    /// Cell index.
    pub index: i32,

    /// Previous cell in the ring.
    pub previous: i32,

    /// Next cell in the ring.
    pub next: i32,

    /// Number of key nodes referencing this cell.
    pub usage_count: u32,

    /// Opaque self-relative security descriptor.
    pub descriptor: Vec<u8>,
}

impl SecurityCell {
    /// Creates an unpersisted, unlinked cell with a zero usage count.
    pub fn new(descriptor: Vec<u8>) -> Self {
        Self {
            index: NO_INDEX,
            previous: NO_INDEX,
            next: NO_INDEX,
            usage_count: 0,
            descriptor,
        }
    }

    /// Parses a security cell from cell data.
    pub fn parse(data: &[u8], index: i32) -> Result<Self> {
        let offset = index as u32;
        if data.len() < SECURITY_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: SECURITY_HEADER_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"sk" {
            return Err(RegistryError::invalid_signature(b"sk", &data[0..2]));
        }

        let length = read_u32_le(data, 0x10)? as usize;
        let end = SECURITY_HEADER_SIZE + length;
        if end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: end,
                actual: data.len(),
            });
        }

        Ok(SecurityCell {
            index,
            previous: read_i32_le(data, 0x04)?,
            next: read_i32_le(data, 0x08)?,
            usage_count: read_u32_le(data, 0x0C)?,
            descriptor: data[SECURITY_HEADER_SIZE..end].to_vec(),
        })
    }

    fn serialized_size(&self) -> usize {
        SECURITY_HEADER_SIZE + self.descriptor.len()
    }

    fn serialize(&self, buffer: &mut [u8]) {
        buffer[0..2].copy_from_slice(b"sk");
        write_u16_le(buffer, 0x02, 0);
        write_i32_le(buffer, 0x04, self.previous);
        write_i32_le(buffer, 0x08, self.next);
        write_u32_le(buffer, 0x0C, self.usage_count);
        write_u32_le(buffer, 0x10, self.descriptor.len() as u32);
        buffer[SECURITY_HEADER_SIZE..SECURITY_HEADER_SIZE + self.descriptor.len()]
            .copy_from_slice(&self.descriptor);
    }
}

impl_cell_variant!(SecurityCell, Security, "SecurityCell");

impl<S: Read + Write + Seek> RegistryHive<S> {
    /// Adds one reference to a security cell.
    pub fn reference_security_cell(&mut self, index: i32) -> Result<()> {
        let mut cell: SecurityCell = self.cell(index)?;
        cell.usage_count += 1;
        self.update_cell(&mut cell, false)?;
        Ok(())
    }

    /// Drops one reference to a security cell, unlinking and freeing it when
    /// no references remain.
    pub fn dereference_security_cell(&mut self, index: i32) -> Result<()> {
        let mut cell: SecurityCell = self.cell(index)?;
        cell.usage_count = cell.usage_count.saturating_sub(1);

        if cell.usage_count > 0 {
            self.update_cell(&mut cell, false)?;
            return Ok(());
        }

        if cell.previous != index {
            let mut prev: SecurityCell = self.cell(cell.previous)?;
            prev.next = cell.next;
            self.update_cell(&mut prev, false)?;

            let mut next: SecurityCell = self.cell(cell.next)?;
            next.previous = cell.previous;
            self.update_cell(&mut next, false)?;
        }

        debug!(index = format_args!("{:#x}", index), "Freeing unused security cell");
        self.free_cell(index)
    }

    /// Returns a security cell holding `descriptor`, with one more reference.
    ///
    /// Reuses a ring member with a byte-identical descriptor when there is
    /// one; otherwise allocates a new cell and links it in before the ring
    /// head.
    pub fn add_security_cell(&mut self, descriptor: &[u8]) -> Result<i32> {
        let head = self.root_node()?.security;

        if head == NO_INDEX {
            let mut cell = SecurityCell::new(descriptor.to_vec());
            cell.usage_count = 1;
            let index = self.update_cell(&mut cell, true)?;
            cell.previous = index;
            cell.next = index;
            self.update_cell(&mut cell, false)?;
            return Ok(index);
        }

        let existing = self
            .security_ring()?
            .into_iter()
            .find(|cell| cell.descriptor == descriptor);
        if let Some(cell) = existing {
            self.reference_security_cell(cell.index)?;
            return Ok(cell.index);
        }

        let mut cell = SecurityCell::new(descriptor.to_vec());
        cell.usage_count = 1;
        let index = self.update_cell(&mut cell, true)?;

        let head_cell: SecurityCell = self.cell(head)?;
        let tail = head_cell.previous;

        cell.previous = tail;
        cell.next = head;
        self.update_cell(&mut cell, false)?;

        let mut tail_cell: SecurityCell = self.cell(tail)?;
        tail_cell.next = index;
        self.update_cell(&mut tail_cell, false)?;

        let mut head_cell: SecurityCell = self.cell(head)?;
        head_cell.previous = index;
        self.update_cell(&mut head_cell, false)?;

        debug!(index = format_args!("{:#x}", index), "Linked new security cell");
        Ok(index)
    }

    /// Walks the security ring from the root key's cell.
    pub fn security_ring(&self) -> Result<Vec<SecurityCell>> {
        let head = self.root_node()?.security;
        let mut ring = Vec::new();
        if head == NO_INDEX {
            return Ok(ring);
        }

        let mut current = head;
        loop {
            let cell: SecurityCell = self.cell(current)?;
            current = cell.next;
            ring.push(cell);
            if current == head {
                return Ok(ring);
            }
            if ring.len() > self.header().length as usize / 8 {
                return Err(RegistryError::InvalidFormat(format!(
                    "Security ring starting at {:#x} does not close",
                    head
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellRecord;

    #[test]
    fn test_default_descriptor_layout() {
        let sd = &DEFAULT_SECURITY_DESCRIPTOR;
        assert_eq!(read_u32_le(sd, 0x04).unwrap(), 0x14);
        assert_eq!(read_u32_le(sd, 0x10).unwrap(), 0x34);
        assert_eq!(u16::from_le_bytes([sd[0x36], sd[0x37]]) as usize, sd.len() - 0x34);
    }

    #[test]
    fn test_security_round_trip() {
        let mut cell = SecurityCell::new(DEFAULT_SECURITY_DESCRIPTOR.to_vec());
        cell.index = 0x100;
        cell.previous = 0x100;
        cell.next = 0x200;
        cell.usage_count = 5;

        let mut buffer = vec![0u8; cell.size()];
        cell.write_to(&mut buffer);
        assert_eq!(SecurityCell::parse(&buffer, 0x100).unwrap(), cell);
    }

    #[test]
    fn test_security_truncated_descriptor() {
        let mut buffer = vec![0u8; 0x18];
        buffer[0..2].copy_from_slice(b"sk");
        write_u32_le(&mut buffer, 0x10, 0x40);
        assert!(SecurityCell::parse(&buffer, 0).is_err());
    }
}
