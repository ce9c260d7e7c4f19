//! Object header decode and checksum/identity policy checks (C2).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block::{read_block, BlockDevice};
use crate::error::{Error, Result};
use crate::fletcher;

pub const HEADER_SIZE: usize = 32;

// Object type constants (low 16 bits of type_and_flags).
pub const OBJECT_TYPE_NX_SUPERBLOCK: u16 = 0x0001;
pub const OBJECT_TYPE_BTREE: u16 = 0x0002;
pub const OBJECT_TYPE_BTREE_NODE: u16 = 0x0003;
pub const OBJECT_TYPE_SPACEMAN: u16 = 0x0005;
pub const OBJECT_TYPE_OMAP: u16 = 0x000B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u16 = 0x000C;
pub const OBJECT_TYPE_FS: u16 = 0x000D;

pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC000_0000;
pub const OBJ_PHYSICAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x4000_0000;
pub const OBJ_VIRTUAL: u32 = 0x8000_0000;

/// How a referring oid resolves to bytes on disk (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// The oid IS the physical block number.
    Physical,
    /// Resolve through the owning object map at the reader's xid.
    Virtual,
    /// Resident only in a live system; reached through the checkpoint
    /// data area on disk, which this core does not traverse.
    Ephemeral,
}

/// The 32-byte header present on every on-disk object.
#[derive(Debug, Clone)]
pub struct Header {
    pub checksum: u64,
    pub oid: u64,
    pub xid: u64,
    pub type_and_flags: u32,
    pub subtype: u32,
}

impl Header {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Format(format!(
                "object header too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(Header {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn object_type(&self) -> u16 {
        (self.type_and_flags & OBJECT_TYPE_MASK) as u16
    }

    pub fn storage_class(&self) -> StorageClass {
        match self.type_and_flags & OBJ_STORAGE_TYPE_MASK {
            OBJ_VIRTUAL => StorageClass::Virtual,
            OBJ_EPHEMERAL => StorageClass::Ephemeral,
            _ => StorageClass::Physical,
        }
    }

    pub fn is_physical(&self) -> bool {
        self.storage_class() == StorageClass::Physical
    }
}

/// Verify the Fletcher-64 checksum of a raw block (Invariant O-1).
pub fn verify_checksum(block: &[u8]) -> bool {
    fletcher::verify(block)
}

/// Policy checks run by callers after a fetch (Invariant O-2). Any
/// mismatch is a corruption event scoped to the current operation.
pub fn expect(
    header: &Header,
    expected_oid: Option<u64>,
    xid_upper_bound: Option<u64>,
    expected_kind: Option<u16>,
) -> Result<()> {
    if let Some(oid) = expected_oid {
        if header.oid != oid {
            return Err(Error::Corrupt(format!(
                "object header oid {} does not match expected {}",
                header.oid, oid
            )));
        }
    }
    if let Some(ceiling) = xid_upper_bound {
        if header.xid > ceiling {
            return Err(Error::Corrupt(format!(
                "object xid {} exceeds ceiling {}",
                header.xid, ceiling
            )));
        }
    }
    if let Some(kind) = expected_kind {
        if header.object_type() != kind {
            return Err(Error::Corrupt(format!(
                "object type {} does not match expected {}",
                header.object_type(),
                kind
            )));
        }
    }
    Ok(())
}

/// Read a full block, verify its checksum, and decode the header.
/// A checksum failure here is fatal to the caller's current operation.
pub fn read_verified<D: BlockDevice + ?Sized>(
    device: &D,
    block_number: u64,
    block_size: u32,
) -> Result<(Header, Vec<u8>)> {
    let block = read_block(device, block_number, block_size)?;
    if !verify_checksum(&block) {
        return Err(Error::Checksum {
            paddr: block_number,
        });
    }
    let header = Header::decode(&block)?;
    Ok((header, block))
}
