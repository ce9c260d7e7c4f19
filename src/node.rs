//! B-tree node decoder (C3): parses one node's header, table-of-contents,
//! and key/value slot layout without copying slot bytes out of the block.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_HASHED: u16 = 0x0008;
pub const BTNODE_NOHEADER: u16 = 0x0010;

const NODE_HEADER_SIZE: usize = 24; // flags,level,nkeys + 4 (off,len) ranges
const INFO_SIZE: usize = 40; // trailing btree_info footer on root nodes

#[derive(Debug, Clone)]
struct Ranges {
    table_space_off: u16,
    table_space_len: u16,
    #[allow(dead_code)]
    free_space_off: u16,
    #[allow(dead_code)]
    free_space_len: u16,
}

/// The small fixed-size struct a root node trails its data with, declaring
/// the whole tree's fixed key/value sizes (if any) and summary counts.
#[derive(Debug, Clone)]
pub struct BTreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BTreeInfo {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < INFO_SIZE {
            return Err(Error::Format("btree info footer too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeInfo {
            flags: cursor.read_u32::<LittleEndian>()?,
            node_size: cursor.read_u32::<LittleEndian>()?,
            key_size: cursor.read_u32::<LittleEndian>()?,
            val_size: cursor.read_u32::<LittleEndian>()?,
            longest_key: cursor.read_u32::<LittleEndian>()?,
            longest_val: cursor.read_u32::<LittleEndian>()?,
            key_count: cursor.read_u64::<LittleEndian>()?,
            node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct TocEntry {
    key_off: u16,
    key_len: u16,
    val_off: u16,
    val_len: u16,
}

/// A decoded B-tree node. Slot accessors borrow directly from the owned
/// block buffer; nothing is copied until a caller asks for owned bytes.
#[derive(Debug, Clone)]
pub struct Node {
    pub header: Header,
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    toc: Vec<TocEntry>,
    data: Vec<u8>,
    key_area_off: usize,
    val_area_end: usize,
    pub info: Option<BTreeInfo>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    pub fn is_hashed(&self) -> bool {
        self.flags & BTNODE_HASHED != 0
    }

    /// Decode one node from a raw, already checksum-verified block.
    pub fn decode(block: &[u8]) -> Result<Self> {
        let header = Header::decode(block)?;
        if block.len() < HEADER_SIZE + NODE_HEADER_SIZE {
            return Err(Error::Format("block too short for btree node header".into()));
        }

        let mut cursor = Cursor::new(&block[HEADER_SIZE..]);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let level = cursor.read_u16::<LittleEndian>()?;
        let nkeys = cursor.read_u32::<LittleEndian>()?;
        let ranges = Ranges {
            table_space_off: cursor.read_u16::<LittleEndian>()?,
            table_space_len: cursor.read_u16::<LittleEndian>()?,
            free_space_off: cursor.read_u16::<LittleEndian>()?,
            free_space_len: cursor.read_u16::<LittleEndian>()?,
        };
        // Key free-list and value free-list ranges (4 more u16 pairs) are
        // part of the fixed 24-byte node header but unused for read-only
        // traversal; skip over them explicitly rather than leaving the
        // cursor position implicit.
        cursor.read_u16::<LittleEndian>()?;
        cursor.read_u16::<LittleEndian>()?;
        cursor.read_u16::<LittleEndian>()?;
        cursor.read_u16::<LittleEndian>()?;

        let is_root = flags & BTNODE_ROOT != 0;
        let is_fixed_kv = flags & BTNODE_FIXED_KV_SIZE != 0;

        let btn_data_off = HEADER_SIZE + NODE_HEADER_SIZE;
        let toc_start = btn_data_off + ranges.table_space_off as usize;
        let key_area_off = btn_data_off
            + ranges.table_space_off as usize
            + ranges.table_space_len as usize;

        let info = if is_root {
            if block.len() < INFO_SIZE {
                return Err(Error::Format("root node missing btree_info footer".into()));
            }
            Some(BTreeInfo::decode(&block[block.len() - INFO_SIZE..])?)
        } else {
            None
        };

        let val_area_end = if is_root {
            block.len() - INFO_SIZE
        } else {
            block.len()
        };

        if toc_start > block.len() {
            return Err(Error::Corrupt("table of contents starts out of bounds".into()));
        }

        let mut toc = Vec::with_capacity(nkeys as usize);
        let mut toc_cursor = Cursor::new(&block[toc_start..]);
        for _ in 0..nkeys {
            if is_fixed_kv {
                let key_off = toc_cursor.read_u16::<LittleEndian>().map_err(|_| {
                    Error::Corrupt("table of contents truncated".into())
                })?;
                let val_off = toc_cursor.read_u16::<LittleEndian>().map_err(|_| {
                    Error::Corrupt("table of contents truncated".into())
                })?;
                toc.push(TocEntry {
                    key_off,
                    key_len: 0,
                    val_off,
                    val_len: 0,
                });
            } else {
                let key_off = toc_cursor.read_u16::<LittleEndian>().map_err(|_| {
                    Error::Corrupt("table of contents truncated".into())
                })?;
                let key_len = toc_cursor.read_u16::<LittleEndian>().map_err(|_| {
                    Error::Corrupt("table of contents truncated".into())
                })?;
                let val_off = toc_cursor.read_u16::<LittleEndian>().map_err(|_| {
                    Error::Corrupt("table of contents truncated".into())
                })?;
                let val_len = toc_cursor.read_u16::<LittleEndian>().map_err(|_| {
                    Error::Corrupt("table of contents truncated".into())
                })?;
                toc.push(TocEntry {
                    key_off,
                    key_len,
                    val_off,
                    val_len,
                });
            }
        }

        Ok(Node {
            header,
            flags,
            level,
            nkeys,
            toc,
            data: block.to_vec(),
            key_area_off,
            val_area_end,
            info,
        })
    }

    /// Fixed key/value sizes declared by this node's own root footer, if
    /// it has one. Callers normally obtain these once from the root and
    /// thread them down through the descent.
    pub fn fixed_sizes(&self) -> Option<(u32, u32)> {
        self.info.as_ref().map(|i| (i.key_size, i.val_size))
    }

    fn key_bytes(&self, index: usize, fixed_key_size: u32) -> Result<&[u8]> {
        let entry = self
            .toc
            .get(index)
            .ok_or_else(|| Error::Corrupt("slot index out of range".into()))?;
        let start = self.key_area_off + entry.key_off as usize;
        let len = if self.is_fixed_kv() {
            fixed_key_size as usize
        } else {
            entry.key_len as usize
        };
        let end = start.checked_add(len).ok_or_else(|| {
            Error::Corrupt("key offset overflow".into())
        })?;
        if end > self.data.len() || start < self.key_area_off {
            return Err(Error::Corrupt(format!(
                "key out of bounds: start={start}, len={len}, block_size={}",
                self.data.len()
            )));
        }
        Ok(&self.data[start..end])
    }

    fn value_bytes(&self, index: usize, fixed_val_size: u32) -> Result<&[u8]> {
        let entry = self
            .toc
            .get(index)
            .ok_or_else(|| Error::Corrupt("slot index out of range".into()))?;
        let len = if !self.is_leaf() {
            8 // internal node values are always an 8-byte child oid
        } else if self.is_fixed_kv() {
            fixed_val_size as usize
        } else {
            entry.val_len as usize
        };

        let val_off = entry.val_off as usize;
        if val_off > self.val_area_end {
            return Err(Error::Corrupt("value offset exceeds value area".into()));
        }
        let start = self.val_area_end - val_off;
        let end = start.checked_add(len).ok_or_else(|| {
            Error::Corrupt("value offset overflow".into())
        })?;
        if end > self.data.len() || start < self.key_area_off {
            return Err(Error::Corrupt(format!(
                "value out of bounds: start={start}, len={len}, val_area_end={}, block_size={}",
                self.val_area_end,
                self.data.len()
            )));
        }
        Ok(&self.data[start..end])
    }

    /// Yield the (key, value) byte pair at `index`.
    pub fn slot(
        &self,
        index: usize,
        fixed_key_size: u32,
        fixed_val_size: u32,
    ) -> Result<(&[u8], &[u8])> {
        if index >= self.nkeys as usize {
            return Err(Error::Corrupt("slot index out of range".into()));
        }
        let key = self.key_bytes(index, fixed_key_size)?;
        let value = self.value_bytes(index, fixed_val_size)?;
        Ok((key, value))
    }

    /// For an internal node, the child oid at `index`.
    pub fn child_oid(&self, index: usize, fixed_key_size: u32) -> Result<u64> {
        let val = self.value_bytes(index, 8)?;
        let _ = self.key_bytes(index, fixed_key_size)?; // bounds-check the key too
        if val.len() < 8 {
            return Err(Error::Corrupt("child oid value too short".into()));
        }
        Ok(u64::from_le_bytes(val[0..8].try_into().unwrap()))
    }

    pub fn key_at(&self, index: usize, fixed_key_size: u32) -> Result<&[u8]> {
        self.key_bytes(index, fixed_key_size)
    }
}
