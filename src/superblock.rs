//! Container and volume superblock decoding, and the object map header
//! that sits between a superblock and its B-tree.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};

pub const NX_MAGIC: u32 = 0x4253584E; // "NXSB"
pub const APSB_MAGIC: u32 = 0x42535041; // "APSB"
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// Container superblock (NXSB) — the root structure of an APFS container.
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: Header,
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: u64,
    pub next_xid: u64,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: u64,
    pub xp_data_base: u64,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: u64,
    pub omap_oid: u64,
    pub reaper_oid: u64,
    pub max_file_systems: u32,
    pub fs_oids: Vec<u64>,
}

impl NxSuperblock {
    pub fn decode(block: &[u8]) -> Result<Self> {
        let header = Header::decode(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(HEADER_SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            return Err(Error::Format(format!("unexpected NXSB magic {magic:#x}")));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u64::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;

        let next_oid = cursor.read_u64::<LittleEndian>()?;
        let next_xid = cursor.read_u64::<LittleEndian>()?;

        let xp_desc_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_data_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_base = cursor.read_u64::<LittleEndian>()?;
        let xp_data_base = cursor.read_u64::<LittleEndian>()?;
        let xp_desc_next = cursor.read_u32::<LittleEndian>()?;
        let xp_data_next = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_index = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_len = cursor.read_u32::<LittleEndian>()?;
        let xp_data_index = cursor.read_u32::<LittleEndian>()?;
        let xp_data_len = cursor.read_u32::<LittleEndian>()?;

        let spaceman_oid = cursor.read_u64::<LittleEndian>()?;
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let reaper_oid = cursor.read_u64::<LittleEndian>()?;

        let _test_type = cursor.read_u32::<LittleEndian>()?;
        let max_file_systems = cursor.read_u32::<LittleEndian>()?;

        let fs_count = std::cmp::min(max_file_systems as usize, NX_MAX_FILE_SYSTEMS);
        let mut fs_oids = Vec::with_capacity(fs_count);
        for _ in 0..fs_count {
            fs_oids.push(cursor.read_u64::<LittleEndian>()?);
        }

        Ok(NxSuperblock {
            header,
            magic,
            block_size,
            block_count,
            features,
            readonly_compatible_features,
            incompatible_features,
            uuid,
            next_oid,
            next_xid,
            xp_desc_blocks,
            xp_data_blocks,
            xp_desc_base,
            xp_data_base,
            xp_desc_next,
            xp_data_next,
            xp_desc_index,
            xp_desc_len,
            xp_data_index,
            xp_data_len,
            spaceman_oid,
            omap_oid,
            reaper_oid,
            max_file_systems,
            fs_oids,
        })
    }
}

/// Volume superblock (APSB) — one per filesystem within a container.
#[derive(Debug, Clone)]
pub struct ApfsSuperblock {
    pub header: Header,
    pub magic: u32,
    pub fs_index: u32,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub unmount_time: u64,
    pub fs_reserve_block_count: u64,
    pub fs_quota_block_count: u64,
    pub fs_alloc_count: u64,
    pub root_tree_type: u32,
    pub extentref_tree_type: u32,
    pub snap_meta_tree_type: u32,
    pub omap_oid: u64,
    pub root_tree_oid: u64,
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub revert_to_xid: u64,
    pub revert_to_sblock_oid: u64,
    pub next_obj_id: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub num_snapshots: u64,
    pub total_blocks_alloced: u64,
    pub total_blocks_freed: u64,
    pub uuid: [u8; 16],
    pub last_mod_time: u64,
    pub fs_flags: u64,
    pub volume_name: String,
}

impl ApfsSuperblock {
    pub fn decode(block: &[u8]) -> Result<Self> {
        let header = Header::decode(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(HEADER_SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APSB_MAGIC {
            return Err(Error::Format(format!("unexpected APSB magic {magic:#x}")));
        }

        let fs_index = cursor.read_u32::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;
        let unmount_time = cursor.read_u64::<LittleEndian>()?;
        let fs_reserve_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_quota_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_alloc_count = cursor.read_u64::<LittleEndian>()?;

        // wrapped_meta_crypto_state_t: 20 bytes, not needed read-only.
        let mut skip = [0u8; 20];
        cursor.read_exact(&mut skip)?;

        let root_tree_type = cursor.read_u32::<LittleEndian>()?;
        let extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
        let snap_meta_tree_type = cursor.read_u32::<LittleEndian>()?;

        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snap_meta_tree_oid = cursor.read_u64::<LittleEndian>()?;

        let revert_to_xid = cursor.read_u64::<LittleEndian>()?;
        let revert_to_sblock_oid = cursor.read_u64::<LittleEndian>()?;

        let next_obj_id = cursor.read_u64::<LittleEndian>()?;
        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        let num_symlinks = cursor.read_u64::<LittleEndian>()?;
        let num_other_fsobjects = cursor.read_u64::<LittleEndian>()?;
        let num_snapshots = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_alloced = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_freed = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;

        let last_mod_time = cursor.read_u64::<LittleEndian>()?;
        let fs_flags = cursor.read_u64::<LittleEndian>()?;

        // formatted_by + modified_by[8]: apfs_modified_by_t is 48 bytes each.
        let mut modified_by = [0u8; 48];
        cursor.read_exact(&mut modified_by)?;
        for _ in 0..8 {
            cursor.read_exact(&mut modified_by)?;
        }

        let mut name_buf = [0u8; 256];
        cursor.read_exact(&mut name_buf)?;
        let nul_pos = name_buf.iter().position(|&b| b == 0).unwrap_or(256);
        let volume_name = String::from_utf8_lossy(&name_buf[..nul_pos]).to_string();

        Ok(ApfsSuperblock {
            header,
            magic,
            fs_index,
            features,
            readonly_compatible_features,
            incompatible_features,
            unmount_time,
            fs_reserve_block_count,
            fs_quota_block_count,
            fs_alloc_count,
            root_tree_type,
            extentref_tree_type,
            snap_meta_tree_type,
            omap_oid,
            root_tree_oid,
            extentref_tree_oid,
            snap_meta_tree_oid,
            revert_to_xid,
            revert_to_sblock_oid,
            next_obj_id,
            num_files,
            num_directories,
            num_symlinks,
            num_other_fsobjects,
            num_snapshots,
            total_blocks_alloced,
            total_blocks_freed,
            uuid,
            last_mod_time,
            fs_flags,
            volume_name,
        })
    }
}

const OMAP_HEADER_TAIL_SIZE: usize = 32; // flags,snap_count,tree_type,snap_tree_type,tree_oid,snap_tree_oid

/// The small header every object map object opens with, ahead of either a
/// B-tree oid or (in the small/legacy form) nothing at all.
#[derive(Debug, Clone)]
pub struct ObjectMapHeader {
    pub header: Header,
    pub flags: u32,
    pub snap_count: u32,
    pub tree_type: u32,
    pub snap_tree_type: u32,
    pub tree_oid: u64,
    pub snapshot_tree_oid: u64,
}

impl ObjectMapHeader {
    pub fn decode(block: &[u8]) -> Result<Self> {
        let header = Header::decode(block)?;
        if block.len() < HEADER_SIZE + OMAP_HEADER_TAIL_SIZE {
            return Err(Error::Format("object map header too short".into()));
        }
        let mut cursor = Cursor::new(&block[HEADER_SIZE..]);
        let flags = cursor.read_u32::<LittleEndian>()?;
        let snap_count = cursor.read_u32::<LittleEndian>()?;
        let tree_type = cursor.read_u32::<LittleEndian>()?;
        let snap_tree_type = cursor.read_u32::<LittleEndian>()?;
        let tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snapshot_tree_oid = cursor.read_u64::<LittleEndian>()?;

        Ok(ObjectMapHeader {
            header,
            flags,
            snap_count,
            tree_type,
            snap_tree_type,
            tree_oid,
            snapshot_tree_oid,
        })
    }

    /// `tree_oid == 0` marks the inline/small form described in §4.3:
    /// there is no B-tree, and resolution falls back to a short entry
    /// list appended after this header.
    pub fn is_inline(&self) -> bool {
        self.tree_oid == 0
    }

    /// The inline entries, when `is_inline()` is true. Trailing bytes
    /// after the last whole 32-byte entry are ignored rather than
    /// treated as corruption — the inline form has no explicit count
    /// field, so trailing padding up to the block boundary is normal.
    pub fn inline_entries(&self, block: &[u8]) -> Result<Vec<crate::resolver::InlineOmapEntry>> {
        let start = HEADER_SIZE + OMAP_HEADER_TAIL_SIZE;
        let usable_len = (block.len() - start) / 32 * 32;
        crate::resolver::decode_inline_entries(&block[start..start + usable_len])
    }
}
