//! Synthetic in-memory container builder shared by the integration tests
//! and the benchmarks. Builds just enough of a real on-disk layout
//! (container superblock, inline container/volume object maps, a small
//! catalog B-tree) to exercise resolution and traversal without a real
//! disk image.

use apfs_core::block::SliceDevice;
use apfs_core::families::{encode_obj_id_and_type, J_TYPE_DIR_REC, J_TYPE_INODE};
use apfs_core::fletcher;
use apfs_core::header::{OBJECT_TYPE_FS, OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP};

pub const BLOCK_SIZE: u32 = 4096;
pub const VOL_OID: u64 = 100;
pub const CATALOG_ROOT_VOID: u64 = 200;
pub const ROOT_INODE_OID: u64 = 2;

const NX_MAGIC: u32 = 0x4253584E;
const APSB_MAGIC: u32 = 0x42535041;

fn checksum_in_place(block: &mut [u8]) {
    let sum = fletcher::compute(block).unwrap();
    block[0..8].copy_from_slice(&sum.to_le_bytes());
}

fn set_header(block: &mut [u8], oid: u64, xid: u64, object_type: u16) {
    block[8..16].copy_from_slice(&oid.to_le_bytes());
    block[16..24].copy_from_slice(&xid.to_le_bytes());
    block[24..28].copy_from_slice(&(object_type as u32).to_le_bytes());
}

fn inline_omap_block(oid: u64, xid: u64, entry_oid: u64, entry_xid: u64, entry_paddr: u64) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    set_header(&mut block, oid, xid, OBJECT_TYPE_OMAP);
    // header tail: flags,snap_count,tree_type,snap_tree_type,tree_oid(=0 => inline),snap_tree_oid
    let tail_start = 32;
    // tree_oid stays zero (bytes 16..24 of tail) -> inline form
    let entries_start = tail_start + 32;
    block[entries_start..entries_start + 8].copy_from_slice(&entry_oid.to_le_bytes());
    block[entries_start + 8..entries_start + 16].copy_from_slice(&entry_xid.to_le_bytes());
    // flags=0, size=BLOCK_SIZE
    block[entries_start + 20..entries_start + 24].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
    block[entries_start + 24..entries_start + 32].copy_from_slice(&entry_paddr.to_le_bytes());
    checksum_in_place(&mut block);
    block
}

/// Same layout as [`inline_omap_block`] but holding any number of
/// entries, for fixtures whose virtual tree needs more than one oid
/// resolved through the same object map.
pub fn inline_omap_block_multi(oid: u64, xid: u64, entries: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    set_header(&mut block, oid, xid, OBJECT_TYPE_OMAP);
    let tail_start = 32;
    let mut w = tail_start + 32; // tree_oid stays zero -> inline form
    for &(entry_oid, entry_xid, entry_paddr) in entries {
        block[w..w + 8].copy_from_slice(&entry_oid.to_le_bytes());
        block[w + 8..w + 16].copy_from_slice(&entry_xid.to_le_bytes());
        block[w + 20..w + 24].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
        block[w + 24..w + 32].copy_from_slice(&entry_paddr.to_le_bytes());
        w += 32;
    }
    checksum_in_place(&mut block);
    block
}

fn nxsb_block(xid: u64, next_xid: u64, omap_paddr: u64, xp_desc_base: u64, xp_desc_blocks: u32) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    set_header(&mut block, 1, xid, OBJECT_TYPE_NX_SUPERBLOCK);
    let mut w = 32usize;
    block[w..w + 4].copy_from_slice(&NX_MAGIC.to_le_bytes());
    w += 4;
    block[w..w + 4].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
    w += 4;
    block[w..w + 8].copy_from_slice(&1000u64.to_le_bytes()); // block_count
    w += 8;
    w += 24; // features, ro, incompatible
    w += 16; // uuid
    w += 8; // next_oid
    block[w..w + 8].copy_from_slice(&next_xid.to_le_bytes());
    w += 8;
    block[w..w + 4].copy_from_slice(&xp_desc_blocks.to_le_bytes());
    w += 4;
    w += 4; // xp_data_blocks
    block[w..w + 8].copy_from_slice(&xp_desc_base.to_le_bytes());
    w += 8;
    w += 8; // xp_data_base
    w += 4 * 6; // xp_desc_next..xp_data_len
    w += 8; // spaceman_oid
    block[w..w + 8].copy_from_slice(&omap_paddr.to_le_bytes());
    checksum_in_place(&mut block);
    block
}

fn apsb_block(omap_paddr: u64, root_tree_oid: u64) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    set_header(&mut block, VOL_OID, 1, OBJECT_TYPE_FS);
    let mut w = 32usize;
    block[w..w + 4].copy_from_slice(&APSB_MAGIC.to_le_bytes());
    w += 4;
    w += 4; // fs_index
    w += 8 * 3; // features, ro, incompatible
    w += 8 * 4; // unmount_time, fs_reserve, fs_quota, fs_alloc
    w += 20; // wrapped_meta_crypto_state_t
    w += 4 * 3; // root_tree_type, extentref_tree_type, snap_meta_tree_type
    block[w..w + 8].copy_from_slice(&omap_paddr.to_le_bytes());
    w += 8;
    block[w..w + 8].copy_from_slice(&root_tree_oid.to_le_bytes());
    checksum_in_place(&mut block);
    block
}

pub struct CatalogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub fn inode_record(oid: u64) -> CatalogRecord {
    let key = encode_obj_id_and_type(oid, J_TYPE_INODE).to_le_bytes().to_vec();
    let mut value = vec![0u8; 92];
    value[0..8].copy_from_slice(&1u64.to_le_bytes()); // parent_id
    value[8..16].copy_from_slice(&oid.to_le_bytes()); // private_id
    value[84..92].copy_from_slice(&4096u64.to_le_bytes()); // uncompressed_size
    CatalogRecord { key, value }
}

pub fn dir_record(parent_oid: u64, name: &str, file_id: u64) -> CatalogRecord {
    let mut key = encode_obj_id_and_type(parent_oid, J_TYPE_DIR_REC)
        .to_le_bytes()
        .to_vec();
    key.extend_from_slice(name.as_bytes());
    key.push(0);

    let mut value = vec![0u8; 18];
    value[0..8].copy_from_slice(&file_id.to_le_bytes());
    // date_added left zero; flags=DT_REG(8)
    value[16..18].copy_from_slice(&8u16.to_le_bytes());
    CatalogRecord { key, value }
}

/// Same as [`dir_record`] but with the hashed key layout real APFS
/// volumes use by default: a `name_len_and_hash` u32 ahead of the name.
pub fn hashed_dir_record(parent_oid: u64, name: &str, file_id: u64) -> CatalogRecord {
    let mut key = encode_obj_id_and_type(parent_oid, J_TYPE_DIR_REC)
        .to_le_bytes()
        .to_vec();
    let name_len_and_hash = (name.len() as u32) & 0x0000_03FF; // hash left at 0
    key.extend_from_slice(&name_len_and_hash.to_le_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);

    let mut value = vec![0u8; 18];
    value[0..8].copy_from_slice(&file_id.to_le_bytes());
    value[16..18].copy_from_slice(&8u16.to_le_bytes());
    CatalogRecord { key, value }
}

/// Build a single-leaf catalog root node holding one inode record and one
/// dirent record, both unhashed keys.
pub fn catalog_leaf_block(oid: u64, xid: u64, records: &[CatalogRecord]) -> Vec<u8> {
    let entries: Vec<(Vec<u8>, Vec<u8>)> = records
        .iter()
        .map(|r| (r.key.clone(), r.value.clone()))
        .collect();
    variable_node_block(oid, xid, true, true, 1, &entries)
}

/// A non-root leaf, holding the same shape of entries as a root leaf but
/// without the trailing `BTreeInfo` footer.
pub fn catalog_leaf_block_non_root(oid: u64, xid: u64, records: &[CatalogRecord]) -> Vec<u8> {
    let entries: Vec<(Vec<u8>, Vec<u8>)> = records
        .iter()
        .map(|r| (r.key.clone(), r.value.clone()))
        .collect();
    variable_node_block(oid, xid, false, true, 0, &entries)
}

/// An internal node whose values are 8-byte child oids, one per key.
pub fn catalog_internal_block(oid: u64, xid: u64, is_root: bool, children: &[(Vec<u8>, u64)]) -> Vec<u8> {
    let entries: Vec<(Vec<u8>, Vec<u8>)> = children
        .iter()
        .map(|(k, child)| (k.clone(), child.to_le_bytes().to_vec()))
        .collect();
    variable_node_block(oid, xid, is_root, false, 1, &entries)
}

fn variable_node_block(
    oid: u64,
    xid: u64,
    is_root: bool,
    is_leaf: bool,
    level: u16,
    entries: &[(Vec<u8>, Vec<u8>)],
) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    set_header(&mut block, oid, xid, apfs_core::header::OBJECT_TYPE_BTREE_NODE);

    let mut flags: u16 = 0;
    if is_leaf {
        flags |= apfs_core::node::BTNODE_LEAF;
    }
    if is_root {
        flags |= apfs_core::node::BTNODE_ROOT;
    }
    block[32..34].copy_from_slice(&flags.to_le_bytes());
    block[34..36].copy_from_slice(&level.to_le_bytes());
    block[36..40].copy_from_slice(&(entries.len() as u32).to_le_bytes());

    let table_len = (entries.len() * 8) as u16;
    block[40..42].copy_from_slice(&0u16.to_le_bytes());
    block[42..44].copy_from_slice(&table_len.to_le_bytes());

    let toc_start = 56usize;
    let key_area = toc_start + table_len as usize;
    let val_area_end = if is_root {
        BLOCK_SIZE as usize - 40
    } else {
        BLOCK_SIZE as usize
    };

    let mut key_cursor = key_area;
    let mut val_cursor = val_area_end;
    for (i, (key, value)) in entries.iter().enumerate() {
        let key_off = (key_cursor - key_area) as u16;
        block[key_cursor..key_cursor + key.len()].copy_from_slice(key);
        key_cursor += key.len();

        val_cursor -= value.len();
        let val_off = (val_area_end - val_cursor) as u16;
        block[val_cursor..val_cursor + value.len()].copy_from_slice(value);

        let toc_off = toc_start + i * 8;
        block[toc_off..toc_off + 2].copy_from_slice(&key_off.to_le_bytes());
        block[toc_off + 2..toc_off + 4].copy_from_slice(&(key.len() as u16).to_le_bytes());
        block[toc_off + 4..toc_off + 6].copy_from_slice(&val_off.to_le_bytes());
        block[toc_off + 6..toc_off + 8].copy_from_slice(&(value.len() as u16).to_le_bytes());
    }

    if is_root {
        let info_start = BLOCK_SIZE as usize - 40;
        block[info_start + 4..info_start + 8].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
        block[info_start + 24..info_start + 32].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        block[info_start + 32..info_start + 40].copy_from_slice(&1u64.to_le_bytes());
    }

    checksum_in_place(&mut block);
    block
}

/// Physical block layout:
///   0: NXSB                      omap_oid = 1
///   1: container omap (inline)   -> VOL_OID @ xid 1 -> paddr 2
///   2: APSB                      omap_oid = 3, root_tree_oid = CATALOG_ROOT_VOID
///   3: volume omap (inline)      -> CATALOG_ROOT_VOID @ xid 1 -> paddr 4
///   4: catalog root leaf         inode(2) + dirent("hello.txt" -> 2)
pub fn build_single_volume_container() -> SliceDevice {
    let mut data = vec![0u8; BLOCK_SIZE as usize * 5];

    let nxsb = nxsb_block(1, 1, 1, 0, 0);
    let container_omap = inline_omap_block(1, 1, VOL_OID, 1, 2);
    let apsb = apsb_block(3, CATALOG_ROOT_VOID);
    let volume_omap = inline_omap_block(3, 1, CATALOG_ROOT_VOID, 1, 4);
    let catalog = catalog_leaf_block(
        4,
        1,
        &[
            inode_record(ROOT_INODE_OID),
            dir_record(ROOT_INODE_OID, "hello.txt", ROOT_INODE_OID),
        ],
    );

    let bs = BLOCK_SIZE as usize;
    data[0..bs].copy_from_slice(&nxsb);
    data[bs..bs * 2].copy_from_slice(&container_omap);
    data[bs * 2..bs * 3].copy_from_slice(&apsb);
    data[bs * 3..bs * 4].copy_from_slice(&volume_omap);
    data[bs * 4..bs * 5].copy_from_slice(&catalog);

    SliceDevice::new(data, BLOCK_SIZE)
}

pub const LOW_LEAF_INODE_OID: u64 = 10;
pub const HIGH_LEAF_INODE_OID: u64 = 500;
pub const MULTI_LEVEL_CATALOG_ROOT_OID: u64 = 300;

/// A container whose catalog tree is two levels deep: a root internal
/// node whose children are virtual oids (300's omap lists them, not
/// their physical block numbers), each pointing at its own leaf. Proves
/// descent re-resolves every level through the object map rather than
/// treating a child oid as a physical block number once past the root.
///
/// Physical block layout:
///   0: NXSB                      omap_oid = 1
///   1: container omap (inline)   -> VOL_OID @ xid 1 -> paddr 2
///   2: APSB                      omap_oid = 3, root_tree_oid = 300
///   3: volume omap (inline)      -> 300 -> paddr 4, 301 -> paddr 5, 302 -> paddr 6
///   4: catalog root (internal)   children: (key<=10) -> 301, (key>10) -> 302
///   5: leaf                      inode(10)
///   6: leaf                      inode(500)
pub fn build_multi_level_catalog_container() -> SliceDevice {
    let mut data = vec![0u8; BLOCK_SIZE as usize * 7];

    let nxsb = nxsb_block(1, 1, 1, 0, 0);
    let container_omap = inline_omap_block(1, 1, VOL_OID, 1, 2);
    let apsb = apsb_block(3, MULTI_LEVEL_CATALOG_ROOT_OID);
    let volume_omap = inline_omap_block_multi(
        3,
        1,
        &[
            (MULTI_LEVEL_CATALOG_ROOT_OID, 1, 4),
            (301, 1, 5),
            (302, 1, 6),
        ],
    );

    let low_record = inode_record(LOW_LEAF_INODE_OID);
    let low_key = low_record.key.clone();
    let low_leaf = catalog_leaf_block_non_root(301, 1, &[low_record]);

    let high_record = inode_record(HIGH_LEAF_INODE_OID);
    let high_key = high_record.key.clone();
    let high_leaf = catalog_leaf_block_non_root(302, 1, &[high_record]);

    let root = catalog_internal_block(
        MULTI_LEVEL_CATALOG_ROOT_OID,
        1,
        true,
        &[(low_key, 301), (high_key, 302)],
    );

    let bs = BLOCK_SIZE as usize;
    data[0..bs].copy_from_slice(&nxsb);
    data[bs..bs * 2].copy_from_slice(&container_omap);
    data[bs * 2..bs * 3].copy_from_slice(&apsb);
    data[bs * 3..bs * 4].copy_from_slice(&volume_omap);
    data[bs * 4..bs * 5].copy_from_slice(&root);
    data[bs * 5..bs * 6].copy_from_slice(&low_leaf);
    data[bs * 6..bs * 7].copy_from_slice(&high_leaf);

    SliceDevice::new(data, BLOCK_SIZE)
}

/// Same container, but with a checkpoint descriptor area at blocks
/// [5, 7) holding two NXSB candidates: an older, corrupt one at block 5
/// and a newer, valid one at block 6.
pub fn build_container_with_checkpoint_area() -> SliceDevice {
    let mut data = vec![0u8; BLOCK_SIZE as usize * 8];

    let nxsb = nxsb_block(1, 1, 1, 5, 2);
    let container_omap = inline_omap_block(1, 1, VOL_OID, 1, 2);
    let apsb = apsb_block(3, CATALOG_ROOT_VOID);
    let volume_omap = inline_omap_block(3, 1, CATALOG_ROOT_VOID, 1, 4);
    let catalog = catalog_leaf_block(
        4,
        1,
        &[
            inode_record(ROOT_INODE_OID),
            dir_record(ROOT_INODE_OID, "hello.txt", ROOT_INODE_OID),
        ],
    );

    let mut stale_candidate = nxsb_block(2, 2, 1, 5, 2);
    stale_candidate[200] ^= 0xFF; // break its checksum

    // header.xid (3) deliberately differs from next_xid (9): selection
    // must follow next_xid, not the object header's own xid.
    let fresh_candidate = nxsb_block(3, 9, 1, 5, 2);

    let bs = BLOCK_SIZE as usize;
    data[0..bs].copy_from_slice(&nxsb);
    data[bs..bs * 2].copy_from_slice(&container_omap);
    data[bs * 2..bs * 3].copy_from_slice(&apsb);
    data[bs * 3..bs * 4].copy_from_slice(&volume_omap);
    data[bs * 4..bs * 5].copy_from_slice(&catalog);
    data[bs * 5..bs * 6].copy_from_slice(&stale_candidate);
    data[bs * 6..bs * 7].copy_from_slice(&fresh_candidate);

    SliceDevice::new(data, BLOCK_SIZE)
}
