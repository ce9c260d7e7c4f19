//! Record families: per-tree key shapes, comparators, and oid extraction.
//!
//! Every B-tree in an APFS container belongs to exactly one family. The
//! family determines how raw key bytes compare to each other and how a
//! search key is built from a caller's logical lookup (an oid, an
//! `(oid, xid)` pair, a `(parent oid, name/name-hash)` pair, ...).

use std::cmp::Ordering;

use crate::error::{Error, Result};

// J-object record types (low 4 bits of the obj_id_and_type high byte),
// carried over from the catalog tree's record encoding.
pub const J_TYPE_ANY: u8 = 0;
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const OBJ_TYPE_SHIFT: u64 = 60;

/// Split a catalog key's leading `obj_id_and_type` field.
pub fn decode_obj_id_and_type(raw: u64) -> (u64, u8) {
    let oid = raw & OBJ_ID_MASK;
    let kind = (raw >> OBJ_TYPE_SHIFT) as u8;
    (oid, kind)
}

pub fn encode_obj_id_and_type(oid: u64, kind: u8) -> u64 {
    (oid & OBJ_ID_MASK) | ((kind as u64) << OBJ_TYPE_SHIFT)
}

/// Which B-tree this node (or the tree it's rooted from) belongs to. Each
/// family owns its own key comparator and oid-extraction rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFamily {
    /// Object map: keys are `(oid: u64, xid: u64)`, ordered by oid then
    /// xid, both ascending.
    ObjectMap,
    /// Filesystem/catalog tree: keys open with `obj_id_and_type`, then a
    /// type-dependent tail (name, name-hash, xattr name, extent offset).
    Catalog,
    /// Extent-reference tree (container-wide physical extent refcounts):
    /// keys are a bare physical block address.
    ExtentRef,
    /// Space manager free-queue trees: keys are `(xid, paddr)` for the
    /// transaction-scoped queues, or a bare paddr for the main table.
    SpaceManagerFreeQueue,
}

impl RecordFamily {
    /// Compare two raw key byte slices under this family's ordering.
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        match self {
            RecordFamily::ObjectMap => {
                let (a_oid, a_xid) = read_omap_key(a)?;
                let (b_oid, b_xid) = read_omap_key(b)?;
                Ok((a_oid, a_xid).cmp(&(b_oid, b_xid)))
            }
            RecordFamily::Catalog => compare_catalog_keys(a, b),
            RecordFamily::ExtentRef => {
                let a_paddr = read_u64_key(a)?;
                let b_paddr = read_u64_key(b)?;
                Ok(a_paddr.cmp(&b_paddr))
            }
            RecordFamily::SpaceManagerFreeQueue => {
                // (xid, paddr) tuples, same shape as the object map.
                let (a_xid, a_paddr) = read_omap_key(a)?;
                let (b_xid, b_paddr) = read_omap_key(b)?;
                Ok((a_xid, a_paddr).cmp(&(b_xid, b_paddr)))
            }
        }
    }

    /// The virtual/physical oid an internal node's key should be treated
    /// as pointing toward, used by the navigator to decide descent order
    /// when keys only partially order (e.g. catalog name prefixes).
    pub fn extract_oid(&self, key: &[u8]) -> Result<u64> {
        match self {
            RecordFamily::ObjectMap => Ok(read_omap_key(key)?.0),
            RecordFamily::Catalog => {
                let raw = read_u64_key(key)?;
                Ok(decode_obj_id_and_type(raw).0)
            }
            RecordFamily::ExtentRef => read_u64_key(key),
            RecordFamily::SpaceManagerFreeQueue => Ok(read_omap_key(key)?.0),
        }
    }
}

fn read_u64_key(key: &[u8]) -> Result<u64> {
    if key.len() < 8 {
        return Err(Error::Corrupt("key shorter than 8 bytes".into()));
    }
    Ok(u64::from_le_bytes(key[0..8].try_into().unwrap()))
}

fn read_omap_key(key: &[u8]) -> Result<(u64, u64)> {
    if key.len() < 16 {
        return Err(Error::Corrupt("object map key shorter than 16 bytes".into()));
    }
    let oid = u64::from_le_bytes(key[0..8].try_into().unwrap());
    let xid = u64::from_le_bytes(key[8..16].try_into().unwrap());
    Ok((oid, xid))
}

/// Catalog keys order by `(oid, type)` first; ties within the same
/// `(oid, type)` fall through to a type-specific tail comparison (name
/// bytes for dir records and xattrs, a name-hash prefix for hashed
/// dirents, or a logical offset for file extents).
fn compare_catalog_keys(a: &[u8], b: &[u8]) -> Result<Ordering> {
    let a_head = read_u64_key(a)?;
    let b_head = read_u64_key(b)?;
    let (a_oid, a_kind) = decode_obj_id_and_type(a_head);
    let (b_oid, b_kind) = decode_obj_id_and_type(b_head);

    match (a_oid, a_kind).cmp(&(b_oid, b_kind)) {
        Ordering::Equal => {}
        other => return Ok(other),
    }

    let a_tail = &a[8..];
    let b_tail = &b[8..];

    match a_kind {
        J_TYPE_FILE_EXTENT => {
            let a_off = read_u64_key(a_tail)?;
            let b_off = read_u64_key(b_tail)?;
            Ok(a_off.cmp(&b_off))
        }
        J_TYPE_DIR_REC => {
            if let (Some(a_hash), Some(b_hash)) =
                (hashed_name_prefix(a_tail), hashed_name_prefix(b_tail))
            {
                Ok(a_hash.cmp(&b_hash).then_with(|| a_tail.cmp(b_tail)))
            } else {
                Ok(a_tail.cmp(b_tail))
            }
        }
        _ => Ok(a_tail.cmp(b_tail)),
    }
}

/// Hashed dirent key tails open with a 4-byte `(name_len:10, hash:22)`
/// bitfield ahead of the name bytes; unhashed tails are the name bytes
/// directly. Only the hashed layout yields a numeric prefix to compare.
fn hashed_name_prefix(tail: &[u8]) -> Option<u32> {
    if tail.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(tail[0..4].try_into().unwrap()))
}
