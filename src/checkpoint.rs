//! Checkpoint discovery (C7): locating the active container superblock
//! among the checkpoint descriptor area's candidates.
//!
//! This is the one subsystem that tolerates per-block errors by design
//! (§7's propagation policy): a corrupt or stale candidate block is
//! recorded as a taint and skipped, rather than aborting the whole scan.

use crate::block::BlockDevice;
use crate::error::{Error, Result};
use crate::header::{self, OBJECT_TYPE_NX_SUPERBLOCK};
use crate::superblock::NxSuperblock;

/// A non-fatal diagnostic recorded while scanning the descriptor area.
/// Exposed to callers so they can log or surface recovery-worthy findings
/// without the scan itself failing.
#[derive(Debug, Clone)]
pub enum Taint {
    ChecksumMismatch { block: u64 },
    WrongObjectType { block: u64, found: u16 },
    DecodeError { block: u64, message: String },
}

#[derive(Debug)]
pub struct CheckpointScan {
    pub superblock: NxSuperblock,
    pub block: u64,
    pub taints: Vec<Taint>,
}

/// Scan the checkpoint descriptor area `[start, start+len)` (block
/// numbers) for container superblock candidates and return the one with
/// the greatest `next_xid`, breaking ties toward the earlier block (the
/// lowest block number), matching how a fresh mount replays forward from
/// the oldest surviving checkpoint rather than trusting write order.
///
/// The descriptor area is expected to be a single contiguous block
/// range; a caller that has reason to believe it wraps or is segmented
/// should pass each contiguous segment separately, since this crate
/// has no way to discover segment boundaries other than what the prior,
/// already-resolved superblock told it (and that information is exactly
/// what we don't have yet while bootstrapping). Callers that detect a
/// wrapped/non-contiguous layout should treat it as unsupported.
pub fn find_active_superblock<D: BlockDevice + ?Sized>(
    device: &D,
    block_size: u32,
    descriptor_start: u64,
    descriptor_len: u64,
) -> Result<CheckpointScan> {
    if descriptor_len == 0 {
        return Err(Error::NoValidSuperblock);
    }

    let mut best: Option<(NxSuperblock, u64)> = None;
    let mut taints = Vec::new();

    for i in 0..descriptor_len {
        let block_number = descriptor_start + i;
        let raw = match crate::block::read_block(device, block_number, block_size) {
            Ok(b) => b,
            Err(e) => {
                taints.push(Taint::DecodeError {
                    block: block_number,
                    message: e.to_string(),
                });
                continue;
            }
        };

        if !header::verify_checksum(&raw) {
            log::warn!("checkpoint candidate at block {block_number} failed checksum, skipping");
            taints.push(Taint::ChecksumMismatch { block: block_number });
            continue;
        }

        let object_header = match crate::header::Header::decode(&raw) {
            Ok(h) => h,
            Err(e) => {
                taints.push(Taint::DecodeError {
                    block: block_number,
                    message: e.to_string(),
                });
                continue;
            }
        };

        if object_header.object_type() != OBJECT_TYPE_NX_SUPERBLOCK {
            // Checkpoint-map blocks interleave with superblocks in the
            // descriptor area; anything that isn't an NXSB candidate is
            // silently skipped rather than taint-worthy noise.
            if object_header.object_type() != 0 {
                continue;
            }
            log::warn!(
                "checkpoint candidate at block {block_number} has unexpected object type {}, skipping",
                object_header.object_type()
            );
            taints.push(Taint::WrongObjectType {
                block: block_number,
                found: object_header.object_type(),
            });
            continue;
        }

        let superblock = match NxSuperblock::decode(&raw) {
            Ok(sb) => sb,
            Err(e) => {
                taints.push(Taint::DecodeError {
                    block: block_number,
                    message: e.to_string(),
                });
                continue;
            }
        };

        if !is_plausible(&superblock) {
            log::warn!("checkpoint candidate at block {block_number} failed plausibility checks, skipping");
            taints.push(Taint::DecodeError {
                block: block_number,
                message: "superblock failed plausibility checks".into(),
            });
            continue;
        }

        let replace = match &best {
            None => true,
            Some((_, best_block)) => {
                let best_next_xid = best.as_ref().unwrap().0.next_xid;
                superblock.next_xid > best_next_xid
                    || (superblock.next_xid == best_next_xid && block_number < *best_block)
            }
        };
        if replace {
            best = Some((superblock, block_number));
        }
    }

    match best {
        Some((superblock, block)) => {
            log::debug!(
                "checkpoint scan [{descriptor_start}, {}) selected block {block} (next_xid {})",
                descriptor_start + descriptor_len,
                superblock.next_xid
            );
            Ok(CheckpointScan {
                superblock,
                block,
                taints,
            })
        }
        None => Err(Error::NoValidSuperblock),
    }
}

/// Basic internal-consistency checks beyond the checksum, catching a
/// block that happens to have a valid checksum and the right object type
/// but isn't actually a sane container superblock (magic mismatch, zero
/// block size, block count that can't fit the declared device size, a
/// missing object map, or a `next_xid` that couldn't have committed
/// anything yet).
fn is_plausible(sb: &NxSuperblock) -> bool {
    const NX_MAGIC: u32 = 0x4253584E; // "NXSB" little-endian
    sb.magic == NX_MAGIC
        && sb.block_size > 0
        && sb.block_count > 0
        && sb.omap_oid != 0
        && sb.next_xid > 0
}
