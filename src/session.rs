//! Top-level session (§6.5): ties a block device, a chosen checkpoint,
//! and the two-level cache together behind the small set of entry
//! points a caller actually needs — resolve an oid, search a tree, walk
//! all records for an oid.

use std::sync::Arc;

use crate::block::BlockDevice;
use crate::cache::Cache;
use crate::checkpoint::{self, Taint};
use crate::error::{Error, Result};
use crate::families::RecordFamily;
use crate::navigator::{self, CancellationToken, ChildResolver};
use crate::node::Node;
use crate::resolver::{self, Fetcher, OmapSource, PhysicalFetcher, ResolvedObject, VirtualFetcher};
use crate::superblock::{ApfsSuperblock, NxSuperblock, ObjectMapHeader};

const DEFAULT_BLOCK_CACHE_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_NODE_CACHE_ENTRIES: usize = 4096;

/// A tree ready for traversal. Physical trees (the object map itself,
/// space manager free queues) are addressed directly by block number.
/// Virtual trees (a volume's catalog) store a virtual oid at every
/// level, root included, each of which must be re-resolved through the
/// owning object map before its physical block can be read, since
/// catalog nodes relocate independently under copy-on-write.
pub enum TreeRoot {
    Physical(u64),
    Virtual {
        root_oid: u64,
        omap: OmapSource,
        xid_ceiling: u64,
    },
}

impl TreeRoot {
    fn root_oid(&self) -> u64 {
        match self {
            TreeRoot::Physical(paddr) => *paddr,
            TreeRoot::Virtual { root_oid, .. } => *root_oid,
        }
    }
}

/// A mounted container as of one checkpoint. Read-only: nothing here
/// ever writes to `device`.
pub struct Session<D: BlockDevice> {
    device: D,
    block_size: u32,
    pub superblock: NxSuperblock,
    pub taints: Vec<Taint>,
    cache: Cache,
    cancellation: CancellationToken,
    recovery_mode: bool,
}

impl<D: BlockDevice> Session<D> {
    /// Open a container by scanning its checkpoint descriptor area for
    /// the active superblock (§4.7's pipeline: locate checkpoint, verify
    /// checksum, decode, hand back a ready-to-query session).
    pub fn open(device: D) -> Result<Self> {
        // Bootstrap block size from block 0 itself: every NXSB candidate
        // declares its own block_size, and block 0 is always the
        // container's first write, so a 4096-byte probe read is enough
        // to discover the real size before trusting anything else.
        let probe_size = 4096u32;
        let probe = crate::block::read_block(&device, 0, probe_size)?;
        if !crate::header::verify_checksum(&probe) {
            return Err(Error::NoValidSuperblock);
        }
        let probe_sb = NxSuperblock::decode(&probe)?;
        let block_size = probe_sb.block_size;

        let scan = checkpoint::find_active_superblock(
            &device,
            block_size,
            probe_sb.xp_desc_base,
            probe_sb.xp_desc_blocks as u64,
        );

        let (superblock, taints) = match scan {
            Ok(scan) if scan.superblock.next_xid > probe_sb.next_xid => {
                (scan.superblock, scan.taints)
            }
            Ok(scan) => (probe_sb, scan.taints),
            Err(Error::NoValidSuperblock) => (probe_sb, Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(Session {
            device,
            block_size,
            superblock,
            taints,
            cache: Cache::new(DEFAULT_BLOCK_CACHE_BYTES, DEFAULT_NODE_CACHE_ENTRIES),
            cancellation: CancellationToken::new(),
            recovery_mode: false,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Enable the physical-address/magic-sweep fallback for `resolve`.
    /// Off by default: a sweep match is a heuristic (a block whose header
    /// happens to carry the right oid and an xid under the ceiling), not
    /// a guarantee the object map ever pointed at it, so normal resolution
    /// failing with [`Error::NotFound`] should usually stay `NotFound`
    /// unless the caller has explicitly opted into best-effort recovery.
    pub fn set_recovery_mode(&mut self, enabled: bool) {
        self.recovery_mode = enabled;
    }

    pub fn cache_stats(&self) -> (crate::cache::CacheStats, crate::cache::CacheStats) {
        self.cache.stats()
    }

    fn fetcher(&self) -> PhysicalFetcher<'_, D> {
        PhysicalFetcher {
            device: &self.device,
            block_size: self.block_size,
            cache: &self.cache,
            cancellation: self.cancellation.clone(),
        }
    }

    /// Build the fetcher a tree root's storage class calls for: a bare
    /// physical reader for physical trees, or an object-map-resolving
    /// reader for virtual ones.
    fn fetcher_for(&self, root: &TreeRoot) -> Fetcher<'_, D> {
        match root {
            TreeRoot::Physical(_) => Fetcher::Physical(self.fetcher()),
            TreeRoot::Virtual {
                omap, xid_ceiling, ..
            } => Fetcher::Virtual(VirtualFetcher {
                device: &self.device,
                block_size: self.block_size,
                cache: &self.cache,
                omap: omap.clone(),
                xid_ceiling: *xid_ceiling,
                cancellation: self.cancellation.clone(),
            }),
        }
    }

    /// Read the container object map's root and, if it isn't in inline
    /// form, its B-tree root oid.
    fn container_omap(&self) -> Result<ObjectMapHeader> {
        let block = crate::block::read_block(&self.device, self.superblock.omap_oid, self.block_size)?;
        if !crate::header::verify_checksum(&block) {
            return Err(Error::Checksum {
                paddr: self.superblock.omap_oid,
            });
        }
        ObjectMapHeader::decode(&block)
    }

    /// Resolve a virtual oid through the container object map at the
    /// session's current transaction. Falls back to a physical-address
    /// sweep when `Error::NotFound` is returned and recovery mode has
    /// been enabled via [`Session::set_recovery_mode`].
    pub fn resolve(&self, oid: u64) -> Result<ResolvedObject> {
        match self.resolve_via_omap(oid) {
            Err(Error::NotFound) if self.recovery_mode => resolver::sweep_for_object(
                &self.device,
                self.block_size,
                self.superblock.block_count,
                oid,
                self.superblock.header.xid,
                &self.cancellation,
            ),
            other => other,
        }
    }

    fn resolve_via_omap(&self, oid: u64) -> Result<ResolvedObject> {
        let omap = self.container_omap()?;
        let xid_ceiling = self.superblock.header.xid;
        if omap.is_inline() {
            let block =
                crate::block::read_block(&self.device, self.superblock.omap_oid, self.block_size)?;
            let entries = omap.inline_entries(&block)?;
            return resolver::resolve_inline(&entries, oid, xid_ceiling);
        }
        resolver::resolve(
            &self.device,
            self.block_size,
            &self.cache,
            omap.tree_oid,
            oid,
            xid_ceiling,
            self.cancellation.clone(),
        )
    }

    /// Resolve and open the first mounted volume's superblock.
    pub fn open_volume(&self, volume_oid: u64) -> Result<ApfsSuperblock> {
        let resolved = self.resolve(volume_oid)?;
        if resolved.deleted {
            return Err(Error::NotFound);
        }
        let block = crate::block::read_block(&self.device, resolved.paddr, self.block_size)?;
        if !crate::header::verify_checksum(&block) {
            return Err(Error::Checksum {
                paddr: resolved.paddr,
            });
        }
        ApfsSuperblock::decode(&block)
    }

    /// Resolve a volume's catalog tree root as a [`TreeRoot::Virtual`]:
    /// the root oid plus whatever the volume's own object map needs to
    /// resolve it and every descendant node underneath it, since catalog
    /// nodes (root included) are virtual oids subject to copy-on-write
    /// relocation, unlike the object map's own tree.
    pub fn volume_catalog_root(&self, volume: &ApfsSuperblock) -> Result<TreeRoot> {
        let omap_block =
            crate::block::read_block(&self.device, volume.omap_oid, self.block_size)?;
        if !crate::header::verify_checksum(&omap_block) {
            return Err(Error::Checksum {
                paddr: volume.omap_oid,
            });
        }
        let omap = ObjectMapHeader::decode(&omap_block)?;
        let xid_ceiling = self.superblock.header.xid;

        let source = if omap.is_inline() {
            OmapSource::Inline {
                entries: omap.inline_entries(&omap_block)?,
            }
        } else {
            OmapSource::Tree {
                root_oid: omap.tree_oid,
            }
        };

        Ok(TreeRoot::Virtual {
            root_oid: volume.root_tree_oid,
            omap: source,
            xid_ceiling,
        })
    }

    /// Search a tree for the predecessor of `target_key` under
    /// `family`'s ordering.
    pub fn search(
        &self,
        root: &TreeRoot,
        family: RecordFamily,
        target_key: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let fetcher = self.fetcher_for(root);
        let cursor = navigator::search(
            &fetcher,
            root.root_oid(),
            family,
            target_key,
            self.cancellation.clone(),
        )?;
        cursor.key_value()
    }

    /// All records belonging to `oid` in a tree.
    pub fn all_for_oid(
        &self,
        root: &TreeRoot,
        family: RecordFamily,
        oid: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let fetcher = self.fetcher_for(root);
        navigator::all_for_oid(&fetcher, root.root_oid(), family, oid, self.cancellation.clone())
    }

    /// Fetch a tree's root node.
    pub fn fetch_node(&self, root: &TreeRoot) -> Result<Arc<Node>> {
        self.fetcher_for(root).fetch(root.root_oid())
    }

    /// Walk every record in a tree in key order.
    pub fn iterate(&self, root: &TreeRoot, family: RecordFamily) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let fetcher = self.fetcher_for(root);
        navigator::iterate(&fetcher, root.root_oid(), family, self.cancellation.clone())
    }

    /// Drop a single physical block (and its decoded node) from the
    /// session's cache. Callers resolving the same oid again after a
    /// transaction advances should invalidate its old physical address
    /// first, since the cache is keyed by address, not by oid.
    pub fn invalidate_block(&self, paddr: u64) {
        self.cache.invalidate_block(paddr);
    }

    /// Consume the session, releasing its device and cache. Exists for
    /// callers that want an explicit end-of-use point rather than relying
    /// on drop order, e.g. before reopening the same device at a newer
    /// checkpoint.
    pub fn close(self) {}
}
