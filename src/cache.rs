//! Two-level LRU cache (C5): a byte-budgeted raw-block cache keyed by
//! physical address, and a count-budgeted decoded-node cache keyed by oid.
//!
//! Grounded on the icache/dcache split in `fuse-ufs`'s in-memory reader
//! cache: two independently-sized `lru::LruCache` maps behind their own
//! locks, one for raw bytes and one for parsed structures, so a node
//! eviction never has to re-verify a checksum it already paid for.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::node::Node;

/// Running hit/miss/eviction counters, exposed read-only for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub block_hits: u64,
    pub block_misses: u64,
    pub block_evictions: u64,
    pub node_hits: u64,
    pub node_misses: u64,
    pub node_evictions: u64,
}

struct BlockEntry {
    bytes: Arc<Vec<u8>>,
}

/// Byte-budgeted cache of raw, checksum-verified blocks keyed by physical
/// block number. Eviction is driven by total bytes resident, not entry
/// count, since block sizes are uniform per-container but the cache is
/// meant to bound memory, not slot count.
pub struct BlockCache {
    inner: Mutex<LruCache<u64, BlockEntry>>,
    byte_budget: u64,
    bytes_resident: Mutex<u64>,
    stats: Mutex<CacheStats>,
}

impl BlockCache {
    pub fn new(byte_budget: u64) -> Self {
        // The `lru` crate caps by entry count; we additionally self-evict
        // on a byte budget by tracking resident bytes and popping the LRU
        // tail whenever a fresh insert would exceed it. The capacity
        // argument here is a generous upper bound that never binds in
        // practice when block sizes are realistic (4-64 KiB).
        let cap = NonZeroUsize::new(1_000_000).unwrap();
        BlockCache {
            inner: Mutex::new(LruCache::new(cap)),
            byte_budget,
            bytes_resident: Mutex::new(0),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn get(&self, paddr: u64) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let hit = inner.get(&paddr).map(|e| e.bytes.clone());
        let mut stats = self.stats.lock();
        if hit.is_some() {
            stats.block_hits += 1;
        } else {
            stats.block_misses += 1;
        }
        hit
    }

    pub fn insert(&self, paddr: u64, bytes: Arc<Vec<u8>>) {
        let size = bytes.len() as u64;
        let mut inner = self.inner.lock();
        let mut resident = self.bytes_resident.lock();
        let mut stats = self.stats.lock();

        while *resident + size > self.byte_budget {
            match inner.pop_lru() {
                Some((_, evicted)) => {
                    *resident -= evicted.bytes.len() as u64;
                    stats.block_evictions += 1;
                }
                None => break,
            }
        }

        if let Some(previous) = inner.put(paddr, BlockEntry { bytes }) {
            *resident -= previous.bytes.len() as u64;
        }
        *resident += size;
    }

    pub fn invalidate(&self, paddr: u64) {
        let mut inner = self.inner.lock();
        if let Some(evicted) = inner.pop(&paddr) {
            *self.bytes_resident.lock() -= evicted.bytes.len() as u64;
        }
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }
}

/// Count-budgeted cache of decoded B-tree nodes keyed by oid. Oids, not
/// physical addresses, because a virtual tree's node can move between
/// checkpoints while keeping the same logical identity the caller cares
/// about invalidating.
pub struct NodeCache {
    inner: Mutex<LruCache<u64, Arc<Node>>>,
    stats: Mutex<CacheStats>,
}

impl NodeCache {
    pub fn new(entry_budget: usize) -> Self {
        let cap = NonZeroUsize::new(entry_budget.max(1)).unwrap();
        NodeCache {
            inner: Mutex::new(LruCache::new(cap)),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn get(&self, oid: u64) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        let hit = inner.get(&oid).cloned();
        let mut stats = self.stats.lock();
        if hit.is_some() {
            stats.node_hits += 1;
        } else {
            stats.node_misses += 1;
        }
        hit
    }

    pub fn insert(&self, oid: u64, node: Arc<Node>) {
        let mut inner = self.inner.lock();
        if inner.len() == inner.cap().get() && !inner.contains(&oid) {
            self.stats.lock().node_evictions += 1;
        }
        inner.put(oid, node);
    }

    pub fn invalidate(&self, oid: u64) {
        self.inner.lock().pop(&oid);
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }
}

/// The combined cache a session holds: one block cache, one node cache.
pub struct Cache {
    pub blocks: BlockCache,
    pub nodes: NodeCache,
}

impl Cache {
    pub fn new(block_byte_budget: u64, node_entry_budget: usize) -> Self {
        Cache {
            blocks: BlockCache::new(block_byte_budget),
            nodes: NodeCache::new(node_entry_budget),
        }
    }

    pub fn stats(&self) -> (CacheStats, CacheStats) {
        (self.blocks.stats(), self.nodes.stats())
    }

    /// Drop every cached block and node. Used when a caller moves to a
    /// different checkpoint/xid and cannot trust prior contents.
    pub fn invalidate_all(&self) {
        self.blocks.inner.lock().clear();
        *self.blocks.bytes_resident.lock() = 0;
        self.nodes.inner.lock().clear();
    }

    /// Drop a single physical block and its decoded node, if cached.
    /// Used when a caller knows one specific address was rewritten
    /// (e.g. after a resolver retry at a fresher xid).
    pub fn invalidate_block(&self, paddr: u64) {
        self.blocks.invalidate(paddr);
        self.nodes.invalidate(paddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_cache_hits_after_insert() {
        let cache = BlockCache::new(4096 * 4);
        assert!(cache.get(1).is_none());
        cache.insert(1, Arc::new(vec![0u8; 4096]));
        assert!(cache.get(1).is_some());
        let stats = cache.stats();
        assert_eq!(stats.block_misses, 1);
        assert_eq!(stats.block_hits, 1);
    }

    #[test]
    fn block_cache_evicts_under_byte_pressure() {
        let cache = BlockCache::new(4096);
        cache.insert(1, Arc::new(vec![0u8; 4096]));
        cache.insert(2, Arc::new(vec![0u8; 4096]));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert_eq!(cache.stats().block_evictions, 1);
    }

    #[test]
    fn node_cache_respects_entry_budget() {
        let cache = NodeCache::new(1);
        cache.insert(1, Arc::new(dummy_node()));
        cache.insert(2, Arc::new(dummy_node()));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn invalidate_block_drops_both_levels() {
        let cache = Cache::new(4096 * 4, 4);
        cache.blocks.insert(1, Arc::new(vec![0u8; 4096]));
        cache.nodes.insert(1, Arc::new(dummy_node()));

        cache.invalidate_block(1);

        assert!(cache.blocks.get(1).is_none());
        assert!(cache.nodes.get(1).is_none());
    }

    fn dummy_node() -> Node {
        use crate::fletcher;
        let mut block = vec![0u8; 64];
        let checksum = fletcher::compute(&block).unwrap();
        block[0..8].copy_from_slice(&checksum.to_le_bytes());
        Node::decode(&block).unwrap()
    }
}
