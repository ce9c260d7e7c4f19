//! Generic B-tree traversal (C4): an iterative, bounded-depth descent
//! engine shared by every record family.
//!
//! Deliberately iterative rather than a recursive reader object: each
//! descent step pushes a breadcrumb (node oid, slot index) onto a stack
//! sized to the tree's height, so a pathological or cyclic on-disk graph
//! can be bounded by a hard depth limit instead of blowing the call stack.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::families::RecordFamily;
use crate::node::Node;

/// Hard ceiling on descent depth. Real APFS trees are at most a handful
/// of levels deep; this only exists to turn a corrupt cyclic child
/// pointer into a clean error instead of an infinite loop.
pub const MAX_DEPTH: usize = 64;

/// Cooperative cancellation flag, checked at cache misses and descent
/// iteration boundaries (§6.6).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What the navigator needs from its caller to turn a child oid into a
/// decoded node: fetch-by-oid (through whatever cache/resolver chain the
/// caller has set up) and the tree's fixed key/value sizes, if any.
pub trait ChildResolver {
    fn fetch(&self, oid: u64) -> Result<Arc<Node>>;
}

/// One step of the breadcrumb stack: which node we're in and which slot
/// we last descended through (or are iterating from).
#[derive(Debug, Clone, Copy)]
struct Breadcrumb {
    node_oid: u64,
    slot: usize,
}

/// A positioned cursor into a B-tree, usable for both one-shot search and
/// ordered iteration (`next`/`prev`) without re-descending from the root.
pub struct Cursor<'a, R: ChildResolver> {
    resolver: &'a R,
    family: RecordFamily,
    fixed_key_size: u32,
    fixed_val_size: u32,
    stack: Vec<Breadcrumb>,
    leaf: Arc<Node>,
    slot: usize,
    cancellation: CancellationToken,
}

impl<'a, R: ChildResolver> Cursor<'a, R> {
    pub fn key(&self) -> Result<Vec<u8>> {
        Ok(self.leaf.key_at(self.slot, self.fixed_key_size)?.to_vec())
    }

    pub fn value(&self) -> Result<Vec<u8>> {
        let (_, v) = self.leaf.slot(self.slot, self.fixed_key_size, self.fixed_val_size)?;
        Ok(v.to_vec())
    }

    pub fn key_value(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.key()?, self.value()?))
    }

    /// Advance to the next record in key order, ascending through parent
    /// breadcrumbs when the current leaf is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.cancellation.check()?;
        if self.slot + 1 < self.leaf.nkeys as usize {
            self.slot += 1;
            return Ok(true);
        }
        self.ascend_and_advance(1)
    }

    /// Step to the previous record in key order.
    pub fn prev(&mut self) -> Result<bool> {
        self.cancellation.check()?;
        if self.slot > 0 {
            self.slot -= 1;
            return Ok(true);
        }
        self.ascend_and_advance(usize::MAX) // sentinel: move backward
    }

    fn ascend_and_advance(&mut self, direction: usize) -> Result<bool> {
        while let Some(crumb) = self.stack.pop() {
            self.cancellation.check()?;
            let parent = self.resolver.fetch(crumb.node_oid)?;
            let next_slot = if direction == 1 {
                crumb.slot + 1
            } else if crumb.slot == 0 {
                continue; // no earlier sibling in this parent, keep ascending
            } else {
                crumb.slot - 1
            };
            if next_slot >= parent.nkeys as usize {
                continue;
            }
            self.stack.push(Breadcrumb {
                node_oid: crumb.node_oid,
                slot: next_slot,
            });
            return self.descend_to_extreme(direction == 1);
        }
        Ok(false)
    }

    /// From the current top-of-stack breadcrumb, descend to the leftmost
    /// (if `leftmost`) or rightmost leaf slot reachable through it.
    fn descend_to_extreme(&mut self, leftmost: bool) -> Result<bool> {
        loop {
            self.cancellation.check()?;
            let crumb = *self.stack.last().expect("descend_to_extreme called with empty stack");
            let node = self.resolver.fetch(crumb.node_oid)?;
            if node.is_leaf() {
                self.leaf = node;
                self.slot = crumb.slot;
                return Ok(true);
            }
            let child_oid = node.child_oid(crumb.slot, self.fixed_key_size)?;
            let child = self.resolver.fetch(child_oid)?;
            let slot = if leftmost { 0 } else { child.nkeys.saturating_sub(1) as usize };
            if self.stack.len() >= MAX_DEPTH {
                return Err(Error::Corrupt("btree descent exceeded max depth".into()));
            }
            self.stack.push(Breadcrumb {
                node_oid: child_oid,
                slot: slot as usize,
            });
        }
    }
}

/// Search a tree rooted at `root_oid` for `target_key` under `family`'s
/// ordering, returning a cursor positioned at the greatest record with
/// key <= target_key (predecessor search, Invariant M-1's building
/// block), or `Error::NotFound` if no such record exists.
pub fn search<'a, R: ChildResolver>(
    resolver: &'a R,
    root_oid: u64,
    family: RecordFamily,
    target_key: &[u8],
    cancellation: CancellationToken,
) -> Result<Cursor<'a, R>> {
    let root = resolver.fetch(root_oid)?;
    let (fixed_key_size, fixed_val_size) = root.fixed_sizes().unwrap_or((0, 0));

    let mut stack = Vec::new();
    let mut node = root;
    let mut node_oid = root_oid;
    let mut best: Option<Breadcrumb> = None;

    loop {
        cancellation.check()?;
        if stack.len() > MAX_DEPTH {
            return Err(Error::Corrupt("btree descent exceeded max depth".into()));
        }

        let slot = predecessor_slot(&node, family, target_key, fixed_key_size)?;

        if node.is_leaf() {
            match slot {
                Some(s) => {
                    stack.push(Breadcrumb { node_oid, slot: s });
                    best = stack.last().copied();
                }
                None => return Err(Error::NotFound),
            }
            break;
        }

        let descend_slot = slot.unwrap_or(0);
        stack.push(Breadcrumb {
            node_oid,
            slot: descend_slot,
        });
        let child_oid = node.child_oid(descend_slot, fixed_key_size)?;
        node_oid = child_oid;
        node = resolver.fetch(child_oid)?;
    }

    let crumb = best.ok_or(Error::NotFound)?;
    let leaf = resolver.fetch(crumb.node_oid)?;

    Ok(Cursor {
        resolver,
        family,
        fixed_key_size,
        fixed_val_size,
        stack,
        leaf,
        slot: crumb.slot,
        cancellation,
    })
}

/// Position a cursor at the very first record in a tree's key order,
/// descending the leftmost child at every level. Returns `Error::NotFound`
/// for an empty tree.
pub fn first<'a, R: ChildResolver>(
    resolver: &'a R,
    root_oid: u64,
    family: RecordFamily,
    cancellation: CancellationToken,
) -> Result<Cursor<'a, R>> {
    let root = resolver.fetch(root_oid)?;
    let (fixed_key_size, fixed_val_size) = root.fixed_sizes().unwrap_or((0, 0));

    let mut stack = Vec::new();
    let mut node = root;
    let mut node_oid = root_oid;

    loop {
        cancellation.check()?;
        if stack.len() > MAX_DEPTH {
            return Err(Error::Corrupt("btree descent exceeded max depth".into()));
        }
        if node.nkeys == 0 {
            return Err(Error::NotFound);
        }
        if node.is_leaf() {
            stack.push(Breadcrumb { node_oid, slot: 0 });
            break;
        }
        stack.push(Breadcrumb { node_oid, slot: 0 });
        let child_oid = node.child_oid(0, fixed_key_size)?;
        node_oid = child_oid;
        node = resolver.fetch(child_oid)?;
    }

    let crumb = *stack.last().unwrap();
    let leaf = resolver.fetch(crumb.node_oid)?;

    Ok(Cursor {
        resolver,
        family,
        fixed_key_size,
        fixed_val_size,
        stack,
        leaf,
        slot: crumb.slot,
        cancellation,
    })
}

/// Find the greatest slot in `node` whose key is <= `target_key` (the
/// last slot whose comparison is `Less` or `Equal`). Internal nodes use
/// this to choose a descent child; leaves use it to find the match.
fn predecessor_slot(
    node: &Node,
    family: RecordFamily,
    target_key: &[u8],
    fixed_key_size: u32,
) -> Result<Option<usize>> {
    let mut result = None;
    for i in 0..node.nkeys as usize {
        let key = node.key_at(i, fixed_key_size)?;
        match family.compare_keys(key, target_key)? {
            Ordering::Less | Ordering::Equal => result = Some(i),
            Ordering::Greater => break,
        }
    }
    Ok(result)
}

/// Search for the first record whose key begins with `prefix` under
/// `family`'s ordering (used for "all xattrs of this oid"-style scans
/// where the tail of the key isn't known up front).
pub fn search_prefix<'a, R: ChildResolver>(
    resolver: &'a R,
    root_oid: u64,
    family: RecordFamily,
    prefix_oid: u64,
    cancellation: CancellationToken,
) -> Result<Option<Cursor<'a, R>>> {
    // Build a synthetic minimal key for this oid (zero tail / zero xid)
    // so the predecessor search lands just before the oid's first record,
    // then step forward once to land on it.
    let synthetic = match family {
        RecordFamily::ObjectMap | RecordFamily::SpaceManagerFreeQueue => {
            let mut k = vec![0u8; 16];
            k[0..8].copy_from_slice(&prefix_oid.to_le_bytes());
            k
        }
        RecordFamily::Catalog => {
            let mut k = vec![0u8; 8];
            k[0..8].copy_from_slice(&prefix_oid.to_le_bytes());
            k
        }
        RecordFamily::ExtentRef => prefix_oid.to_le_bytes().to_vec(),
    };

    match search(resolver, root_oid, family, &synthetic, cancellation.clone()) {
        Ok(mut cursor) => {
            if cursor.family.extract_oid(&cursor.key()?)? == prefix_oid {
                return Ok(Some(cursor));
            }
            if cursor.next()? && cursor.family.extract_oid(&cursor.key()?)? == prefix_oid {
                Ok(Some(cursor))
            } else {
                Ok(None)
            }
        }
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Collect every record belonging to `oid` by walking forward from the
/// prefix match until the oid changes or the tree ends.
pub fn all_for_oid<R: ChildResolver>(
    resolver: &R,
    root_oid: u64,
    family: RecordFamily,
    oid: u64,
    cancellation: CancellationToken,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let cursor = search_prefix(resolver, root_oid, family, oid, cancellation.clone())?;
    let mut cursor = match cursor {
        Some(c) => c,
        None => return Ok(out),
    };

    loop {
        cancellation.check()?;
        let (k, v) = cursor.key_value()?;
        if family.extract_oid(&k)? != oid {
            break;
        }
        out.push((k, v));
        if !cursor.next()? {
            break;
        }
    }
    Ok(out)
}

/// Walk every record in a tree in key order, starting at the leftmost leaf.
/// An empty tree yields an empty vector rather than `Error::NotFound`, since
/// "no records" is a valid answer for a full scan even though it is not a
/// valid answer for a targeted search.
pub fn iterate<R: ChildResolver>(
    resolver: &R,
    root_oid: u64,
    family: RecordFamily,
    cancellation: CancellationToken,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = match first(resolver, root_oid, family, cancellation.clone()) {
        Ok(c) => c,
        Err(Error::NotFound) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut out = Vec::new();
    loop {
        cancellation.check()?;
        out.push(cursor.key_value()?);
        if !cursor.next()? {
            break;
        }
    }
    Ok(out)
}
