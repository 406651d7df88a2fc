//! `CircleTree` - a crash-consistent concurrent B+-tree.
//!
//! This module owns the root pointer and the height, and drives every
//! operation from the root down:
//!
//! - [`traverse`]: descent, sibling-chase, locking the node covering a key
//! - [`insert`]: upsert, split propagation, root raise
//! - [`delete`]: removal, merge/redistribute rebalancing, root collapse
//! - [`update`]: in-place field update of stored records
//! - [`range`]: sibling-chain range scans
//! - [`invariants`]: structural checks and a level-by-level dump

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};

use seize::{Collector, LocalGuard};

use crate::alloc::NodeAlloc;
use crate::config::{ConfigError, TreeConfig};
use crate::fingerprint;
use crate::layout::{Circular, Linear, NodeLayout};
use crate::node::{Node, WriteCtx};
use crate::ordering::{READ_ORD, RELAXED};
use crate::pmem::{FlushEvent, Persist};

mod delete;
mod insert;
mod invariants;
mod range;
mod traverse;
mod update;

#[cfg(test)]
pub mod test_hooks;

#[cfg(test)]
mod shuttle_tests;


pub use invariants::InvariantViolation;

/// Upper bound on optimistic retries of a single read before a debug build
/// reports a livelock.
pub const MAX_READ_RETRIES: u64 = 10_000_000;

// ============================================================================
//  Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    splits: AtomicU64,
    root_raises: AtomicU64,
    merges: AtomicU64,
    redistributions: AtomicU64,
    root_collapses: AtomicU64,
    read_retries: AtomicU64,
    write_restarts: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, RELAXED);
    }
}

/// A snapshot of a tree's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Entries in the tree.
    pub len: usize,
    /// Number of levels.
    pub height: u32,
    /// Nodes currently linked into the tree.
    pub nodes: usize,
    /// Nodes allocated over the tree's lifetime.
    pub nodes_allocated: u64,
    /// Nodes unlinked by merges and root collapses.
    pub nodes_retired: u64,
    /// Node splits.
    pub splits: u64,
    /// Roots installed above a split root.
    pub root_raises: u64,
    /// Sibling merges.
    pub merges: u64,
    /// Sibling redistributions.
    pub redistributions: u64,
    /// Roots replaced by their only child.
    pub root_collapses: u64,
    /// Optimistic reads that had to be repeated.
    pub read_retries: u64,
    /// Writers that restarted from the root after meeting a tombstone or a
    /// raised lower fence.
    pub write_restarts: u64,
    /// Cache lines written back.
    pub lines_flushed: u64,
    /// Fences issued.
    pub fences: u64,
    /// Whether flushes are being logged.
    pub flush_log: bool,
}

// ============================================================================
//  CircleTree
// ============================================================================

/// A concurrent ordered index from `i64` keys to `Arc<V>` values.
///
/// # Type Parameters
/// * `V` - value type, stored as `Arc<V>`
/// * `Y` - node layout, [`Circular`] (default) or [`Linear`]
/// * `CAP` - entries per node (default 32; a power of two for `Circular`)
///
/// # Thread Safety
/// `CircleTree` is `Send + Sync` when `V: Send + Sync`. All operations take
/// `&self`.
///
/// ```rust
/// use circletree::CircleTree;
///
/// let tree: CircleTree<String> = CircleTree::new();
/// assert!(tree.insert(7, "seven".to_owned()).is_none());
/// assert_eq!(tree.search(7).as_deref().map(String::as_str), Some("seven"));
/// assert_eq!(tree.range(0, 10).len(), 1);
/// assert!(tree.delete(7).is_some());
/// assert!(tree.is_empty());
/// ```
pub struct CircleTree<V, Y: NodeLayout = Circular, const CAP: usize = 32> {
    root: AtomicPtr<Node<Y, CAP>>,
    height: AtomicU32,
    count: AtomicUsize,
    alloc: NodeAlloc,
    persist: Persist,
    config: TreeConfig,
    counters: Counters,
    #[cfg(test)]
    hooks: test_hooks::Hooks,
    collector: Collector,
    _marker: PhantomData<Arc<V>>,
}

/// A tree of linear (packed array) nodes.
pub type LinearTree<V, const CAP: usize = 32> = CircleTree<V, Linear, CAP>;

/// A tree of circular (ring) nodes.
pub type CircularTree<V, const CAP: usize = 32> = CircleTree<V, Circular, CAP>;

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    /// Create an empty tree with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::build(TreeConfig::default())
    }

    /// Create an empty tree.
    ///
    /// # Errors
    /// [`ConfigError`] if the configuration is out of range.
    pub fn with_config(config: TreeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: TreeConfig) -> Self {
        let alloc = NodeAlloc::new();
        let persist = Persist::new(config.write_latency_ns, config.flush_log);
        let root: *mut Node<Y, CAP> = alloc.alloc(Node::new(0, i64::MIN));
        // SAFETY: just allocated, not yet shared.
        unsafe { (*root).flush_whole(&persist) };

        Self {
            root: AtomicPtr::new(root),
            height: AtomicU32::new(1),
            count: AtomicUsize::new(0),
            alloc,
            persist,
            config,
            counters: Counters::default(),
            #[cfg(test)]
            hooks: test_hooks::Hooks::default(),
            collector: Collector::new(),
            _marker: PhantomData,
        }
    }

    /// Enter a protected region and return a guard.
    ///
    /// The `*_with_guard` methods reuse it to amortise guard entry.
    #[must_use]
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Number of entries.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(RELAXED)
    }

    /// Whether the tree holds no entries.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels; 1 while the root is a leaf.
    #[must_use]
    #[inline]
    pub fn height(&self) -> u32 {
        self.height.load(READ_ORD)
    }

    /// The tree's configuration.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The tree's persistence domain.
    #[must_use]
    pub const fn persist(&self) -> &Persist {
        &self.persist
    }

    /// Drain the flush log. Empty unless the tree was built with
    /// `flush_log(true)`.
    pub fn flush_log(&self) -> Vec<FlushEvent> {
        self.persist.take_log()
    }

    /// Snapshot of the tree's counters.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let c = &self.counters;
        TreeStats {
            len: self.len(),
            height: self.height(),
            nodes: self.alloc.live(),
            nodes_allocated: self.alloc.allocated(),
            nodes_retired: self.alloc.retired(),
            splits: c.splits.load(RELAXED),
            root_raises: c.root_raises.load(RELAXED),
            merges: c.merges.load(RELAXED),
            redistributions: c.redistributions.load(RELAXED),
            root_collapses: c.root_collapses.load(RELAXED),
            read_retries: c.read_retries.load(RELAXED),
            write_restarts: c.write_restarts.load(RELAXED),
            lines_flushed: self.persist.lines_flushed(),
            fences: self.persist.fences(),
            flush_log: self.persist.is_recording(),
        }
    }

    #[inline]
    const fn cx(&self) -> WriteCtx<'_> {
        WriteCtx {
            persist: &self.persist,
            fingerprints: self.config.fingerprints,
        }
    }

    #[inline]
    fn fingerprint_of(&self, key: i64) -> Option<u8> {
        self.config.fingerprints.then(|| fingerprint::hash(key))
    }

    #[inline]
    fn root_ptr(&self) -> *mut Node<Y, CAP> {
        self.root.load(READ_ORD)
    }

    /// Test hooks of this tree.
    #[cfg(test)]
    pub(crate) const fn hooks(&self) -> &test_hooks::Hooks {
        &self.hooks
    }
}

impl<V, Y, const CAP: usize> Default for CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, Y: NodeLayout, const CAP: usize> Drop for CircleTree<V, Y, CAP> {
    fn drop(&mut self) {
        let root: *mut Node<Y, CAP> = *self.root.get_mut();
        // SAFETY: `&mut self` means no other thread can reach the tree.
        // Retired nodes and values are freed by the collector's own drop.
        unsafe { self.alloc.teardown::<V, Y, CAP>(root) };
    }
}

impl<V, Y: NodeLayout, const CAP: usize> StdFmt::Debug for CircleTree<V, Y, CAP> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("CircleTree")
            .field("layout", &Y::NAME)
            .field("cap", &CAP)
            .field("len", &self.count.load(RELAXED))
            .field("height", &self.height.load(RELAXED))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
