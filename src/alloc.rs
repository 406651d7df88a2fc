//! Node allocation and deferred reclamation.
//!
//! Nodes are boxed and handed out as raw pointers. A node or value that has
//! been unlinked is retired through the tree's `seize` collector and freed
//! once no guard that could still observe it remains. Live nodes are freed
//! by [`NodeAlloc::teardown`] when the tree is dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize};

use seize::{Guard, LocalGuard};

use crate::layout::NodeLayout;
use crate::node::Node;
use crate::ordering::RELAXED;

mod reclaim;

use reclaim::{reclaim_node_boxed, reclaim_value};

/// Allocation bookkeeping for one tree.
#[derive(Debug, Default)]
pub struct NodeAlloc {
    live: AtomicUsize,
    allocated: AtomicU64,
    retired: AtomicU64,
}

impl NodeAlloc {
    /// Create empty bookkeeping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    /// Box a node and return a stable pointer to it.
    pub fn alloc<Y: NodeLayout, const CAP: usize>(&self, node: Node<Y, CAP>) -> *mut Node<Y, CAP> {
        let ptr: *mut Node<Y, CAP> = Box::into_raw(Box::new(node));
        self.track(ptr);
        ptr
    }

    /// Account for a node boxed elsewhere (a split sibling).
    pub fn track<Y: NodeLayout, const CAP: usize>(&self, _ptr: *mut Node<Y, CAP>) {
        self.live.fetch_add(1, RELAXED);
        self.allocated.fetch_add(1, RELAXED);
    }

    /// Free a node that was never published.
    ///
    /// # Safety
    /// `ptr` came from [`alloc`](Self::alloc) and no other thread has seen it.
    pub unsafe fn free_unpublished<Y: NodeLayout, const CAP: usize>(&self, ptr: *mut Node<Y, CAP>) {
        self.live.fetch_sub(1, RELAXED);
        // SAFETY: caller guarantees exclusive ownership.
        unsafe { drop(Box::from_raw(ptr)) };
    }

    /// Retire an unlinked node.
    ///
    /// # Safety
    /// `ptr` is unreachable from the root and the sibling chains, and is
    /// retired at most once.
    pub unsafe fn retire<Y: NodeLayout, const CAP: usize>(
        &self,
        ptr: *mut Node<Y, CAP>,
        guard: &LocalGuard<'_>,
    ) {
        self.live.fetch_sub(1, RELAXED);
        self.retired.fetch_add(1, RELAXED);
        // SAFETY: caller guarantees the node is unlinked.
        unsafe { guard.defer_retire(ptr, reclaim_node_boxed::<Y, CAP>) };
    }

    /// Retire a replaced or deleted leaf value.
    ///
    /// # Safety
    /// `ptr` came from leaking an `Arc<V>` into a slot, that slot no longer
    /// holds it, and it is retired at most once.
    pub unsafe fn retire_value<V>(&self, ptr: *mut u8, guard: &LocalGuard<'_>) {
        // SAFETY: caller transfers the slot's strong reference.
        unsafe { guard.defer_retire(ptr.cast::<V>(), reclaim_value::<V>) };
    }

    /// Free every live node reachable from `root`, dropping leaf values.
    ///
    /// # Safety
    /// No other thread may access the tree, and `root` is its current root.
    pub unsafe fn teardown<V, Y: NodeLayout, const CAP: usize>(&self, root: *mut Node<Y, CAP>) {
        // SAFETY: forwarded.
        let freed: usize = unsafe { reclaim::teardown_levels::<V, Y, CAP>(root) };
        self.live.store(self.live().saturating_sub(freed), RELAXED);
    }

    /// Nodes currently linked into the tree.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(RELAXED)
    }

    /// Nodes allocated over the tree's lifetime.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(RELAXED)
    }

    /// Nodes retired over the tree's lifetime.
    #[must_use]
    pub fn retired(&self) -> u64 {
        self.retired.load(RELAXED)
    }
}
