//! Reclaim helpers for seize-based memory reclamation.
//!
//! - Single-object reclaimers for `guard.defer_retire()`
//! - Level-by-level teardown of a quiescent tree

use std::sync::Arc;

use seize::Collector;

use crate::layout::NodeLayout;
use crate::node::Node;
use crate::value::{self, ValueRef};

// ============================================================================
//  Single-Object Reclaimers (seize callback signatures)
// ============================================================================

/// Reclaim a boxed node (seize callback).
///
/// Retired nodes were emptied or merged away first, so their slots are not
/// owners of any value.
///
/// # Safety
///
/// - `ptr` must point to a valid node allocated via `Box::into_raw`.
/// - Must only be called after seize determines it's safe (no readers).
pub(crate) unsafe fn reclaim_node_boxed<Y: NodeLayout, const CAP: usize>(
    ptr: *mut Node<Y, CAP>,
    _collector: &Collector,
) {
    // SAFETY: Caller guarantees ptr is valid and from Box::into_raw.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Release a slot's strong reference to a value (seize callback).
///
/// # Safety
///
/// - `ptr` must come from `Arc::into_raw` and own one strong count.
/// - Must only be called after seize determines it's safe (no readers).
pub(crate) unsafe fn reclaim_value<V>(ptr: *mut V, _collector: &Collector) {
    // SAFETY: Caller guarantees ptr owns a strong count.
    unsafe { drop(Arc::from_raw(ptr.cast_const())) };
}

// ============================================================================
//  Teardown
// ============================================================================

/// Free every node of every level, top-down, and the values held by leaves.
///
/// Each level is walked along its sibling chain from the level's leftmost
/// node, which is reached through `leftmost` pointers from the root. Returns
/// the number of nodes freed.
///
/// # Safety
///
/// The tree must be quiescent and `root` must be its root.
pub(crate) unsafe fn teardown_levels<V, Y: NodeLayout, const CAP: usize>(
    root: *mut Node<Y, CAP>,
) -> usize {
    let mut freed: usize = 0;
    let mut head: *mut Node<Y, CAP> = root;

    while !head.is_null() {
        // SAFETY: live node, quiescent tree.
        let next_head: *mut Node<Y, CAP> = unsafe {
            if (*head).is_leaf() {
                std::ptr::null_mut()
            } else {
                (*head).leftmost()
            }
        };

        let mut node: *mut Node<Y, CAP> = head;
        while !node.is_null() {
            // SAFETY: live node reached through the sibling chain; nothing
            // else references it once its level is being freed.
            let boxed: Box<Node<Y, CAP>> = unsafe { Box::from_raw(node) };
            node = boxed.right();
            for i in 0..boxed.len() {
                // Child slots are freed with their own level.
                if let ValueRef::Leaf(ptr) = boxed.value_at(i) {
                    // SAFETY: a live leaf slot owns one strong count.
                    drop(unsafe { value::reclaim::<V>(ptr) });
                }
            }
            freed += 1;
        }

        head = next_head;
    }

    freed
}

// ============================================================================
//  Tests
// ============================================================================
