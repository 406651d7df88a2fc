//! Delete and rebalancing.
//!
//! # Policy
//!
//! A removal that leaves a non-root node with fewer than `CAP / 2` entries
//! starts a rebalance once the node's lock has been released:
//!
//! 1. Lock the parent (found by descending with the node's `low_key`) and
//!    pair the node with its left neighbour under that parent, or its right
//!    neighbour when it is the leftmost child.
//! 2. Lock left, then right. Give up if either is tombstoned or `left` no
//!    longer links to `right`: underfull nodes are legal, the step is only
//!    an optimisation.
//! 3. Merge when everything (plus the separator, for internal nodes) fits in
//!    one node; otherwise redistribute so both halves are balanced.
//! 4. A merge removes a separator from the parent, so the parent may be
//!    rebalanced next. An internal root left without separators collapses
//!    into its only child.
//!
//! Locks are always taken parent first, then left to right.

use std::sync::Arc;

use seize::LocalGuard;

use super::{CircleTree, Counters};
use crate::config::Diagnostic;
use crate::layout::NodeLayout;
use crate::node::{ChildSlot, Node};
use crate::nodeversion::LockGuard;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, WRITE_ORD};
use crate::pmem::FlushKind;
use crate::tracing_helpers::{debug_log, trace_log};
use crate::value;

/// What to do after one rebalance step.
enum Step<N> {
    Done,
    Ascend(*mut N),
}

/// Two locked neighbours and the parent separator between them.
struct Pair<'a, 'g, N> {
    parent: &'g N,
    parent_lock: &'a mut LockGuard<'g>,
    sep_pos: usize,
    separator: i64,
    left: &'g N,
    left_lock: &'a mut LockGuard<'g>,
    right: &'g N,
    right_lock: &'a mut LockGuard<'g>,
}

#[inline]
fn ptr_of<N>(node: &N) -> *mut N {
    std::ptr::from_ref(node).cast_mut()
}

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    /// Remove `key` and return its value.
    ///
    /// An absent key is a no-op reported as [`Diagnostic::DeleteMissing`].
    pub fn delete(&self, key: i64) -> Option<Arc<V>> {
        let guard = self.guard();
        self.delete_with_guard(key, &guard)
    }

    /// [`delete`](Self::delete) under an existing guard.
    pub fn delete_with_guard(&self, key: i64, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        let cx = self.cx();
        let (leaf, mut lock) = self.lock_level(key, 0, guard);

        let Ok(pos) = leaf.position(key) else {
            drop(lock);
            debug_log!(key, "delete: key not found");
            self.config.report(Diagnostic::DeleteMissing(key));
            return None;
        };

        let old: *mut u8 = leaf.remove_at(&mut lock, pos, cx);
        self.count.fetch_sub(1, RELAXED);
        let leaf_ptr: *mut Node<Y, CAP> = ptr_of(leaf);
        let underfull: bool = leaf.is_underfull() && self.root_ptr() != leaf_ptr;
        drop(lock);

        // SAFETY: `old` left its slot above; take our reference first.
        let previous: Arc<V> = unsafe { value::share::<V>(old) };
        // SAFETY: no slot holds `old` any more; retired once.
        unsafe { self.alloc.retire_value::<V>(old, guard) };

        if underfull {
            self.rebalance(leaf_ptr, guard);
        }
        Some(previous)
    }

    /// Rebalance `start` and, while merges leave parents underfull, the
    /// levels above it.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip_all)
    )]
    fn rebalance(&self, start: *mut Node<Y, CAP>, guard: &LocalGuard<'_>) {
        let mut node: *mut Node<Y, CAP> = start;
        while let Step::Ascend(parent) = self.rebalance_step(node, guard) {
            node = parent;
        }
    }

    fn rebalance_step(
        &self,
        node_ptr: *mut Node<Y, CAP>,
        guard: &LocalGuard<'_>,
    ) -> Step<Node<Y, CAP>> {
        if node_ptr == self.root_ptr() {
            self.collapse_root(guard);
            return Step::Done;
        }

        let node: &Node<Y, CAP> = self.node(node_ptr, guard);
        let level: u32 = node.level();
        let Some((parent, mut parent_lock)) = self.lock_covering(node.low_key(), level + 1, guard)
        else {
            return Step::Done;
        };

        let Some(slot) = parent.child_slot(node_ptr) else {
            trace_log!(level, "rebalance: node not linked in parent");
            return Step::Done;
        };

        let (left_ptr, right_ptr, sep_pos) = match slot {
            ChildSlot::Leftmost if parent.is_empty() => {
                // No neighbour under this parent; fix the parent first.
                return if parent.is_underfull() {
                    Step::Ascend(ptr_of(parent))
                } else {
                    Step::Done
                };
            }
            ChildSlot::Leftmost => (node_ptr, parent.child_at(0), 0),
            ChildSlot::Entry(0) => (parent.leftmost(), node_ptr, 0),
            ChildSlot::Entry(i) => (parent.child_at(i - 1), node_ptr, i),
        };

        let left: &Node<Y, CAP> = self.node(left_ptr, guard);
        let right: &Node<Y, CAP> = self.node(right_ptr, guard);
        let mut left_lock: LockGuard<'_> = left.version().lock();
        let mut right_lock: LockGuard<'_> = right.version().lock();

        if left.version().is_deleted()
            || right.version().is_deleted()
            || left.right() != right_ptr
            || (!left.is_underfull() && !right.is_underfull())
        {
            trace_log!(level, "rebalance: pair changed, giving up");
            return Step::Done;
        }

        let separator: i64 = parent.key_at(sep_pos);
        debug_assert_eq!(separator, right.low_key());
        let pair = Pair {
            parent,
            parent_lock: &mut parent_lock,
            sep_pos,
            separator,
            left,
            left_lock: &mut left_lock,
            right,
            right_lock: &mut right_lock,
        };

        let extra: usize = usize::from(level > 0);
        if left.len() + right.len() + extra > CAP {
            self.redistribute(pair);
            Counters::bump(&self.counters.redistributions);
            return Step::Done;
        }

        self.merge(pair);
        drop(right_lock);
        drop(left_lock);
        // SAFETY: `right` is tombstoned and unlinked from its parent and
        // from `left`; no new traversal can reach it.
        unsafe { self.alloc.retire(right_ptr, guard) };
        Counters::bump(&self.counters.merges);

        let parent_ptr: *mut Node<Y, CAP> = ptr_of(parent);
        let parent_underfull: bool = parent.is_underfull();
        drop(parent_lock);

        if parent_ptr == self.root_ptr() {
            self.collapse_root(guard);
            Step::Done
        } else if parent_underfull {
            Step::Ascend(parent_ptr)
        } else {
            Step::Done
        }
    }

    /// Move everything from `right` into `left`, unlink and tombstone `right`.
    fn merge(&self, pair: Pair<'_, '_, Node<Y, CAP>>) {
        let cx = self.cx();
        let Pair {
            parent,
            parent_lock,
            sep_pos,
            separator,
            left,
            left_lock,
            right,
            right_lock,
        } = pair;

        let mut moved: Vec<(i64, *mut u8)> = Vec::with_capacity(right.len() + 1);
        if left.level() > 0 {
            moved.push((separator, right.leftmost().cast::<u8>()));
        }
        moved.extend(right.entries());
        left.append(left_lock, &moved, cx);
        left.set_right(left_lock, right.right(), cx);

        let removed: *mut u8 = parent.remove_at(parent_lock, sep_pos, cx);
        debug_assert_eq!(removed, ptr_of(right).cast::<u8>());
        right.mark_deleted(right_lock, cx);

        debug_log!(
            level = left.level(),
            separator,
            entries = left.len(),
            "merged"
        );
    }

    /// Balance entry counts between `left` and `right`.
    ///
    /// The receiver is written first, then `right.low_key` and the parent
    /// separator, then the donor is cut back.
    fn redistribute(&self, pair: Pair<'_, '_, Node<Y, CAP>>) {
        let cx = self.cx();
        let Pair {
            parent,
            parent_lock,
            sep_pos,
            separator,
            left,
            left_lock,
            right,
            right_lock,
        } = pair;

        let internal: bool = left.level() > 0;
        let lents: Vec<(i64, *mut u8)> = left.entries();
        let rents: Vec<(i64, *mut u8)> = right.entries();
        let (lc, rc) = (lents.len(), rents.len());

        if lc < rc {
            let k: usize = (rc - lc) / 2;
            if k == 0 {
                return;
            }
            let (new_sep, right_leftmost) = if internal {
                let mut moved: Vec<(i64, *mut u8)> = Vec::with_capacity(k);
                moved.push((separator, right.leftmost().cast::<u8>()));
                moved.extend_from_slice(&rents[..k - 1]);
                left.append(left_lock, &moved, cx);
                let (key, child) = rents[k - 1];
                (key, Some(child.cast::<Node<Y, CAP>>()))
            } else {
                left.append(left_lock, &rents[..k], cx);
                (rents[k].0, None)
            };
            right.set_low_key(right_lock, new_sep, cx);
            parent.set_key_at(parent_lock, sep_pos, new_sep, cx);
            right.rewrite(right_lock, &rents[k..], right_leftmost, cx);
        } else {
            let k: usize = (lc - rc) / 2;
            if k == 0 {
                return;
            }
            let keep: usize = lc - k;
            let (new_sep, right_leftmost, moved) = if internal {
                let (key, child) = lents[keep];
                let mut moved: Vec<(i64, *mut u8)> = lents[keep + 1..].to_vec();
                moved.push((separator, right.leftmost().cast::<u8>()));
                moved.extend_from_slice(&rents);
                (key, Some(child.cast::<Node<Y, CAP>>()), moved)
            } else {
                let mut moved: Vec<(i64, *mut u8)> = lents[keep..].to_vec();
                moved.extend_from_slice(&rents);
                (lents[keep].0, None, moved)
            };
            right.rewrite(right_lock, &moved, right_leftmost, cx);
            right.set_low_key(right_lock, new_sep, cx);
            parent.set_key_at(parent_lock, sep_pos, new_sep, cx);
            left.truncate(left_lock, keep, cx);
        }

        debug_log!(
            level = left.level(),
            left = left.len(),
            right = right.len(),
            "redistributed"
        );
    }

    /// Replace an internal root that has no separators by its only child.
    ///
    /// Repeats while the new root is in the same state.
    fn collapse_root(&self, guard: &LocalGuard<'_>) {
        let cx = self.cx();

        loop {
            let root_ptr: *mut Node<Y, CAP> = self.root_ptr();
            let root: &Node<Y, CAP> = self.node(root_ptr, guard);
            if root.is_leaf() || !root.is_empty() {
                return;
            }

            let mut root_lock: LockGuard<'_> = root.version().lock();
            if root.version().is_deleted() || self.root_ptr() != root_ptr || !root.is_empty() {
                return;
            }

            let child_ptr: *mut Node<Y, CAP> = root.leftmost();
            let child: &Node<Y, CAP> = self.node(child_ptr, guard);
            let child_lock: LockGuard<'_> = child.version().lock();
            if child.version().is_deleted() || !child.right().is_null() {
                return;
            }

            if self
                .root
                .compare_exchange(root_ptr, child_ptr, CAS_SUCCESS, CAS_FAILURE)
                .is_err()
            {
                return;
            }
            self.persist
                .flush(FlushKind::Root, &self.root, child_ptr.addr());
            self.height.store(child.level() + 1, WRITE_ORD);
            root.mark_deleted(&mut root_lock, cx);
            drop(child_lock);
            drop(root_lock);

            // SAFETY: the old root is tombstoned and no longer the root; it
            // has no siblings and no parent.
            unsafe { self.alloc.retire(root_ptr, guard) };
            Counters::bump(&self.counters.root_collapses);
            debug_log!(height = child.level() + 1, "root collapsed");
        }
    }
}
