//! Insert, split propagation and root raise.
//!
//! # Split protocol
//!
//! 1. The full node is locked and `Node::split` builds the sibling, flushes
//!    it, links it and truncates the node.
//! 2. Still under the lock: if the node is the root, a new root holding
//!    `(leftmost = node, split_key -> sibling)` is flushed and installed with
//!    a CAS on `root`. Only the holder of the root's lock can get here, so
//!    at most one new root is installed per split.
//! 3. Otherwise the lock is released and the split key is inserted into the
//!    level above. Readers that arrive before that find the sibling through
//!    the sibling-chase.

use std::sync::Arc;
use std::thread;

use seize::LocalGuard;

use super::{CircleTree, Counters};
use crate::layout::NodeLayout;
use crate::node::Node;
use crate::nodeversion::LockGuard;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, WRITE_ORD};
use crate::pmem::FlushKind;
use crate::tracing_helpers::{debug_log, trace_log};
use crate::value;

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    /// Insert or replace `key`.
    ///
    /// Returns the previous value when the key was present.
    pub fn insert(&self, key: i64, value: V) -> Option<Arc<V>> {
        self.insert_arc(key, Arc::new(value))
    }

    /// Insert or replace `key` with a shared value.
    pub fn insert_arc(&self, key: i64, value: Arc<V>) -> Option<Arc<V>> {
        let guard = self.guard();
        self.insert_with_guard(key, value, &guard)
    }

    /// [`insert_arc`](Self::insert_arc) under an existing guard.
    pub fn insert_with_guard(
        &self,
        key: i64,
        value: Arc<V>,
        guard: &LocalGuard<'_>,
    ) -> Option<Arc<V>> {
        let ptr: *mut u8 = value::leak(value);
        let cx = self.cx();

        let (leaf, mut lock) = self.lock_level(key, 0, guard);

        match leaf.position(key) {
            Ok(pos) => {
                let old: *mut u8 = leaf.replace_at(&mut lock, pos, ptr, cx);
                drop(lock);
                // SAFETY: `old` was the slot's value until the swap above;
                // take our reference before the slot's one is retired.
                let previous: Arc<V> = unsafe { value::share::<V>(old) };
                // SAFETY: no slot holds `old` any more; retired once.
                unsafe { self.alloc.retire_value::<V>(old, guard) };
                Some(previous)
            }

            Err(pos) => {
                self.count.fetch_add(1, RELAXED);
                if leaf.is_full() {
                    self.split_and_propagate(leaf, lock, key, ptr, guard);
                } else {
                    leaf.insert_at(&mut lock, pos, key, ptr, cx);
                }
                None
            }
        }
    }

    /// Split `node` while inserting `(key, ptr)`, then publish the split key
    /// upward, splitting parents as needed.
    fn split_and_propagate<'g>(
        &self,
        node: &'g Node<Y, CAP>,
        lock: LockGuard<'g>,
        key: i64,
        ptr: *mut u8,
        guard: &'g LocalGuard<'_>,
    ) {
        let cx = self.cx();
        let (mut node, mut lock, mut key, mut ptr) = (node, lock, key, ptr);

        loop {
            let split = node.split(&mut lock, key, ptr, cx);
            self.alloc.track(split.sibling);
            Counters::bump(&self.counters.splits);
            debug_log!(
                level = node.level(),
                split_key = split.split_key,
                "split"
            );

            if self.raise_root(node, split.split_key, split.sibling) {
                drop(lock);
                return;
            }

            let level: u32 = node.level() + 1;
            drop(lock);

            #[cfg(test)]
            self.hooks.call_before_propagate(split.split_key);

            let (parent, mut parent_lock) = self.lock_level(split.split_key, level, guard);
            match parent.position(split.split_key) {
                Ok(_) => {
                    debug_assert!(false, "split key {} already in parent", split.split_key);
                    return;
                }
                Err(pos) if !parent.is_full() => {
                    parent.insert_at(&mut parent_lock, pos, split.split_key, split.sibling.cast(), cx);
                    return;
                }
                Err(_) => {
                    node = parent;
                    lock = parent_lock;
                    key = split.split_key;
                    ptr = split.sibling.cast();
                }
            }
        }
    }

    /// Install a new root above `node` if `node` is the root.
    ///
    /// Called with `node` locked.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip_all, fields(level = node.level(), split_key = split_key))
    )]
    fn raise_root(&self, node: &Node<Y, CAP>, split_key: i64, sibling: *mut Node<Y, CAP>) -> bool {
        let node_ptr: *mut Node<Y, CAP> = std::ptr::from_ref(node).cast_mut();
        if self.root_ptr() != node_ptr {
            return false;
        }

        let cx = self.cx();
        let new_root: *mut Node<Y, CAP> =
            self.alloc
                .alloc(Node::new_root(node, split_key, sibling, cx));
        // SAFETY: just allocated, not yet shared.
        unsafe { (*new_root).flush_whole(&self.persist) };

        match self
            .root
            .compare_exchange(node_ptr, new_root, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(_) => {
                self.persist
                    .flush(FlushKind::Root, &self.root, new_root.addr());
                self.height.store(node.level() + 2, WRITE_ORD);
                Counters::bump(&self.counters.root_raises);
                debug_log!(height = node.level() + 2, "root raised");
                true
            }
            Err(_) => {
                // SAFETY: the CAS failed, so nothing published `new_root`.
                unsafe { self.alloc.free_unpublished(new_root) };
                false
            }
        }
    }

    /// Lock the node at `level` covering `key`, waiting for a pending root
    /// raise when the tree is not that tall yet.
    pub(super) fn lock_level<'g>(
        &self,
        key: i64,
        level: u32,
        guard: &'g LocalGuard<'_>,
    ) -> (&'g Node<Y, CAP>, LockGuard<'g>) {
        loop {
            if let Some(found) = self.lock_covering(key, level, guard) {
                return found;
            }
            trace_log!(key, level, "waiting for root raise");
            thread::yield_now();
        }
    }
}
