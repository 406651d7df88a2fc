//! Descent from the root and location of the node covering a key.
//!
//! # Protocol
//!
//! 1. guard = `tree.guard()`
//! 2. Start at `root`; `lookup()` each node until the target level.
//! 3. `Child` descends, `Sibling` moves right, `Retry` re-reads the same
//!    node, `Redescend` (tombstone, or a fence raised above the key)
//!    restarts from the root.
//! 4. Writers lock the node they reached, then move right (hand-over-hand
//!    without overlap) while the key is at or past the sibling's `low_key`.
//!    A locked node whose own `low_key` is above the key is released and
//!    the descent restarts.

use std::sync::Arc;

use seize::LocalGuard;

use super::{CircleTree, Counters, MAX_READ_RETRIES};
use crate::layout::NodeLayout;
use crate::node::{Lookup, Node};
use crate::nodeversion::LockGuard;
use crate::tracing_helpers::trace_log;
use crate::value;

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    /// Borrow a node for as long as `guard` protects it.
    #[inline(always)]
    #[expect(clippy::unused_self)]
    pub(super) fn node<'g>(
        &self,
        ptr: *mut Node<Y, CAP>,
        _guard: &'g LocalGuard<'_>,
    ) -> &'g Node<Y, CAP> {
        debug_assert!(!ptr.is_null());
        // SAFETY: every pointer handed to this function was read from the
        // tree while `guard` was held; seize keeps it allocated until the
        // guard is dropped.
        unsafe { &*ptr }
    }

    #[inline]
    pub(super) fn note_retry(&self, retries: &mut u64) {
        *retries += 1;
        Counters::bump(&self.counters.read_retries);
        debug_assert!(
            *retries < MAX_READ_RETRIES,
            "optimistic read livelocked after {retries} retries"
        );
    }

    /// Descend to a node at `level` whose range may cover `key`.
    ///
    /// The returned node has not been validated for `key`; callers either
    /// `lookup()` it or lock it and chase right. Returns `None` when the
    /// tree is currently lower than `level`.
    pub(super) fn descend<'g>(
        &self,
        key: i64,
        level: u32,
        guard: &'g LocalGuard<'_>,
    ) -> Option<&'g Node<Y, CAP>> {
        let mut retries: u64 = 0;

        'restart: loop {
            let mut node: &Node<Y, CAP> = self.node(self.root_ptr(), guard);
            if node.level() < level {
                return None;
            }

            while node.level() > level {
                match node.lookup(key, None) {
                    Lookup::Child(next) | Lookup::Sibling(next) => {
                        node = self.node(next, guard);
                    }
                    Lookup::Retry => self.note_retry(&mut retries),
                    Lookup::Redescend => {
                        self.note_retry(&mut retries);
                        continue 'restart;
                    }
                    Lookup::Found(_) | Lookup::NotFound => {
                        debug_assert!(false, "leaf result from an internal node");
                        continue 'restart;
                    }
                }
            }
            return Some(node);
        }
    }

    /// Lock the node at `level` that covers `key`.
    ///
    /// Returns `None` when the tree is currently lower than `level`.
    pub(super) fn lock_covering<'g>(
        &self,
        key: i64,
        level: u32,
        guard: &'g LocalGuard<'_>,
    ) -> Option<(&'g Node<Y, CAP>, LockGuard<'g>)> {
        'restart: loop {
            let mut node: &Node<Y, CAP> = self.descend(key, level, guard)?;

            loop {
                let lock: LockGuard<'g> = node.version().lock();
                if node.version().is_deleted() {
                    drop(lock);
                    Counters::bump(&self.counters.write_restarts);
                    trace_log!(key, level, "lock_covering: tombstone, restart");
                    continue 'restart;
                }
                if key < node.low_key() {
                    drop(lock);
                    Counters::bump(&self.counters.write_restarts);
                    trace_log!(key, level, "lock_covering: below fence, restart");
                    continue 'restart;
                }

                let sibling: *mut Node<Y, CAP> = node.right();
                if !sibling.is_null() && key >= self.node(sibling, guard).low_key() {
                    drop(lock);
                    node = self.node(sibling, guard);
                    continue;
                }
                return Some((node, lock));
            }
        }
    }

    /// Find the raw value pointer stored for `key`.
    pub(super) fn get_raw(&self, key: i64, guard: &LocalGuard<'_>) -> Option<*mut u8> {
        let fp: Option<u8> = self.fingerprint_of(key);
        let mut retries: u64 = 0;

        'restart: loop {
            let Some(mut leaf) = self.descend(key, 0, guard) else {
                debug_assert!(false, "tree without a leaf level");
                return None;
            };

            loop {
                match leaf.lookup(key, fp) {
                    Lookup::Found(ptr) => return Some(ptr),
                    Lookup::NotFound => return None,
                    Lookup::Sibling(next) => leaf = self.node(next, guard),
                    Lookup::Retry => self.note_retry(&mut retries),
                    Lookup::Redescend => {
                        self.note_retry(&mut retries);
                        continue 'restart;
                    }
                    Lookup::Child(_) => {
                        debug_assert!(false, "child result from a leaf");
                        continue 'restart;
                    }
                }
            }
        }
    }

    /// Look up `key`.
    #[must_use]
    pub fn search(&self, key: i64) -> Option<Arc<V>> {
        let guard = self.guard();
        self.search_with_guard(key, &guard)
    }

    /// Look up `key` under an existing guard.
    #[must_use]
    pub fn search_with_guard(&self, key: i64, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        self.get_raw(key, guard).map(|ptr| {
            // SAFETY: the pointer was in a validated leaf snapshot taken
            // under `guard`, so any retirement of it is still pending.
            unsafe { value::share::<V>(ptr) }
        })
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: i64) -> bool {
        let guard = self.guard();
        self.get_raw(key, &guard).is_some()
    }
}
