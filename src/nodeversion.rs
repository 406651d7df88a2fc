//! Node version for optimistic concurrency control.
//!
//! [`NodeVersion`] packs the node lock, two dirty flags, an insert counter, a
//! split counter and the `deleted`/`leaf` flags into one `u32`. It is both the
//! per-node mutual-exclusion lock and the sequence number lock-free readers
//! validate against.
//!
//! # Concurrency Model
//! 1. Readers: `stable()` → read node fields → `has_changed()`; retry on change.
//! 2. Writers: `lock()` returns a [`LockGuard`]; mark the kind of change with
//!    `mark_insert()` / `mark_split()` / `mark_deleted()` *before* touching
//!    node fields; dropping the guard bumps the matching counter and unlocks.
//!
//! ```rust
//! use circletree::nodeversion::NodeVersion;
//!
//! let v = NodeVersion::new(true);
//! let before = v.stable();
//! {
//!     let mut guard = v.lock();
//!     guard.mark_insert();
//! }
//! assert!(v.has_changed(before));
//! ```

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::thread;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED};


// ============================================================================
//  Bit Constants
// ============================================================================

/// Lock bit: node is locked for modification.
const LOCK_BIT: u32 = 1 << 0;

/// Inserting bit: entries are being inserted, removed or shifted.
const INSERTING_BIT: u32 = 1 << 1;

/// Splitting bit: entries are leaving the node (split, merge, redistribution).
const SPLITTING_BIT: u32 = 1 << 2;

/// Dirty mask: either inserting or splitting.
const DIRTY_MASK: u32 = INSERTING_BIT | SPLITTING_BIT;

/// Low bit of insert version counter.
const VINSERT_LOWBIT: u32 = 1 << 3;

/// Low bit of split version counter.
const VSPLIT_LOWBIT: u32 = 1 << 9;

/// Carry sink for the split counter; always cleared on unlock.
const OVERFLOW_BIT: u32 = 1 << 28;

/// Deleted bit: node has been tombstoned by a merge or root collapse.
const DELETED_BIT: u32 = 1 << 29;

/// Is-leaf bit: node is a leaf (level 0).
const ISLEAF_BIT: u32 = 1 << 31;

/// Unlock after split: clears the carry sink and everything below vsplit.
const SPLIT_UNLOCK_MASK: u32 = !(OVERFLOW_BIT | (VSPLIT_LOWBIT - 1));

/// Unlock after insert: clears the carry sink and everything below vinsert.
const UNLOCK_MASK: u32 = !(OVERFLOW_BIT | (VINSERT_LOWBIT - 1));

/// Busy-spins before a waiter starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Back off while another thread owns a node.
#[inline]
fn relax(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

// ============================================================================
//  NodeVersion
// ============================================================================

/// A versioned lock for tree nodes.
///
/// # Layout
/// Bit 31: `is_leaf` | Bit 29: `deleted` | Bit 28: carry sink |
/// Bits 9-27: `split_version` | Bits 3-8: `insert_version` |
/// Bit 2: `splitting` | Bit 1: `inserting` | Bit 0: `locked`
#[derive(Debug)]
pub struct NodeVersion {
    value: AtomicU32,
}

// ============================================================================
//  LockGuard (Type-State Pattern)
// ============================================================================

/// Proof that a node lock is held.
///
/// Only [`NodeVersion::lock()`] creates one. Node mutators take
/// `&mut LockGuard` so that an unlocked write does not type-check. The lock
/// is released on drop, including during unwinding.
///
/// `PhantomData<*mut ()>` keeps the guard `!Send`: a lock is released by the
/// thread that took it.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct LockGuard<'a> {
    version: &'a NodeVersion,
    locked_value: u32,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Splitting bumps the split counter, inserting bumps the insert
        // counter; `(inserting << 2)` equals VINSERT_LOWBIT when set.
        let new_value: u32 = if self.locked_value & SPLITTING_BIT != 0 {
            (self.locked_value + VSPLIT_LOWBIT) & SPLIT_UNLOCK_MASK
        } else {
            (self.locked_value + ((self.locked_value & INSERTING_BIT) << 2)) & UNLOCK_MASK
        };

        self.version.value.store(new_value, Ordering::Release);
    }
}

impl LockGuard<'_> {
    /// Get the locked version value.
    #[inline]
    #[must_use]
    pub const fn locked_value(&self) -> u32 {
        self.locked_value
    }

    /// Announce an in-place change (insert, remove, value swap).
    ///
    /// Readers that start after this spin in `stable()`; readers already in
    /// flight fail `has_changed()`. The release fence keeps the node writes
    /// that follow from becoming visible before the dirty bit.
    #[inline]
    pub fn mark_insert(&mut self) {
        if self.locked_value & INSERTING_BIT != 0 {
            return;
        }
        self.locked_value |= INSERTING_BIT;
        self.version.value.store(self.locked_value, RELAXED);
        fence(Ordering::Release);
    }

    /// Announce that entries are leaving this node.
    #[inline]
    pub fn mark_split(&mut self) {
        if self.locked_value & SPLITTING_BIT != 0 {
            return;
        }
        self.locked_value |= SPLITTING_BIT;
        self.version.value.store(self.locked_value, RELAXED);
        fence(Ordering::Release);
    }

    /// Tombstone the node.
    ///
    /// Also sets the splitting bit so the version bumps on unlock.
    #[inline]
    pub fn mark_deleted(&mut self) {
        self.locked_value |= DELETED_BIT | SPLITTING_BIT;
        self.version.value.store(self.locked_value, RELAXED);
        fence(Ordering::Release);
    }
}

impl NodeVersion {
    /// Create a new node version.
    ///
    /// # Arguments
    /// - `is_leaf` - true for level-0 nodes
    #[must_use]
    pub const fn new(is_leaf: bool) -> Self {
        let initial: u32 = if is_leaf { ISLEAF_BIT } else { 0 };

        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// Create a node version from a raw value.
    ///
    /// Only meant for tests.
    #[must_use]
    pub const fn from_value(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
        }
    }

    // ========================================================================
    //  Flag Accessors
    // ========================================================================

    /// Check if this is a leaf node.
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        (self.value.load(RELAXED) & ISLEAF_BIT) != 0
    }

    /// Check if this node is tombstoned.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        (self.value.load(Ordering::Acquire) & DELETED_BIT) != 0
    }

    /// Whether a version value carries the deleted flag.
    #[inline]
    #[must_use]
    pub const fn value_is_deleted(value: u32) -> bool {
        (value & DELETED_BIT) != 0
    }

    /// Check if this node is locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        (self.value.load(RELAXED) & LOCK_BIT) != 0
    }

    /// Check if this node is being inserted into.
    #[inline]
    #[must_use]
    pub fn is_inserting(&self) -> bool {
        (self.value.load(RELAXED) & INSERTING_BIT) != 0
    }

    /// Check if this node is being split.
    #[inline]
    #[must_use]
    pub fn is_splitting(&self) -> bool {
        (self.value.load(RELAXED) & SPLITTING_BIT) != 0
    }

    /// Check if any dirty bit is set.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        (self.value.load(RELAXED) & DIRTY_MASK) != 0
    }

    /// Get the raw version value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u32 {
        self.value.load(RELAXED)
    }

    // ========================================================================
    //  Stable Version (for optimistic reads)
    // ========================================================================

    /// Wait for a version with no dirty bits and return it.
    ///
    /// Use with [`has_changed()`](Self::has_changed) after reading.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u32 {
        let mut spins: u32 = 0;
        loop {
            let value: u32 = self.value.load(Ordering::Acquire);
            if value & DIRTY_MASK == 0 {
                return value;
            }
            relax(&mut spins);
        }
    }

    /// Check if the version has changed since `old`.
    ///
    /// A change of the lock bit alone does not count: `(old ^ new) == 1`
    /// is not `> LOCK_BIT`.
    #[inline]
    #[must_use]
    pub fn has_changed(&self, old: u32) -> bool {
        // Orders the caller's field loads before the version re-read.
        fence(Ordering::Acquire);
        (old ^ self.value.load(RELAXED)) > LOCK_BIT
    }

    /// Check if entries may have left the node since `old`.
    #[inline]
    #[must_use]
    pub fn has_split(&self, old: u32) -> bool {
        fence(Ordering::Acquire);
        (old ^ self.value.load(RELAXED)) >= VSPLIT_LOWBIT
    }

    // ========================================================================
    //  Lock Operations (Type-State Pattern)
    // ========================================================================

    /// Acquire the lock, spinning (then yielding) while another thread holds it.
    #[must_use = "releasing a lock without using the guard is a logic error"]
    pub fn lock(&self) -> LockGuard<'_> {
        let mut spins: u32 = 0;
        let mut value: u32 = self.value.load(RELAXED);

        loop {
            if value & LOCK_BIT != 0 {
                relax(&mut spins);
                value = self.value.load(RELAXED);
                continue;
            }

            match self.value.compare_exchange_weak(
                value,
                value | LOCK_BIT,
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                Ok(_) => {
                    return LockGuard {
                        version: self,
                        locked_value: value | LOCK_BIT,
                        _marker: PhantomData,
                    };
                }
                Err(current) => value = current,
            }
        }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// # Returns
    /// `Some(guard)` if the lock was free.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let value: u32 = self.value.load(RELAXED);

        if (value & LOCK_BIT) != 0 {
            return None;
        }

        self.value
            .compare_exchange(value, value | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .ok()
            .map(|_| LockGuard {
                version: self,
                locked_value: value | LOCK_BIT,
                _marker: PhantomData,
            })
    }
}

impl Default for NodeVersion {
    /// Creates a new leaf node version.
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[test]
    fn test_new_leaf() {
        let v = NodeVersion::new(true);
        assert!(v.is_leaf());
        assert!(!v.is_deleted());
        assert!(!v.is_locked());
        assert!(!v.is_dirty());
    }

    #[test]
    fn test_new_internal() {
        let v = NodeVersion::new(false);
        assert!(!v.is_leaf());
        assert!(!v.is_locked());
    }

    #[test]
    fn test_lock_unlock_roundtrip() {
        let v = NodeVersion::new(true);
        let stable_before: u32 = v.stable();

        {
            let guard: LockGuard<'_> = v.lock();
            assert!(v.is_locked());
            assert_eq!(guard.locked_value() & LOCK_BIT, LOCK_BIT);
        }

        assert!(!v.is_locked());
        assert!(!v.has_changed(stable_before));
    }

    #[test]
    fn test_try_lock() {
        let v = NodeVersion::new(true);

        let guard: Option<LockGuard<'_>> = v.try_lock();
        assert!(guard.is_some());

        let second: Option<LockGuard<'_>> = v.try_lock();
        assert!(second.is_none());

        drop(guard);
        assert!(!v.is_locked());
        assert!(v.try_lock().is_some());
    }

    #[test]
    fn test_version_increment_on_insert() {
        let v: NodeVersion = NodeVersion::new(true);
        let stable_before: u32 = v.stable();

        {
            let mut guard: LockGuard<'_> = v.lock();
            guard.mark_insert();
            assert!(v.is_inserting());
        }

        assert!(v.has_changed(stable_before));
        assert!(!v.has_split(stable_before));
        assert!(!v.is_dirty());
    }

    #[test]
    fn test_version_increment_on_split() {
        let v: NodeVersion = NodeVersion::new(false);
        let stable_before: u32 = v.stable();

        {
            let mut guard: LockGuard<'_> = v.lock();
            guard.mark_split();
            assert!(v.is_splitting());
        }

        assert!(v.has_changed(stable_before));
        assert!(v.has_split(stable_before));
    }

    #[test]
    fn test_mark_deleted_persists() {
        let v = NodeVersion::new(true);

        {
            let mut guard: LockGuard<'_> = v.lock();
            guard.mark_deleted();
            assert!(v.is_deleted());
            assert!(v.is_splitting());
        }

        assert!(v.is_deleted());
        assert!(NodeVersion::value_is_deleted(v.stable()));
        assert!(v.is_leaf());
    }

    #[test]
    fn test_has_changed_ignores_lock_bit() {
        let v = NodeVersion::new(true);
        let stable: u32 = v.stable();

        let _guard: LockGuard<'_> = v.lock();
        assert!(
            !v.has_changed(stable),
            "lock bit alone should not trigger has_changed"
        );
    }

    #[test]
    fn test_insert_counter_carries_into_split_counter() {
        let near_max: u32 = ISLEAF_BIT | (VSPLIT_LOWBIT - VINSERT_LOWBIT);
        let v = NodeVersion::from_value(near_max);
        let stable_before: u32 = v.stable();

        {
            let mut guard: LockGuard<'_> = v.lock();
            guard.mark_insert();
        }

        assert!(v.has_changed(stable_before));
        assert!(v.is_leaf());
        assert!(!v.is_deleted());
    }

    #[test]
    fn test_split_counter_overflow_never_sets_deleted() {
        let near_max: u32 = OVERFLOW_BIT - VSPLIT_LOWBIT;
        let v = NodeVersion::from_value(near_max);

        {
            let mut guard: LockGuard<'_> = v.lock();
            guard.mark_split();
        }

        assert!(!v.is_deleted());
        assert_eq!(v.value() & OVERFLOW_BIT, 0);
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 2_000;

        let v = Arc::new(NodeVersion::new(true));
        // Non-atomic read-modify-write under the lock; lost updates mean the
        // lock did not exclude.
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let v = Arc::clone(&v);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = v.lock();
                        guard.mark_insert();
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), THREADS as u64 * ROUNDS);
        assert!(!v.is_locked());
    }
}
