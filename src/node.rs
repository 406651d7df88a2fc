//! Fixed-capacity tree node.
//!
//! One node type serves both leaves and internal nodes; `level` decides what
//! the entry pointers mean (see [`ValueRef`]). The [`NodeLayout`] parameter
//! decides where logical entry `i` lives in the slot array.
//!
//! # Memory Layout (CAP = 32)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Cache Line 0: header                                         │
//! │   version: NodeVersion      level: u32                       │
//! │   count: u16  first_index: u16  switch_counter: u8           │
//! │   low_key: i64  leftmost: ptr  right_sibling: ptr            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ fingerprints: [u8; CAP]                                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Cache Lines 2..: slots [{ key: i64, ptr: ptr }; CAP]         │
//! │   four 16-byte entries per line                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Routing
//!
//! ```text
//!        [K0 | K1 | K2]          internal node, level > 0
//!       /    |    |    \
//!  leftmost  C0   C1   C2
//!
//!  leftmost: keys <  K0        Ci: keys >= Ki (and < K(i+1))
//!  right_sibling.low_key: every key >= it lives to the right
//! ```
//!
//! # Concurrency
//!
//! Readers never lock. [`Node::lookup`] and [`Node::scan`] read under a
//! stable version and validate with `has_changed()`. All mutators take
//! `&mut LockGuard` as proof that the caller holds this node's lock.
//!
//! # Persistence
//!
//! Entry writes go through a [`FlushBatch`] so a shift flushes each touched
//! cache line once. The header line is flushed after the entries it
//! describes.

use std::fmt::Write as _;
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, AtomicU16};

use crate::fingerprint;
use crate::layout::NodeLayout;
use crate::nodeversion::{LockGuard, NodeVersion};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pmem::{FlushBatch, FlushKind, Persist};
use crate::value::ValueRef;

/// Key written to slots that hold no entry.
///
/// Slots past `count` are never read for routing, so `i64::MAX` stays a
/// usable key.
pub const EMPTY_KEY: i64 = i64::MAX;

// ============================================================================
//  Entry
// ============================================================================

/// One key/pointer slot. Four slots share a cache line.
#[repr(C)]
#[derive(Debug)]
pub struct Entry {
    key: AtomicI64,
    ptr: AtomicPtr<u8>,
}

impl Entry {
    const fn empty() -> Self {
        Self {
            key: AtomicI64::new(EMPTY_KEY),
            ptr: AtomicPtr::new(StdPtr::null_mut()),
        }
    }
}

#[repr(C, align(64))]
#[derive(Debug)]
struct Slots<const CAP: usize>([Entry; CAP]);

// ============================================================================
//  Results
// ============================================================================

/// Outcome of a lock-free [`Node::lookup`].
#[derive(Debug)]
pub enum Lookup<N> {
    /// Leaf entry found; raw value pointer.
    Found(*mut u8),
    /// Leaf holds no entry for the key.
    NotFound,
    /// Internal node: descend into this child.
    Child(*mut N),
    /// The key belongs to the right sibling.
    Sibling(*mut N),
    /// The node changed under the read; read it again.
    Retry,
    /// The node is tombstoned or its lower fence moved above the key;
    /// descend again from the root.
    Redescend,
}

/// Outcome of one [`Node::scan`] step.
#[derive(Debug)]
pub enum ScanStep<N> {
    /// The node changed under the read; scan it again.
    Retry,
    /// The node no longer covers the cursor; descend again from the root.
    Redescend,
    /// No more keys can be in range.
    Done,
    /// Continue in `sibling`, whose lower fence was `low`.
    Next {
        /// Next node in the chain.
        sibling: *mut N,
        /// Its lower fence as seen by this read.
        low: i64,
    },
}

// Manual impls: comparing results compares pointers, never nodes.
impl<N> PartialEq for Lookup<N> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Found(a), Self::Found(b)) => a == b,
            (Self::Child(a), Self::Child(b)) | (Self::Sibling(a), Self::Sibling(b)) => a == b,
            (Self::NotFound, Self::NotFound)
            | (Self::Retry, Self::Retry)
            | (Self::Redescend, Self::Redescend) => true,
            _ => false,
        }
    }
}

impl<N> Eq for Lookup<N> {}

impl<N> PartialEq for ScanStep<N> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Next { sibling: a, low: x },
                Self::Next { sibling: b, low: y },
            ) => a == b && x == y,
            (Self::Retry, Self::Retry)
            | (Self::Redescend, Self::Redescend)
            | (Self::Done, Self::Done) => true,
            _ => false,
        }
    }
}

impl<N> Eq for ScanStep<N> {}

/// Position of a child inside its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSlot {
    /// The parent's `leftmost` pointer.
    Leftmost,
    /// Logical entry `i`.
    Entry(usize),
}

/// Write-side context shared by all mutators.
#[derive(Debug, Clone, Copy)]
pub struct WriteCtx<'a> {
    /// Persistence domain.
    pub persist: &'a Persist,
    /// Maintain leaf fingerprints.
    pub fingerprints: bool,
}

/// Result of a split: the new right sibling and the key promoted to the
/// parent.
#[derive(Debug)]
pub struct Split<N> {
    /// The freshly published right sibling.
    pub sibling: *mut N,
    /// Lower fence of the sibling.
    pub split_key: i64,
}

// ============================================================================
//  Node
// ============================================================================

/// A tree node holding up to `CAP` entries.
///
/// # Type Parameters
/// * `Y` - entry placement ([`Linear`](crate::Linear) or
///   [`Circular`](crate::Circular))
/// * `CAP` - slot count; `>= 4`, a power of two for ring layouts
///
/// # Invariants
/// - Logical entries `0..count` are strictly increasing by key.
/// - Every key in the node is `>= low_key`.
/// - Every key `>= right_sibling.low_key` lives to the right.
/// - `leftmost` is non-null exactly when `level > 0`.
#[repr(C, align(64))]
pub struct Node<Y: NodeLayout, const CAP: usize> {
    version: NodeVersion,
    level: u32,
    count: AtomicU16,
    first_index: AtomicU16,
    /// Linear layout only: parity gives the scan direction.
    switch_counter: AtomicU8,
    low_key: AtomicI64,
    leftmost: AtomicPtr<Self>,
    right_sibling: AtomicPtr<Self>,
    fingerprints: [AtomicU8; CAP],
    slots: Slots<CAP>,
    _layout: PhantomData<fn() -> Y>,
}

impl<Y: NodeLayout, const CAP: usize> Node<Y, CAP> {
    const CAP_CHECK: () = assert!(
        CAP >= 4 && CAP <= u16::MAX as usize && (!Y::RING || CAP.is_power_of_two()),
        "CAP must be >= 4 and a power of two for ring layouts"
    );

    /// Create an empty node.
    ///
    /// # Arguments
    /// - `level` - 0 for a leaf
    /// - `low_key` - lower fence, `i64::MIN` for the leftmost node of a level
    #[must_use]
    pub fn new(level: u32, low_key: i64) -> Self {
        let () = Self::CAP_CHECK;
        Self {
            version: NodeVersion::new(level == 0),
            level,
            count: AtomicU16::new(0),
            first_index: AtomicU16::new(0),
            switch_counter: AtomicU8::new(0),
            low_key: AtomicI64::new(low_key),
            leftmost: AtomicPtr::new(StdPtr::null_mut()),
            right_sibling: AtomicPtr::new(StdPtr::null_mut()),
            fingerprints: std::array::from_fn(|_| AtomicU8::new(0)),
            slots: Slots(std::array::from_fn(|_| Entry::empty())),
            _layout: PhantomData,
        }
    }

    /// Create an internal node whose first child is `leftmost`.
    #[must_use]
    pub fn new_internal(level: u32, low_key: i64, leftmost: *mut Self) -> Self {
        debug_assert!(level > 0);
        let node = Self::new(level, low_key);
        node.leftmost.store(leftmost, RELAXED);
        node
    }

    /// Build the root that replaces `left` after it split off `right`.
    ///
    /// Flush it with [`flush_whole`](Self::flush_whole) once it has its
    /// final address.
    #[must_use]
    pub fn new_root(left: &Self, split_key: i64, right: *mut Self, cx: WriteCtx<'_>) -> Self {
        let root = Self::new_internal(
            left.level + 1,
            left.low_key.load(RELAXED),
            StdPtr::from_ref(left).cast_mut(),
        );
        root.fill(&[(split_key, right.cast::<u8>())], cx);
        root
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// The node's version word and lock.
    #[inline(always)]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Level, 0 for leaves.
    #[inline(always)]
    pub const fn level(&self) -> u32 {
        self.level
    }

    /// Whether this is a leaf.
    #[inline(always)]
    pub const fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        usize::from(self.count.load(RELAXED)).min(CAP)
    }

    /// Whether the node holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an insert would need a split.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= CAP
    }

    /// Whether the node holds fewer than `CAP / 2` entries.
    #[inline]
    pub fn is_underfull(&self) -> bool {
        self.len() < CAP / 2
    }

    /// Lower fence.
    #[inline]
    pub fn low_key(&self) -> i64 {
        self.low_key.load(READ_ORD)
    }

    /// First child of an internal node.
    #[inline]
    pub fn leftmost(&self) -> *mut Self {
        self.leftmost.load(READ_ORD)
    }

    /// Right sibling, null at the end of a level.
    #[inline]
    pub fn right(&self) -> *mut Self {
        self.right_sibling.load(READ_ORD)
    }

    /// Physical slot of logical entry 0. Always 0 for the linear layout.
    #[inline]
    pub fn first_index(&self) -> usize {
        self.first()
    }

    #[inline]
    fn first(&self) -> usize {
        if Y::RING {
            usize::from(self.first_index.load(RELAXED)) & (CAP - 1)
        } else {
            0
        }
    }

    #[inline(always)]
    fn phys(first: usize, logical: usize) -> usize {
        Y::physical::<CAP>(first, logical)
    }

    #[inline(always)]
    fn slot(&self, phys: usize) -> &Entry {
        &self.slots.0[phys % CAP]
    }

    #[inline(always)]
    fn fp(&self, phys: usize) -> &AtomicU8 {
        &self.fingerprints[phys % CAP]
    }

    /// Key of logical entry `i`. Caller holds the lock or the node is
    /// quiescent.
    #[inline]
    pub fn key_at(&self, i: usize) -> i64 {
        self.slot(Self::phys(self.first(), i)).key.load(RELAXED)
    }

    /// Pointer of logical entry `i`. Same rules as [`key_at`](Self::key_at).
    #[inline]
    pub fn ptr_at(&self, i: usize) -> *mut u8 {
        self.slot(Self::phys(self.first(), i)).ptr.load(READ_ORD)
    }

    /// Decoded pointer of logical entry `i`.
    #[inline]
    pub fn value_at(&self, i: usize) -> ValueRef<Self> {
        ValueRef::decode(self.level, self.ptr_at(i))
    }

    /// Child pointer of logical entry `i` in an internal node.
    ///
    /// Null for a leaf.
    #[inline]
    pub fn child_at(&self, i: usize) -> *mut Self {
        debug_assert!(!self.is_leaf(), "child_at on a leaf");
        self.value_at(i).child().unwrap_or(StdPtr::null_mut())
    }

    /// All entries in logical order.
    pub fn entries(&self) -> Vec<(i64, *mut u8)> {
        (0..self.len()).map(|i| (self.key_at(i), self.ptr_at(i))).collect()
    }

    /// Keys in logical order.
    pub fn keys(&self) -> Vec<i64> {
        (0..self.len()).map(|i| self.key_at(i)).collect()
    }

    /// Stored fingerprint of logical entry `i`.
    #[inline]
    pub fn fingerprint_at(&self, i: usize) -> u8 {
        self.fp(Self::phys(self.first(), i)).load(RELAXED)
    }

    /// Address used to identify this node in the flush log.
    #[inline]
    pub fn addr(&self) -> usize {
        StdPtr::from_ref(self).addr()
    }

    /// Index of `key`, or the insertion position. Locked or quiescent only.
    pub fn position(&self, key: i64) -> Result<usize, usize> {
        let (mut lo, mut hi) = (0_usize, self.len());
        while lo < hi {
            let mid: usize = lo + (hi - lo) / 2;
            match self.key_at(mid).cmp(&key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Where `child` hangs off this internal node, if it does.
    pub fn child_slot(&self, child: *mut Self) -> Option<ChildSlot> {
        if self.leftmost.load(RELAXED) == child {
            return Some(ChildSlot::Leftmost);
        }
        (0..self.len())
            .find(|&i| self.child_at(i) == child)
            .map(ChildSlot::Entry)
    }

    // ========================================================================
    //  Lock-free reads
    // ========================================================================

    /// Route `key` through this node without locking.
    ///
    /// `fp` is the key's fingerprint when leaf fingerprints are enabled.
    pub fn lookup(&self, key: i64, fp: Option<u8>) -> Lookup<Self> {
        let v: u32 = self.version.stable();
        if NodeVersion::value_is_deleted(v) {
            return Lookup::Redescend;
        }

        let low: i64 = self.low_key.load(READ_ORD);
        let switch: u8 = self.switch_counter.load(RELAXED);
        let count: usize = self.len();
        let first: usize = self.first();

        let hit: *mut u8 = if self.level == 0 {
            self.scan_leaf(key, fp, first, count, Y::scans_forward(switch))
        } else {
            let mut child: *mut u8 = self.leftmost.load(READ_ORD).cast::<u8>();
            for i in 0..count {
                let slot = self.slot(Self::phys(first, i));
                if key < slot.key.load(RELAXED) {
                    break;
                }
                child = slot.ptr.load(READ_ORD);
            }
            child
        };

        let sibling: *mut Self = self.right_sibling.load(READ_ORD);
        let sibling_low: Option<i64> = if sibling.is_null() {
            None
        } else {
            // SAFETY: a published sibling stays allocated while the caller's
            // guard is held.
            Some(unsafe { (*sibling).low_key.load(READ_ORD) })
        };

        if self.version.has_changed(v) || self.switch_counter.load(RELAXED) != switch {
            return Lookup::Retry;
        }

        // A redistribution raised the fence after the caller routed here.
        if key < low {
            return Lookup::Redescend;
        }

        if let Some(sibling_low) = sibling_low {
            if key >= sibling_low {
                return Lookup::Sibling(sibling);
            }
        }

        match ValueRef::<Self>::decode(self.level, hit) {
            ValueRef::Child(child) => Lookup::Child(child),
            ValueRef::Leaf(ptr) if ptr.is_null() => Lookup::NotFound,
            ValueRef::Leaf(ptr) => Lookup::Found(ptr),
        }
    }

    fn scan_leaf(
        &self,
        key: i64,
        fp: Option<u8>,
        first: usize,
        count: usize,
        forward: bool,
    ) -> *mut u8 {
        let probe = |i: usize| -> Option<*mut u8> {
            let phys: usize = Self::phys(first, i);
            if let Some(f) = fp {
                if self.fp(phys).load(RELAXED) != f {
                    return None;
                }
            }
            let slot = self.slot(phys);
            (slot.key.load(RELAXED) == key).then(|| slot.ptr.load(READ_ORD))
        };

        let found = if forward {
            (0..count).find_map(probe)
        } else {
            (0..count).rev().find_map(probe)
        };
        found.unwrap_or(StdPtr::null_mut())
    }

    /// Collect leaf entries with `cursor <= key <= max` into `out`.
    ///
    /// `out` is only extended when the read validates.
    pub fn scan(&self, cursor: i64, max: i64, out: &mut Vec<(i64, *mut u8)>) -> ScanStep<Self> {
        let v: u32 = self.version.stable();
        if NodeVersion::value_is_deleted(v) || self.low_key.load(READ_ORD) > cursor {
            return ScanStep::Redescend;
        }

        let count: usize = self.len();
        let first: usize = self.first();
        let mut local: Vec<(i64, *mut u8)> = Vec::new();
        let mut past_max = false;
        for i in 0..count {
            let slot = self.slot(Self::phys(first, i));
            let k: i64 = slot.key.load(RELAXED);
            if k > max {
                past_max = true;
                break;
            }
            if k >= cursor {
                local.push((k, slot.ptr.load(READ_ORD)));
            }
        }

        let sibling: *mut Self = self.right_sibling.load(READ_ORD);
        let sibling_low: i64 = if sibling.is_null() {
            i64::MAX
        } else {
            // SAFETY: see `lookup`.
            unsafe { (*sibling).low_key.load(READ_ORD) }
        };

        if self.version.has_changed(v) {
            return ScanStep::Retry;
        }
        out.append(&mut local);

        if past_max || sibling.is_null() || sibling_low > max {
            ScanStep::Done
        } else {
            ScanStep::Next {
                sibling,
                low: sibling_low,
            }
        }
    }

    // ========================================================================
    //  Raw slot writes (locked or unpublished)
    // ========================================================================

    fn store_slot(&self, phys: usize, key: i64, ptr: *mut u8, cx: WriteCtx<'_>) {
        let slot = self.slot(phys);
        slot.key.store(key, RELAXED);
        slot.ptr.store(ptr, WRITE_ORD);
        if cx.fingerprints && self.level == 0 {
            self.fp(phys).store(fingerprint::hash(key), RELAXED);
        }
    }

    fn write_slot(
        &self,
        phys: usize,
        key: i64,
        ptr: *mut u8,
        cx: WriteCtx<'_>,
        batch: &mut FlushBatch<'_>,
    ) {
        self.store_slot(phys, key, ptr, cx);
        batch.touch_value(self.slot(phys));
    }

    fn copy_slot(&self, from: usize, to: usize, cx: WriteCtx<'_>, batch: &mut FlushBatch<'_>) {
        let src = self.slot(from);
        let key: i64 = src.key.load(RELAXED);
        let ptr: *mut u8 = src.ptr.load(RELAXED);
        self.write_slot(to, key, ptr, cx, batch);
    }

    fn clear_slot(&self, phys: usize, batch: &mut FlushBatch<'_>) {
        let slot = self.slot(phys);
        slot.key.store(EMPTY_KEY, RELAXED);
        slot.ptr.store(StdPtr::null_mut(), RELAXED);
        batch.touch_value(slot);
    }

    #[expect(clippy::cast_possible_truncation, reason = "CAP fits in u16")]
    fn set_header(&self, first: usize, count: usize) {
        self.first_index.store(first as u16, RELAXED);
        self.count.store(count as u16, RELAXED);
    }

    fn flush_header(&self, persist: &Persist) {
        persist.flush(FlushKind::Header, &self.count, 0);
    }

    /// Write `entries` to slots `0..len` of an unpublished node. The caller
    /// flushes the whole node afterwards.
    fn fill(&self, entries: &[(i64, *mut u8)], cx: WriteCtx<'_>) {
        for (i, &(key, ptr)) in entries.iter().enumerate() {
            self.store_slot(i, key, ptr, cx);
        }
        self.set_header(0, entries.len());
    }

    /// Flush a freshly built node in full, before it is published.
    pub fn flush_whole(&self, persist: &Persist) {
        persist.flush(FlushKind::NewNode, self, 0);
    }

    // ========================================================================
    //  Locked mutators
    // ========================================================================

    /// Insert `(key, ptr)` at logical position `pos`.
    ///
    /// The node must not be full. Returns the number of slots written.
    pub fn insert_at(
        &self,
        lock: &mut LockGuard<'_>,
        pos: usize,
        key: i64,
        ptr: *mut u8,
        cx: WriteCtx<'_>,
    ) -> usize {
        let count: usize = self.len();
        let first: usize = self.first();
        debug_assert!(count < CAP, "insert into full node");
        debug_assert!(pos <= count);

        lock.mark_insert();
        let switch: u8 = Y::switch_for_insert(self.switch_counter.load(RELAXED));
        self.switch_counter.store(switch, RELAXED);

        let mut batch: FlushBatch<'_> = cx.persist.batch(FlushKind::Entries, self.addr());
        let mut touched: usize = 1;
        let new_first: usize = if Y::grows_left(count, pos) {
            let new_first: usize = (first + CAP - 1) & (CAP - 1);
            for i in 0..pos {
                self.copy_slot(Self::phys(first, i), Self::phys(new_first, i), cx, &mut batch);
                touched += 1;
            }
            self.write_slot(Self::phys(new_first, pos), key, ptr, cx, &mut batch);
            new_first
        } else {
            for i in (pos..count).rev() {
                self.copy_slot(Self::phys(first, i), Self::phys(first, i + 1), cx, &mut batch);
                touched += 1;
            }
            self.write_slot(Self::phys(first, pos), key, ptr, cx, &mut batch);
            first
        };
        drop(batch);

        self.set_header(new_first, count + 1);
        self.flush_header(cx.persist);
        touched
    }

    /// Remove logical entry `pos` and return its pointer.
    pub fn remove_at(
        &self,
        lock: &mut LockGuard<'_>,
        pos: usize,
        cx: WriteCtx<'_>,
    ) -> *mut u8 {
        let count: usize = self.len();
        let first: usize = self.first();
        debug_assert!(pos < count);

        lock.mark_insert();
        let switch: u8 = Y::switch_for_remove(self.switch_counter.load(RELAXED));
        self.switch_counter.store(switch, RELAXED);

        let removed: *mut u8 = self.slot(Self::phys(first, pos)).ptr.load(RELAXED);
        let mut batch: FlushBatch<'_> = cx.persist.batch(FlushKind::Entries, self.addr());
        let new_first: usize = if Y::shrinks_left(count, pos) {
            for i in (0..pos).rev() {
                self.copy_slot(Self::phys(first, i), Self::phys(first, i + 1), cx, &mut batch);
            }
            self.clear_slot(Self::phys(first, 0), &mut batch);
            (first + 1) & (CAP - 1)
        } else {
            for i in pos..count - 1 {
                self.copy_slot(Self::phys(first, i + 1), Self::phys(first, i), cx, &mut batch);
            }
            self.clear_slot(Self::phys(first, count - 1), &mut batch);
            first
        };
        drop(batch);

        self.set_header(new_first, count - 1);
        self.flush_header(cx.persist);
        removed
    }

    /// Swap the pointer of logical entry `pos`, returning the old one.
    pub fn replace_at(
        &self,
        lock: &mut LockGuard<'_>,
        pos: usize,
        ptr: *mut u8,
        cx: WriteCtx<'_>,
    ) -> *mut u8 {
        lock.mark_insert();
        let slot = self.slot(Self::phys(self.first(), pos));
        let old: *mut u8 = slot.ptr.swap(ptr, WRITE_ORD);
        cx.persist.flush(FlushKind::Entries, slot, ptr.addr());
        old
    }

    /// Overwrite the key of logical entry `pos`. Used for parent separators.
    pub fn set_key_at(&self, lock: &mut LockGuard<'_>, pos: usize, key: i64, cx: WriteCtx<'_>) {
        lock.mark_insert();
        let slot = self.slot(Self::phys(self.first(), pos));
        slot.key.store(key, RELAXED);
        cx.persist.flush(FlushKind::Entries, slot, 0);
    }

    /// Drop logical entries `len..count`.
    pub fn truncate(&self, lock: &mut LockGuard<'_>, len: usize, cx: WriteCtx<'_>) {
        let count: usize = self.len();
        if len >= count {
            return;
        }
        lock.mark_split();
        let first: usize = self.first();
        self.set_header(first, len);
        self.flush_header(cx.persist);

        let mut batch: FlushBatch<'_> = cx.persist.batch(FlushKind::Entries, self.addr());
        for i in len..count {
            self.clear_slot(Self::phys(first, i), &mut batch);
        }
    }

    /// Replace all entries, restarting the layout at slot 0.
    ///
    /// Used on the receiving or donating side of a redistribution.
    pub fn rewrite(
        &self,
        lock: &mut LockGuard<'_>,
        entries: &[(i64, *mut u8)],
        leftmost: Option<*mut Self>,
        cx: WriteCtx<'_>,
    ) {
        debug_assert!(entries.len() <= CAP);
        lock.mark_split();
        let old_count: usize = self.len();
        let old_first: usize = self.first();

        let mut batch: FlushBatch<'_> = cx.persist.batch(FlushKind::Entries, self.addr());
        for (i, &(key, ptr)) in entries.iter().enumerate() {
            self.write_slot(i, key, ptr, cx, &mut batch);
        }
        for i in 0..old_count {
            let phys: usize = Self::phys(old_first, i);
            if phys >= entries.len() {
                self.clear_slot(phys, &mut batch);
            }
        }
        drop(batch);

        if let Some(child) = leftmost {
            self.leftmost.store(child, WRITE_ORD);
        }
        self.set_header(0, entries.len());
        self.flush_header(cx.persist);
    }

    /// Append `entries` after the current last entry.
    pub fn append(&self, lock: &mut LockGuard<'_>, entries: &[(i64, *mut u8)], cx: WriteCtx<'_>) {
        let count: usize = self.len();
        let first: usize = self.first();
        debug_assert!(count + entries.len() <= CAP);
        lock.mark_insert();

        let mut batch: FlushBatch<'_> = cx.persist.batch(FlushKind::Entries, self.addr());
        for (i, &(key, ptr)) in entries.iter().enumerate() {
            self.write_slot(Self::phys(first, count + i), key, ptr, cx, &mut batch);
        }
        drop(batch);

        self.set_header(first, count + entries.len());
        self.flush_header(cx.persist);
    }

    /// Set the lower fence.
    pub fn set_low_key(&self, lock: &mut LockGuard<'_>, low: i64, cx: WriteCtx<'_>) {
        lock.mark_split();
        self.low_key.store(low, WRITE_ORD);
        cx.persist.flush(FlushKind::Header, &self.low_key, 0);
    }

    /// Retarget `right_sibling` and flush the link.
    pub fn set_right(&self, lock: &mut LockGuard<'_>, right: *mut Self, cx: WriteCtx<'_>) {
        lock.mark_split();
        self.right_sibling.store(right, WRITE_ORD);
        cx.persist
            .flush(FlushKind::SiblingLink, &self.right_sibling, right.addr());
    }

    /// Tombstone the node. It is never mutated again.
    pub fn mark_deleted(&self, lock: &mut LockGuard<'_>, cx: WriteCtx<'_>) {
        lock.mark_deleted();
        cx.persist.flush(FlushKind::Tombstone, &self.version, 0);
    }

    /// Split a full node while inserting `(key, ptr)`.
    ///
    /// The sibling is filled, including the pending entry when it belongs
    /// there, and flushed whole. Only then is it linked from this node and
    /// the link flushed. Only then is this node truncated and, if the key
    /// belongs here, the pending entry inserted.
    ///
    /// The caller still holds this node's lock and decides how to publish
    /// the split key to the parent.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "trace", skip_all, fields(level = self.level, key = key))
    )]
    pub fn split(&self, lock: &mut LockGuard<'_>, key: i64, ptr: *mut u8, cx: WriteCtx<'_>) -> Split<Self> {
        let count: usize = self.len();
        debug_assert_eq!(count, CAP);
        lock.mark_split();

        let mid: usize = count / 2;
        let split_key: i64 = self.key_at(mid);
        let entries: Vec<(i64, *mut u8)> = self.entries();

        let sibling: Box<Self> = if self.level == 0 {
            Box::new(Self::new(0, split_key))
        } else {
            Box::new(Self::new_internal(
                self.level,
                split_key,
                self.child_at(mid),
            ))
        };
        let moving_from: usize = if self.level == 0 { mid } else { mid + 1 };

        let mut moving: Vec<(i64, *mut u8)> = entries.get(moving_from..).unwrap_or(&[]).to_vec();
        let goes_right: bool = key >= split_key;
        if goes_right {
            let pos: usize = moving.partition_point(|(k, _)| *k < key);
            moving.insert(pos, (key, ptr));
        }
        sibling.fill(&moving, cx);
        sibling
            .right_sibling
            .store(self.right_sibling.load(RELAXED), RELAXED);
        sibling.flush_whole(cx.persist);

        let sibling: *mut Self = Box::into_raw(sibling);
        self.right_sibling.store(sibling, WRITE_ORD);
        cx.persist
            .flush(FlushKind::SiblingLink, &self.right_sibling, sibling.addr());

        self.truncate(lock, mid, cx);
        if !goes_right {
            let pos: usize = self.position(key).unwrap_or_else(|p| p);
            self.insert_at(lock, pos, key, ptr, cx);
        }

        Split { sibling, split_key }
    }

    /// One-line description used by `dump()`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "[{}{} low={} n={}",
            Y::NAME.chars().next().unwrap_or('?'),
            self.level,
            fmt_key(self.low_key.load(RELAXED)),
            self.len()
        );
        if Y::RING {
            let _ = write!(out, " first={}", self.first());
        } else {
            let _ = write!(out, " sw={}", self.switch_counter.load(RELAXED));
        }
        if self.version.is_deleted() {
            out.push_str(" deleted");
        }
        out.push_str(" |");
        for key in self.keys() {
            let _ = write!(out, " {key}");
        }
        out.push(']');
        out
    }
}

fn fmt_key(key: i64) -> String {
    if key == i64::MIN {
        "-inf".to_owned()
    } else {
        key.to_string()
    }
}

impl<Y: NodeLayout, const CAP: usize> std::fmt::Debug for Node<Y, CAP> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("layout", &Y::NAME)
            .field("level", &self.level)
            .field("count", &self.len())
            .field("low_key", &self.low_key.load(RELAXED))
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Circular, Linear};

    type Ring8 = Node<Circular, 8>;
    type Flat8 = Node<Linear, 8>;

    fn cx(persist: &Persist) -> WriteCtx<'_> {
        WriteCtx {
            persist,
            fingerprints: true,
        }
    }

    fn tag(k: i64) -> *mut u8 {
        // Never dereferenced by node code.
        StdPtr::without_provenance_mut(usize::try_from(k).unwrap() * 8 + 8)
    }

    fn put<Y: NodeLayout, const CAP: usize>(node: &Node<Y, CAP>, key: i64, cx: WriteCtx<'_>) -> usize {
        let mut lock = node.version().lock();
        let pos = node.position(key).unwrap_err();
        node.insert_at(&mut lock, pos, key, tag(key), cx)
    }

    #[test]
    fn test_ring_insert_keeps_order() {
        let persist = Persist::default();
        let node = Ring8::new(0, i64::MIN);
        for k in [50, 10, 40, 20, 30, 60, 5, 45] {
            put(&node, k, cx(&persist));
        }
        assert_eq!(node.keys(), vec![5, 10, 20, 30, 40, 45, 50, 60]);
        assert!(node.is_full());
        for (i, k) in node.keys().into_iter().enumerate() {
            assert_eq!(node.ptr_at(i), tag(k));
            assert_eq!(node.fingerprint_at(i), fingerprint::hash(k));
        }
    }

    #[test]
    fn test_ring_shift_is_minimal() {
        let persist = Persist::default();
        let node = Node::<Circular, 32>::new(0, i64::MIN);
        for k in (100..116).map(|k| k * 10) {
            put(&node, k, cx(&persist));
        }
        let n = node.len();

        // Smallest key: only the new slot is written.
        assert_eq!(put(&node, 1, cx(&persist)), 1);
        // Just below the median: left half moves.
        let touched = put(&node, 1075, cx(&persist));
        assert!(touched <= (n + 1) / 2 + 1, "touched {touched}");
        // Largest key: only the new slot is written.
        assert_eq!(put(&node, 5000, cx(&persist)), 1);

        let keys = node.keys();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_linear_front_insert_moves_everything() {
        let persist = Persist::default();
        let node = Flat8::new(0, i64::MIN);
        for k in 10..15 {
            put(&node, k, cx(&persist));
        }
        assert_eq!(put(&node, 1, cx(&persist)), 6);
        assert_eq!(node.first_index(), 0);
    }

    #[test]
    fn test_remove_both_sides() {
        let persist = Persist::default();
        for_each_layout(&persist);
    }

    fn for_each_layout(persist: &Persist) {
        fn run<Y: NodeLayout>(persist: &Persist) {
            let node = Node::<Y, 8>::new(0, i64::MIN);
            for k in 1..=7 {
                put(&node, k, cx(persist));
            }
            let mut lock = node.version().lock();
            assert_eq!(node.remove_at(&mut lock, 1, cx(persist)), tag(2));
            assert_eq!(node.remove_at(&mut lock, 4, cx(persist)), tag(6));
            drop(lock);
            assert_eq!(node.keys(), vec![1, 3, 4, 5, 7]);
            assert_eq!(node.position(5), Ok(3));
            assert_eq!(node.position(6), Err(4));
        }
        run::<Circular>(persist);
        run::<Linear>(persist);
    }

    #[test]
    fn test_lookup_leaf_and_fingerprint() {
        let persist = Persist::default();
        let node = Ring8::new(0, i64::MIN);
        for k in [3, 1, 2] {
            put(&node, k, cx(&persist));
        }
        assert_eq!(node.lookup(2, None), Lookup::Found(tag(2)));
        assert_eq!(
            node.lookup(2, Some(fingerprint::hash(2))),
            Lookup::Found(tag(2))
        );
        assert_eq!(node.lookup(9, Some(fingerprint::hash(9))), Lookup::NotFound);
    }

    #[test]
    fn test_lookup_internal_routes() {
        let persist = Persist::default();
        let a = Box::into_raw(Box::new(Ring8::new(0, i64::MIN)));
        let b = Box::into_raw(Box::new(Ring8::new(0, 10)));
        let c = Box::into_raw(Box::new(Ring8::new(0, 20)));

        let root = Ring8::new_internal(1, i64::MIN, a);
        {
            let mut lock = root.version().lock();
            root.insert_at(&mut lock, 0, 10, b.cast(), cx(&persist));
            root.insert_at(&mut lock, 1, 20, c.cast(), cx(&persist));
        }
        assert_eq!(root.lookup(-5, None), Lookup::Child(a));
        assert_eq!(root.lookup(10, None), Lookup::Child(b));
        assert_eq!(root.lookup(19, None), Lookup::Child(b));
        assert_eq!(root.lookup(25, None), Lookup::Child(c));
        assert_eq!(root.child_slot(a), Some(ChildSlot::Leftmost));
        assert_eq!(root.child_slot(c), Some(ChildSlot::Entry(1)));
        assert_eq!(root.child_slot(StdPtr::null_mut()), None);

        for p in [a, b, c] {
            // SAFETY: allocated above, never shared.
            drop(unsafe { Box::from_raw(p) });
        }
    }

    #[test]
    fn test_split_leaf_publish_order() {
        let persist = Persist::new(0, true);
        let node = Ring8::new(0, i64::MIN);
        for k in 1..=8 {
            put(&node, k * 10, cx(&persist));
        }
        persist.take_log();

        let mut lock = node.version().lock();
        let split = node.split(&mut lock, 55, tag(55), cx(&persist));
        drop(lock);

        assert_eq!(split.split_key, 50);
        assert_eq!(node.keys(), vec![10, 20, 30, 40]);
        // SAFETY: sibling was just created by split.
        let sib = unsafe { Box::from_raw(split.sibling) };
        assert_eq!(sib.keys(), vec![50, 55, 60, 70, 80]);
        assert_eq!(sib.low_key(), 50);
        assert_eq!(node.right(), split.sibling);
        assert_eq!(node.lookup(55, None), Lookup::Sibling(split.sibling));

        let log = persist.take_log();
        let whole = log
            .iter()
            .position(|e| e.kind == FlushKind::NewNode && e.node == sib.addr())
            .unwrap();
        let link = log
            .iter()
            .position(|e| e.kind == FlushKind::SiblingLink && e.target == sib.addr())
            .unwrap();
        let header = log
            .iter()
            .rposition(|e| e.kind == FlushKind::Header)
            .unwrap();
        assert!(whole < link && link < header);
    }

    #[test]
    fn test_split_internal_promotes_median() {
        let persist = Persist::default();
        let children: Vec<*mut Flat8> = (0..10)
            .map(|i| Box::into_raw(Box::new(Flat8::new(0, i * 10))))
            .collect();
        let node = Flat8::new_internal(1, i64::MIN, children[0]);
        {
            let mut lock = node.version().lock();
            for i in 1..=8 {
                node.insert_at(&mut lock, i - 1, (i as i64) * 10, children[i].cast(), cx(&persist));
            }
        }

        let mut lock = node.version().lock();
        let split = node.split(&mut lock, 5, children[9].cast(), cx(&persist));
        drop(lock);

        // Keys 10..80, median index 4 is key 50.
        assert_eq!(split.split_key, 50);
        assert_eq!(node.keys(), vec![5, 10, 20, 30, 40]);
        // SAFETY: created by split.
        let sib = unsafe { Box::from_raw(split.sibling) };
        assert_eq!(sib.keys(), vec![60, 70, 80]);
        assert_eq!(sib.leftmost(), children[5]);

        for p in children {
            // SAFETY: allocated above.
            drop(unsafe { Box::from_raw(p) });
        }
    }

    #[test]
    fn test_scan_validates_and_chains() {
        let persist = Persist::default();
        let left = Ring8::new(0, i64::MIN);
        let right = Box::into_raw(Box::new(Ring8::new(0, 100)));
        for k in [10, 20, 30] {
            put(&left, k, cx(&persist));
        }
        {
            let mut lock = left.version().lock();
            left.set_right(&mut lock, right, cx(&persist));
        }

        let mut out = Vec::new();
        assert_eq!(
            left.scan(15, 500, &mut out),
            ScanStep::Next {
                sibling: right,
                low: 100
            }
        );
        assert_eq!(out.iter().map(|e| e.0).collect::<Vec<_>>(), vec![20, 30]);

        out.clear();
        assert_eq!(left.scan(i64::MIN, 25, &mut out), ScanStep::Done);
        assert_eq!(out.len(), 2);

        // SAFETY: allocated above, no readers.
        let right = unsafe { Box::from_raw(right) };
        assert_eq!(right.scan(50, 500, &mut out), ScanStep::Redescend);
    }

    #[test]
    fn test_deleted_node_redescends() {
        let persist = Persist::default();
        let node = Ring8::new(0, i64::MIN);
        {
            let mut lock = node.version().lock();
            node.mark_deleted(&mut lock, cx(&persist));
        }
        assert_eq!(node.lookup(1, None), Lookup::Redescend);
        assert_eq!(node.scan(0, 1, &mut Vec::new()), ScanStep::Redescend);
    }

    #[test]
    fn test_lookup_below_raised_fence_redescends() {
        let persist = Persist::default();
        let node = Flat8::new(0, 40);
        for k in [40, 50, 60, 70] {
            put(&node, k, cx(&persist));
        }
        assert_eq!(node.lookup(40, None), Lookup::Found(tag(40)));

        // Hand 40 and 50 to the left neighbour.
        {
            let mut lock = node.version().lock();
            node.set_low_key(&mut lock, 60, cx(&persist));
            node.rewrite(&mut lock, &[(60, tag(60)), (70, tag(70))], None, cx(&persist));
        }
        assert_eq!(node.lookup(40, None), Lookup::Redescend);
        assert_eq!(node.lookup(45, None), Lookup::Redescend);
        assert_eq!(node.lookup(60, None), Lookup::Found(tag(60)));
        assert_eq!(node.lookup(65, None), Lookup::NotFound);
    }
}
