//! Shuttle tests of the split publish order.
//!
//! Shuttle explores randomized thread schedules. The model below is a
//! two-leaf tree under one parent, using the same protocol as the real
//! nodes: a version word whose low bit is the lock, validated optimistic
//! reads, and a split that fills the sibling, links it, truncates the left
//! node and only then publishes the separator to the parent.
//!
//! Run with: `cargo test --lib tree::shuttle_tests`

use shuttle::sync::Arc;
use shuttle::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use shuttle::thread;

const NONE: usize = usize::MAX;
const SLOTS: usize = 8;

// ============================================================================
//  Model
// ============================================================================

struct ModelNode {
    version: AtomicU64,
    low: AtomicI64,
    count: AtomicUsize,
    keys: [AtomicI64; SLOTS],
    right: AtomicUsize,
}

impl ModelNode {
    fn new(low: i64, keys: &[i64]) -> Self {
        let node = Self {
            version: AtomicU64::new(0),
            low: AtomicI64::new(low),
            count: AtomicUsize::new(keys.len()),
            keys: std::array::from_fn(|_| AtomicI64::new(i64::MAX)),
            right: AtomicUsize::new(NONE),
        };
        for (slot, &k) in node.keys.iter().zip(keys) {
            slot.store(k, Ordering::Relaxed);
        }
        node
    }

    fn lock(&self) {
        loop {
            let v = self.version.load(Ordering::Relaxed);
            if v & 1 == 0
                && self
                    .version
                    .compare_exchange(v, v | 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            thread::yield_now();
        }
    }

    fn unlock(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    fn stable(&self) -> u64 {
        loop {
            let v = self.version.load(Ordering::Acquire);
            if v & 1 == 0 {
                return v;
            }
            thread::yield_now();
        }
    }

    fn changed(&self, v: u64) -> bool {
        self.version.load(Ordering::Acquire) != v
    }
}

/// Parent with at most one separator over two leaves.
struct Model {
    leaves: [ModelNode; 2],
    parent_version: AtomicU64,
    separator: AtomicI64,
}

impl Model {
    /// Leaf 0 holds `1..=SLOTS` and is full; leaf 1 is the unpublished
    /// sibling.
    fn full_leaf() -> Self {
        let keys: Vec<i64> = (1..=SLOTS as i64).collect();
        Self {
            leaves: [ModelNode::new(i64::MIN, &keys), ModelNode::new(0, &[])],
            parent_version: AtomicU64::new(0),
            separator: AtomicI64::new(i64::MAX),
        }
    }

    fn split(&self) {
        let (left, sibling) = (&self.leaves[0], &self.leaves[1]);
        left.lock();
        let mid = SLOTS / 2;
        let split_key = left.keys[mid].load(Ordering::Relaxed);

        // Fill the sibling while nobody can reach it.
        for i in mid..SLOTS {
            let k = left.keys[i].load(Ordering::Relaxed);
            sibling.keys[i - mid].store(k, Ordering::Relaxed);
        }
        sibling.count.store(SLOTS - mid, Ordering::Relaxed);
        sibling.low.store(split_key, Ordering::Relaxed);
        sibling.right.store(left.right.load(Ordering::Relaxed), Ordering::Relaxed);

        // Link, then truncate.
        left.right.store(1, Ordering::Release);
        left.count.store(mid, Ordering::Relaxed);
        left.unlock();

        // Publish to the parent.
        self.parent_version.fetch_add(1, Ordering::Acquire);
        self.separator.store(split_key, Ordering::Relaxed);
        self.parent_version.fetch_add(1, Ordering::Release);
    }

    fn route(&self, key: i64) -> usize {
        loop {
            let v = self.parent_version.load(Ordering::Acquire);
            if v & 1 != 0 {
                thread::yield_now();
                continue;
            }
            let sep = self.separator.load(Ordering::Relaxed);
            if self.parent_version.load(Ordering::Acquire) == v {
                return usize::from(key >= sep);
            }
        }
    }

    fn contains(&self, key: i64) -> bool {
        let mut idx = self.route(key);
        loop {
            let node = &self.leaves[idx];
            let v = node.stable();
            let count = node.count.load(Ordering::Relaxed);
            let found = node.keys[..count]
                .iter()
                .any(|k| k.load(Ordering::Relaxed) == key);
            let right = node.right.load(Ordering::Acquire);
            let right_low = if right == NONE {
                i64::MAX
            } else {
                self.leaves[right].low.load(Ordering::Relaxed)
            };
            if node.changed(v) {
                continue;
            }
            if found {
                return true;
            }
            if right != NONE && key >= right_low {
                idx = right;
                continue;
            }
            return false;
        }
    }

    fn scan_all(&self) -> Vec<i64> {
        let mut out = Vec::new();
        let mut cursor = i64::MIN;
        let mut idx = 0;
        loop {
            let node = &self.leaves[idx];
            let v = node.stable();
            let count = node.count.load(Ordering::Relaxed);
            let local: Vec<i64> = node.keys[..count]
                .iter()
                .map(|k| k.load(Ordering::Relaxed))
                .filter(|&k| k >= cursor)
                .collect();
            let right = node.right.load(Ordering::Acquire);
            let right_low = if right == NONE {
                i64::MAX
            } else {
                self.leaves[right].low.load(Ordering::Relaxed)
            };
            if node.changed(v) {
                continue;
            }
            out.extend(local);
            if right == NONE {
                return out;
            }
            let floor = out.last().map_or(cursor, |&k| k + 1);
            cursor = cursor.max(floor).max(right_low);
            idx = right;
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[test]
fn test_shuttle_lookup_during_split() {
    shuttle::check_random(
        || {
            let model = Arc::new(Model::full_leaf());

            let writer = {
                let m = Arc::clone(&model);
                thread::spawn(move || m.split())
            };
            let reader = {
                let m = Arc::clone(&model);
                thread::spawn(move || {
                    for key in 1..=SLOTS as i64 {
                        assert!(m.contains(key), "key {key} lost during split");
                    }
                    assert!(!m.contains(0));
                    assert!(!m.contains(SLOTS as i64 + 1));
                })
            };

            writer.join().unwrap();
            reader.join().unwrap();

            assert_eq!(model.separator.load(Ordering::Relaxed), 5);
            for key in 1..=SLOTS as i64 {
                assert!(model.contains(key));
            }
        },
        1000,
    );
}

#[test]
fn test_shuttle_scan_during_split_sees_each_key_once() {
    shuttle::check_random(
        || {
            let model = Arc::new(Model::full_leaf());
            let expected: Vec<i64> = (1..=SLOTS as i64).collect();

            let writer = {
                let m = Arc::clone(&model);
                thread::spawn(move || m.split())
            };
            let scanners: Vec<_> = (0..2)
                .map(|_| {
                    let m = Arc::clone(&model);
                    let e = expected.clone();
                    thread::spawn(move || assert_eq!(m.scan_all(), e))
                })
                .collect();

            writer.join().unwrap();
            for s in scanners {
                s.join().unwrap();
            }
        },
        1000,
    );
}
