//! Range scans over the leaf sibling chain.
//!
//! The scan descends once by `min`, then follows `right_sibling` links. Each
//! leaf is read under its own validated snapshot. A cursor records the
//! smallest key not yet emitted; it only moves forward, so a leaf that was
//! concurrently split, merged or redistributed never yields a key twice.

use std::sync::Arc;

use seize::LocalGuard;

use super::CircleTree;
use crate::layout::NodeLayout;
use crate::node::{Node, ScanStep};
use crate::value;

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    /// All entries with `min <= key <= max`, in key order.
    ///
    /// Empty when `min > max`.
    #[must_use]
    pub fn range(&self, min: i64, max: i64) -> Vec<(i64, Arc<V>)> {
        let guard = self.guard();
        self.range_with_guard(min, max, &guard)
    }

    /// [`range`](Self::range) under an existing guard.
    #[must_use]
    pub fn range_with_guard(&self, min: i64, max: i64, guard: &LocalGuard<'_>) -> Vec<(i64, Arc<V>)> {
        self.range_raw(min, max, guard)
            .into_iter()
            .map(|(key, ptr)| {
                // SAFETY: collected from validated snapshots under `guard`.
                (key, unsafe { value::share::<V>(ptr) })
            })
            .collect()
    }

    /// Values with `min <= key <= max`, in key order.
    #[must_use]
    pub fn range_values(&self, min: i64, max: i64) -> Vec<Arc<V>> {
        let guard = self.guard();
        self.range_raw(min, max, &guard)
            .into_iter()
            .map(|(_, ptr)| {
                // SAFETY: as in `range_with_guard`.
                unsafe { value::share::<V>(ptr) }
            })
            .collect()
    }

    fn range_raw(&self, min: i64, max: i64, guard: &LocalGuard<'_>) -> Vec<(i64, *mut u8)> {
        let mut out: Vec<(i64, *mut u8)> = Vec::new();
        if min > max {
            return out;
        }

        let mut cursor: i64 = min;
        let mut retries: u64 = 0;

        'descend: loop {
            let Some(mut leaf) = self.descend(cursor, 0, guard) else {
                return out;
            };

            loop {
                match leaf.scan(cursor, max, &mut out) {
                    ScanStep::Retry => self.note_retry(&mut retries),
                    ScanStep::Redescend => {
                        self.note_retry(&mut retries);
                        cursor = next_cursor(cursor, &out);
                        continue 'descend;
                    }
                    ScanStep::Done => return out,
                    ScanStep::Next { sibling, low } => {
                        cursor = next_cursor(cursor, &out).max(low);
                        if cursor > max {
                            return out;
                        }
                        let next: &Node<Y, CAP> = self.node(sibling, guard);
                        leaf = next;
                    }
                }
            }
        }
    }
}

/// Smallest key the scan may still emit.
#[inline]
fn next_cursor(cursor: i64, out: &[(i64, *mut u8)]) -> i64 {
    out.last()
        .map_or(cursor, |&(key, _)| cursor.max(key.saturating_add(1)))
}
