//! Node record layouts.
//!
//! A node stores its entries in a fixed array of `CAP` slots. The layout
//! decides where logical entry `i` lives and which side of the array moves
//! when an entry is inserted or removed.
//!
//! - [`Linear`]: entries are packed at `0..count`. Inserting shifts the tail
//!   right; removing shifts it left. A switch counter records the direction
//!   of the last shift (even = forward) and readers scan in that direction.
//! - [`Circular`]: entries form a ring starting at `first_index`. Inserting
//!   or removing moves whichever half is shorter, so a shift touches at most
//!   `count / 2 + 1` slots.

/// Placement strategy for a node's entries.
pub trait NodeLayout: Send + Sync + 'static {
    /// Human readable name, used by `dump()`.
    const NAME: &'static str;

    /// Whether the entries wrap around the slot array.
    const RING: bool;

    /// Physical slot of logical entry `logical`.
    fn physical<const CAP: usize>(first: usize, logical: usize) -> usize;

    /// Whether inserting at logical `pos` into a node of `count` entries
    /// shifts the entries before `pos` one slot to the left.
    fn grows_left(count: usize, pos: usize) -> bool;

    /// Whether removing logical `pos` shifts the entries before it one slot
    /// to the right.
    fn shrinks_left(count: usize, pos: usize) -> bool;

    /// Switch counter value to publish before an order-changing insert.
    #[inline]
    fn switch_for_insert(counter: u8) -> u8 {
        counter
    }

    /// Switch counter value to publish before an order-changing removal.
    #[inline]
    fn switch_for_remove(counter: u8) -> u8 {
        counter
    }

    /// Whether a reader that saw `counter` scans from the first entry.
    #[inline]
    fn scans_forward(_counter: u8) -> bool {
        true
    }
}

/// Packed array layout with a direction-encoding switch counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

/// Power-of-two ring layout that shifts the shorter half.
#[derive(Debug, Clone, Copy, Default)]
pub struct Circular;

impl NodeLayout for Linear {
    const NAME: &'static str = "linear";
    const RING: bool = false;

    #[inline(always)]
    fn physical<const CAP: usize>(_first: usize, logical: usize) -> usize {
        logical
    }

    #[inline]
    fn grows_left(_count: usize, _pos: usize) -> bool {
        false
    }

    #[inline]
    fn shrinks_left(_count: usize, _pos: usize) -> bool {
        false
    }

    #[inline]
    fn switch_for_insert(counter: u8) -> u8 {
        if counter % 2 == 0 {
            counter.wrapping_add(2)
        } else {
            counter.wrapping_add(1)
        }
    }

    #[inline]
    fn switch_for_remove(counter: u8) -> u8 {
        if counter % 2 == 0 {
            counter.wrapping_add(1)
        } else {
            counter.wrapping_add(2)
        }
    }

    #[inline]
    fn scans_forward(counter: u8) -> bool {
        counter % 2 == 0
    }
}

impl NodeLayout for Circular {
    const NAME: &'static str = "circular";
    const RING: bool = true;

    #[inline(always)]
    fn physical<const CAP: usize>(first: usize, logical: usize) -> usize {
        (first + logical) & (CAP - 1)
    }

    /// The new key sorts below the median entry `count / 2`.
    #[inline]
    fn grows_left(count: usize, pos: usize) -> bool {
        count > 0 && pos <= count / 2
    }

    #[inline]
    fn shrinks_left(count: usize, pos: usize) -> bool {
        pos < count / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_wraps() {
        assert_eq!(Circular::physical::<8>(6, 0), 6);
        assert_eq!(Circular::physical::<8>(6, 1), 7);
        assert_eq!(Circular::physical::<8>(6, 2), 0);
        assert_eq!(Circular::physical::<8>(0, 7), 7);
    }

    #[test]
    fn test_circular_picks_shorter_side() {
        for count in 1..32 {
            for pos in 0..=count {
                let moved = if Circular::grows_left(count, pos) {
                    pos
                } else {
                    count - pos
                };
                assert!(moved <= count / 2, "count={count} pos={pos} moved={moved}");
            }
        }
        assert!(!Circular::grows_left(0, 0));
    }

    #[test]
    fn test_linear_switch_counter_parity() {
        let c = Linear::switch_for_insert(0);
        assert!(Linear::scans_forward(c));
        assert_ne!(c, 0);
        let c = Linear::switch_for_remove(c);
        assert!(!Linear::scans_forward(c));
        let c = Linear::switch_for_insert(c);
        assert!(Linear::scans_forward(c));
        assert!(Linear::scans_forward(Linear::switch_for_insert(u8::MAX - 1)));
    }
}
