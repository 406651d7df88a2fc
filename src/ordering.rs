//! Memory orderings shared by the node and tree code.
//!
//! Node fields are atomics so that lock-free readers never race with a
//! writer in the language sense; the node version decides whether what a
//! reader saw is usable. These names keep the pairing explicit at each site.

use std::sync::atomic::Ordering;

/// Loads of node fields and pointers during optimistic traversal.
/// Pairs with [`WRITE_ORD`].
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Stores to node fields while the node lock is held.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Successful CAS on the root pointer or a version word.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed CAS: only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Loads inside a locked region. The lock already synchronizes.
pub const RELAXED: Ordering = Ordering::Relaxed;
