//! # `CircleTree`
//!
//! A crash-consistent concurrent B+-tree for persistent memory.
//!
//! Keys are `i64`, values are stored as `Arc<V>`. Every node keeps its
//! entries in one of two layouts:
//!
//! - [`Linear`]: a packed sorted array. Inserts shift the suffix right and
//!   removals shift it left, with a switch counter telling readers which
//!   direction to scan.
//! - [`Circular`]: a ring buffer with a moving start index, so shifts from
//!   either end touch at most half the entries.
//!
//! Every store that makes a change reachable is preceded by a cache-line
//! flush of what it publishes (see [`pmem`]), so a crash at any point leaves
//! a tree that readers can traverse. Readers never lock: they validate a
//! version word and retry, and follow right-sibling links when a split has
//! not reached the parent yet.
//!
//! ## Thread Safety
//!
//! `CircleTree<V>` is `Send + Sync` when `V: Send + Sync`. All operations
//! take `&self`:
//!
//! ```rust
//! use std::thread;
//! use circletree::CircleTree;
//!
//! let tree: CircleTree<u64> = CircleTree::new();
//! thread::scope(|s| {
//!     for t in 0..4_i64 {
//!         let tree = &tree;
//!         s.spawn(move || {
//!             for k in 0..100 {
//!                 tree.insert(k * 4 + t, 0);
//!             }
//!         });
//!     }
//! });
//! assert_eq!(tree.len(), 400);
//! ```
//!
//! ## Memory Reclamation
//!
//! Replaced values, deleted values and unlinked nodes are retired through a
//! per-tree [`seize`] collector and freed once no reader can still hold
//! them. Values handed out are `Arc<V>` clones and outlive the tree if kept.
//!
//! ## Configuration
//!
//! [`TreeConfig`] sets simulated write latency, leaf fingerprints, the flush
//! log and a diagnostics callback, either through its builder or from
//! `CIRCLETREE_*` environment variables.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

pub mod alloc;
pub mod config;
pub mod fingerprint;
pub mod layout;
pub mod node;
pub mod nodeversion;
pub mod ordering;
pub mod pmem;
pub mod tree;
pub mod value;

mod tracing_helpers;

// Re-export main types for convenience
pub use config::{ConfigError, Diagnostic, TreeConfig};
pub use layout::{Circular, Linear, NodeLayout};
pub use pmem::{FlushEvent, FlushKind};
pub use tree::{CircleTree, CircularTree, InvariantViolation, LinearTree, TreeStats};
pub use value::{FieldUpdate, Record, UpdateError};
