//! Structural checks and a level-by-level dump.
//!
//! Both walk every level from the root down along the sibling chains. They
//! are meant for quiescent trees (tests, debugging); under concurrent writes
//! the result may report transient states.

use std::error::Error as StdError;
use std::fmt as StdFmt;
use std::fmt::Write as _;

use super::CircleTree;
use crate::fingerprint;
use crate::layout::NodeLayout;
use crate::node::Node;

// ============================================================================
//  InvariantViolation
// ============================================================================

/// A structural invariant that does not hold.
///
/// Nodes are identified by their level and lower fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// `height` disagrees with the root's level.
    Height {
        /// Stored height.
        height: u32,
        /// Level of the root node.
        root_level: u32,
    },
    /// A node sits at the wrong level.
    Level {
        /// Level expected from the walk.
        expected: u32,
        /// Level stored in the node.
        found: u32,
        /// Lower fence of the node.
        low_key: i64,
    },
    /// The first node of a level does not start at `i64::MIN`.
    LevelStart {
        /// Level.
        level: u32,
        /// Its first node's lower fence.
        low_key: i64,
    },
    /// Keys inside a node are not strictly increasing.
    Unsorted {
        /// Level.
        level: u32,
        /// Lower fence of the node.
        low_key: i64,
    },
    /// A key lies below its node's lower fence.
    BelowFence {
        /// Level.
        level: u32,
        /// Lower fence of the node.
        low_key: i64,
        /// Offending key.
        key: i64,
    },
    /// A key is not below the right sibling's lower fence.
    ChainOrder {
        /// Level.
        level: u32,
        /// Last key (or fence) of the left node.
        left: i64,
        /// Lower fence of the right node.
        right_low: i64,
    },
    /// A tombstoned node is still linked.
    Tombstoned {
        /// Level.
        level: u32,
        /// Lower fence of the node.
        low_key: i64,
    },
    /// An internal node without a leftmost child.
    MissingChild {
        /// Level.
        level: u32,
        /// Lower fence of the node.
        low_key: i64,
    },
    /// A child's lower fence differs from the separator routing to it.
    ChildFence {
        /// Level of the parent.
        level: u32,
        /// Separator (or parent fence for the leftmost child).
        separator: i64,
        /// The child's lower fence.
        child_low: i64,
    },
    /// A stored leaf fingerprint does not match its key.
    Fingerprint {
        /// Offending key.
        key: i64,
    },
    /// `len()` disagrees with the number of leaf entries.
    Count {
        /// Value of `len()`.
        expected: usize,
        /// Entries found in the leaves.
        found: usize,
    },
    /// The allocator's live count disagrees with the linked nodes.
    Nodes {
        /// Allocator's live count.
        expected: usize,
        /// Nodes found by the walk.
        found: usize,
    },
}

impl StdFmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Height { height, root_level } => {
                write!(f, "height {height} but root is at level {root_level}")
            }
            Self::Level {
                expected,
                found,
                low_key,
            } => write!(
                f,
                "node low={low_key} at level {found}, expected level {expected}"
            ),
            Self::LevelStart { level, low_key } => {
                write!(f, "level {level} starts at {low_key}, not i64::MIN")
            }
            Self::Unsorted { level, low_key } => {
                write!(f, "unsorted keys in node low={low_key} level {level}")
            }
            Self::BelowFence {
                level,
                low_key,
                key,
            } => write!(
                f,
                "key {key} below fence {low_key} at level {level}"
            ),
            Self::ChainOrder {
                level,
                left,
                right_low,
            } => write!(
                f,
                "level {level}: {left} not below right sibling fence {right_low}"
            ),
            Self::Tombstoned { level, low_key } => {
                write!(f, "tombstoned node low={low_key} linked at level {level}")
            }
            Self::MissingChild { level, low_key } => {
                write!(f, "internal node low={low_key} level {level} has no leftmost child")
            }
            Self::ChildFence {
                level,
                separator,
                child_low,
            } => write!(
                f,
                "level {level}: separator {separator} routes to child with fence {child_low}"
            ),
            Self::Fingerprint { key } => write!(f, "stale fingerprint for key {key}"),
            Self::Count { expected, found } => {
                write!(f, "len() is {expected} but leaves hold {found} entries")
            }
            Self::Nodes { expected, found } => {
                write!(f, "{expected} live nodes but {found} linked")
            }
        }
    }
}

impl StdError for InvariantViolation {}

// ============================================================================
//  Walk
// ============================================================================

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: Send + Sync + 'static,
    Y: NodeLayout,
{
    /// The leftmost node of every level, root level first.
    fn level_heads<'g>(&self, guard: &'g seize::LocalGuard<'_>) -> Vec<&'g Node<Y, CAP>> {
        let mut heads: Vec<&Node<Y, CAP>> = Vec::new();
        let mut node: &Node<Y, CAP> = self.node(self.root_ptr(), guard);
        loop {
            heads.push(node);
            if node.is_leaf() || node.leftmost().is_null() {
                return heads;
            }
            node = self.node(node.leftmost(), guard);
        }
    }

    /// Verify the tree's structural invariants.
    ///
    /// # Errors
    /// The first [`InvariantViolation`] found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let guard = self.guard();
        let heads: Vec<&Node<Y, CAP>> = self.level_heads(&guard);

        let root_level: u32 = heads.first().map_or(0, |n| n.level());
        if self.height() != root_level + 1 {
            return Err(InvariantViolation::Height {
                height: self.height(),
                root_level,
            });
        }

        let mut nodes: usize = 0;
        let mut entries: usize = 0;

        for (expected, head) in (0..=root_level).rev().zip(heads) {
            if head.low_key() != i64::MIN {
                return Err(InvariantViolation::LevelStart {
                    level: expected,
                    low_key: head.low_key(),
                });
            }

            let mut current: Option<&Node<Y, CAP>> = Some(head);
            while let Some(node) = current {
                nodes += 1;
                self.check_node(node, expected)?;
                if expected == 0 {
                    entries += node.len();
                }

                current = if node.right().is_null() {
                    None
                } else {
                    let next: &Node<Y, CAP> = self.node(node.right(), &guard);
                    let left: i64 = node.keys().last().copied().unwrap_or(node.low_key());
                    let left_bound_ok = if node.is_empty() {
                        left < next.low_key()
                    } else {
                        left < next.low_key() && node.low_key() < next.low_key()
                    };
                    if !left_bound_ok {
                        return Err(InvariantViolation::ChainOrder {
                            level: expected,
                            left,
                            right_low: next.low_key(),
                        });
                    }
                    Some(next)
                };
            }
        }

        if entries != self.len() {
            return Err(InvariantViolation::Count {
                expected: self.len(),
                found: entries,
            });
        }
        if nodes != self.alloc.live() {
            return Err(InvariantViolation::Nodes {
                expected: self.alloc.live(),
                found: nodes,
            });
        }
        Ok(())
    }

    fn check_node(&self, node: &Node<Y, CAP>, expected: u32) -> Result<(), InvariantViolation> {
        let level: u32 = node.level();
        let low_key: i64 = node.low_key();
        if level != expected {
            return Err(InvariantViolation::Level {
                expected,
                found: level,
                low_key,
            });
        }
        if node.version().is_deleted() {
            return Err(InvariantViolation::Tombstoned { level, low_key });
        }

        let keys: Vec<i64> = node.keys();
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(InvariantViolation::Unsorted { level, low_key });
        }
        if let Some(&key) = keys.iter().find(|&&k| k < low_key) {
            return Err(InvariantViolation::BelowFence {
                level,
                low_key,
                key,
            });
        }

        if node.is_leaf() {
            if self.config.fingerprints {
                for (i, &key) in keys.iter().enumerate() {
                    if node.fingerprint_at(i) != fingerprint::hash(key) {
                        return Err(InvariantViolation::Fingerprint { key });
                    }
                }
            }
            return Ok(());
        }

        let leftmost: *mut Node<Y, CAP> = node.leftmost();
        if leftmost.is_null() {
            return Err(InvariantViolation::MissingChild { level, low_key });
        }
        // SAFETY: quiescent walk; linked children are live.
        let first_child_low: i64 = unsafe { (*leftmost).low_key() };
        if first_child_low != low_key {
            return Err(InvariantViolation::ChildFence {
                level,
                separator: low_key,
                child_low: first_child_low,
            });
        }
        for (i, &separator) in keys.iter().enumerate() {
            // SAFETY: as above.
            let child_low: i64 = unsafe { (*node.child_at(i)).low_key() };
            if child_low != separator {
                return Err(InvariantViolation::ChildFence {
                    level,
                    separator,
                    child_low,
                });
            }
        }
        Ok(())
    }

    /// Render every level, root first, one line per level.
    #[must_use]
    pub fn dump(&self) -> String {
        let guard = self.guard();
        let mut out = String::new();
        for head in self.level_heads(&guard) {
            let _ = write!(out, "L{}:", head.level());
            let mut current: *mut Node<Y, CAP> = std::ptr::from_ref(head).cast_mut();
            while !current.is_null() {
                let node: &Node<Y, CAP> = self.node(current, &guard);
                out.push(' ');
                out.push_str(&node.describe());
                current = node.right();
            }
            out.push('\n');
        }
        out
    }
}
