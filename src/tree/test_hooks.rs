//! Test hooks for deterministic concurrency testing.
//!
//! A hook lets a test pause a writer at a chosen point of the split
//! protocol and observe the tree from another thread.
//!
//! # Usage
//!
//! ```rust,ignore
//! let barrier = Arc::new(Barrier::new(2));
//! let b = Arc::clone(&barrier);
//! tree.hooks().set_before_propagate(Box::new(move |_split_key| {
//!     b.wait(); // sibling linked, parent not updated yet
//!     b.wait(); // observer is done
//! }));
//! ```
//!
//! Hooks are per tree, so tests running in parallel never see each
//! other's hooks.

use std::sync::Arc;

use parking_lot::Mutex;

/// Hook type: receives the split key being published.
pub type SplitHook = Box<dyn Fn(i64) + Send + Sync>;

/// Hooks installed on one tree.
#[derive(Default)]
pub struct Hooks {
    /// Called after a non-root split released the node lock and before the
    /// split key is inserted into the parent.
    before_propagate: Mutex<Option<Arc<dyn Fn(i64) + Send + Sync>>>,
}

impl Hooks {
    /// Set the before-propagate hook.
    ///
    /// # Panics
    /// Panics if a hook is already set.
    pub fn set_before_propagate(&self, hook: SplitHook) {
        let mut slot = self.before_propagate.lock();
        assert!(
            slot.is_none(),
            "before_propagate already set; call clear_before_propagate first"
        );
        *slot = Some(Arc::from(hook));
    }

    /// Clear the before-propagate hook.
    pub fn clear_before_propagate(&self) {
        *self.before_propagate.lock() = None;
    }

    /// Run the before-propagate hook, if set.
    ///
    /// The hook runs without the mutex held, so it may block.
    pub fn call_before_propagate(&self, split_key: i64) {
        let hook = self.before_propagate.lock().clone();
        if let Some(hook) = hook {
            hook(split_key);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_propagate", &self.before_propagate.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::Hooks;

    #[test]
    fn test_hook_runs_until_cleared() {
        let hooks = Hooks::default();
        let seen = Arc::new(AtomicI64::new(0));
        let s = Arc::clone(&seen);
        hooks.set_before_propagate(Box::new(move |k| {
            s.fetch_add(k, Ordering::Relaxed);
        }));

        hooks.call_before_propagate(3);
        hooks.call_before_propagate(4);
        assert_eq!(seen.load(Ordering::Relaxed), 7);

        hooks.clear_before_propagate();
        hooks.call_before_propagate(100);
        assert_eq!(seen.load(Ordering::Relaxed), 7);
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn test_double_set_panics() {
        let hooks = Hooks::default();
        hooks.set_before_propagate(Box::new(|_| {}));
        hooks.set_before_propagate(Box::new(|_| {}));
    }
}
