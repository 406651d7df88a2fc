//! In-place field update of stored values.

use seize::LocalGuard;

use super::CircleTree;
use crate::config::Diagnostic;
use crate::layout::NodeLayout;
use crate::tracing_helpers::debug_log;
use crate::value::{FieldUpdate, UpdateError};

impl<V, Y, const CAP: usize> CircleTree<V, Y, CAP>
where
    V: FieldUpdate + Send + Sync + 'static,
    Y: NodeLayout,
{
    /// Overwrite field `field` of the value stored under `key`.
    ///
    /// The write happens while the leaf holding `key` is locked, so it cannot
    /// race a delete or replace of the same key. The value itself is not
    /// reallocated.
    ///
    /// # Errors
    /// [`UpdateError::KeyNotFound`] if `key` is absent (also reported as
    /// [`Diagnostic::UpdateMissing`]), or whatever
    /// [`FieldUpdate::write_field`] rejects.
    pub fn update(&self, key: i64, field: usize, bytes: &[u8]) -> Result<(), UpdateError> {
        let guard = self.guard();
        self.update_with_guard(key, field, bytes, &guard)
    }

    /// [`update`](Self::update) under an existing guard.
    ///
    /// # Errors
    /// See [`update`](Self::update).
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "trace", skip(self, bytes, guard), fields(len = bytes.len()))
    )]
    pub fn update_with_guard(
        &self,
        key: i64,
        field: usize,
        bytes: &[u8],
        guard: &LocalGuard<'_>,
    ) -> Result<(), UpdateError> {
        let (leaf, lock) = self.lock_level(key, 0, guard);

        let Ok(pos) = leaf.position(key) else {
            drop(lock);
            debug_log!(key, "update: key not found");
            self.config.report(Diagnostic::UpdateMissing(key));
            return Err(UpdateError::KeyNotFound(key));
        };

        let ptr: *const V = leaf.ptr_at(pos).cast_const().cast::<V>();
        // SAFETY: the slot owns a strong count of this value and cannot be
        // cleared or replaced while we hold the leaf lock.
        let value: &V = unsafe { &*ptr };
        let result: Result<(), UpdateError> = value.write_field(field, bytes, &self.persist);
        drop(lock);
        result
    }
}
