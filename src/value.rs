//! Entry values.
//!
//! Every entry slot holds one raw pointer. What it points to depends on the
//! level of the node that owns it: leaves (level 0) hold a leaked `Arc<V>`,
//! internal nodes hold a child node. [`ValueRef`] is the decoded form.
//!
//! [`Record`] is a fixed-size value whose fields can be overwritten in place
//! through [`FieldUpdate`], which is what the tree's `update` operation uses.

use std::fmt as StdFmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pmem::{FlushKind, Persist};

// ============================================================================
//  ValueRef
// ============================================================================

/// A decoded entry pointer.
#[derive(Debug, PartialEq, Eq)]
pub enum ValueRef<N> {
    /// A leaf value: the raw form of an `Arc<V>`.
    Leaf(*mut u8),
    /// A child node.
    Child(*mut N),
}

impl<N> Clone for ValueRef<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for ValueRef<N> {}

impl<N> ValueRef<N> {
    /// Decode a slot pointer stored by a node at `level`.
    #[inline]
    #[must_use]
    pub fn decode(level: u32, raw: *mut u8) -> Self {
        if level == 0 {
            Self::Leaf(raw)
        } else {
            Self::Child(raw.cast::<N>())
        }
    }

    /// The raw slot pointer.
    #[inline]
    #[must_use]
    pub fn into_raw(self) -> *mut u8 {
        match self {
            Self::Leaf(ptr) => ptr,
            Self::Child(ptr) => ptr.cast::<u8>(),
        }
    }

    /// Whether the pointer is null.
    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.into_raw().is_null()
    }

    /// The child node, if this entry belongs to an internal node.
    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<*mut N> {
        match self {
            Self::Child(ptr) => Some(ptr),
            Self::Leaf(_) => None,
        }
    }
}

// ============================================================================
//  Leaf value ownership
// ============================================================================

/// Leak an `Arc<V>` into a slot pointer. The slot owns one strong count.
#[inline]
pub(crate) fn leak<V>(value: Arc<V>) -> *mut u8 {
    Arc::into_raw(value).cast_mut().cast::<u8>()
}

/// Take a new strong reference to a slot's value.
///
/// # Safety
/// `ptr` must come from [`leak::<V>`] and its strong count must not have
/// been released yet (the caller holds a seize guard that predates any
/// retirement).
#[inline]
pub(crate) unsafe fn share<V>(ptr: *mut u8) -> Arc<V> {
    let ptr: *const V = ptr.cast_const().cast::<V>();
    // SAFETY: caller guarantees `ptr` is a live `Arc<V>` allocation.
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

/// Take back the slot's strong reference.
///
/// # Safety
/// `ptr` must come from [`leak::<V>`], and no slot or pending retirement may
/// still own it.
#[inline]
pub(crate) unsafe fn reclaim<V>(ptr: *mut u8) -> Arc<V> {
    // SAFETY: caller transfers the slot's ownership.
    unsafe { Arc::from_raw(ptr.cast_const().cast::<V>()) }
}

// ============================================================================
//  UpdateError
// ============================================================================

/// Errors returned by an in-place field update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// No entry with this key.
    KeyNotFound(i64),

    /// Field index past the end of the record.
    FieldOutOfRange {
        /// Requested field.
        field: usize,
        /// Number of fields in the record.
        fields: usize,
    },

    /// New bytes do not fit in one field.
    ValueTooLong {
        /// Length of the new bytes.
        len: usize,
        /// Field size.
        max: usize,
    },
}

impl StdFmt::Display for UpdateError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyNotFound(key) => write!(f, "key {key} not found"),

            Self::FieldOutOfRange { field, fields } => {
                write!(f, "field {field} out of range (record has {fields})")
            }

            Self::ValueTooLong { len, max } => {
                write!(f, "{len} bytes do not fit in a {max}-byte field")
            }
        }
    }
}

impl std::error::Error for UpdateError {}

// ============================================================================
//  Record
// ============================================================================

/// Total size of a [`Record`] in bytes.
pub const RECORD_SIZE: usize = 1000;

/// Size of one field of a [`Record`].
pub const FIELD_SIZE: usize = 100;

/// Number of fields in a [`Record`].
pub const FIELDS: usize = RECORD_SIZE / FIELD_SIZE;

/// Values that support overwriting one fixed-size field in place.
pub trait FieldUpdate {
    /// Overwrite field `field` with `bytes`, padding the rest with zeros,
    /// and flush the written range.
    ///
    /// # Errors
    /// [`UpdateError::FieldOutOfRange`] or [`UpdateError::ValueTooLong`].
    fn write_field(&self, field: usize, bytes: &[u8], persist: &Persist)
    -> Result<(), UpdateError>;
}

/// A fixed 1000-byte value made of ten 100-byte fields.
///
/// The bytes are never reallocated, so a field update is a copy plus a
/// flush of the touched lines.
pub struct Record {
    bytes: RwLock<[u8; RECORD_SIZE]>,
}

impl Record {
    /// A zeroed record.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: RwLock::new([0; RECORD_SIZE]),
        }
    }

    /// A record with the leading bytes copied from `bytes`.
    ///
    /// Input beyond `RECORD_SIZE` is ignored.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0_u8; RECORD_SIZE];
        let len: usize = bytes.len().min(RECORD_SIZE);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            bytes: RwLock::new(buf),
        }
    }

    /// Copy of field `field`, or `None` past the end.
    #[must_use]
    pub fn field(&self, field: usize) -> Option<[u8; FIELD_SIZE]> {
        if field >= FIELDS {
            return None;
        }
        let bytes = self.bytes.read();
        let mut out = [0_u8; FIELD_SIZE];
        out.copy_from_slice(&bytes[field * FIELD_SIZE..(field + 1) * FIELD_SIZE]);
        Some(out)
    }

    /// Copy of the whole record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        *self.bytes.read()
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl StdFmt::Debug for Record {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let bytes = self.bytes.read();
        let used: usize = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        f.debug_struct("Record").field("used", &used).finish()
    }
}

impl FieldUpdate for Record {
    fn write_field(
        &self,
        field: usize,
        bytes: &[u8],
        persist: &Persist,
    ) -> Result<(), UpdateError> {
        if field >= FIELDS {
            return Err(UpdateError::FieldOutOfRange {
                field,
                fields: FIELDS,
            });
        }
        if bytes.len() > FIELD_SIZE {
            return Err(UpdateError::ValueTooLong {
                len: bytes.len(),
                max: FIELD_SIZE,
            });
        }

        let mut guard = self.bytes.write();
        let dst: &mut [u8] = &mut guard[field * FIELD_SIZE..(field + 1) * FIELD_SIZE];
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()..].fill(0);
        persist.flush_range(FlushKind::Value, dst.as_ptr(), FIELD_SIZE, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_ref_decodes_by_level() {
        let mut byte = 0_u8;
        let raw: *mut u8 = &raw mut byte;
        assert_eq!(ValueRef::<u64>::decode(0, raw), ValueRef::Leaf(raw));
        assert_eq!(
            ValueRef::<u64>::decode(1, raw),
            ValueRef::Child(raw.cast::<u64>())
        );
        assert_eq!(ValueRef::<u64>::decode(3, raw).into_raw(), raw);
        assert_eq!(ValueRef::<u64>::decode(0, raw).child(), None);
        assert_eq!(ValueRef::<u64>::decode(2, raw).child(), Some(raw.cast::<u64>()));
    }

    #[test]
    fn test_leak_share_reclaim() {
        let value = Arc::new(String::from("v"));
        let raw = leak(Arc::clone(&value));
        assert_eq!(Arc::strong_count(&value), 2);

        // SAFETY: raw came from leak and is still owned by "the slot".
        let shared: Arc<String> = unsafe { share(raw) };
        assert_eq!(Arc::strong_count(&value), 3);
        drop(shared);

        // SAFETY: last owner of the slot reference.
        drop(unsafe { reclaim::<String>(raw) });
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn test_record_field_update_pads() {
        let persist = Persist::new(0, true);
        let rec = Record::from_bytes(&[b'x'; RECORD_SIZE]);

        rec.write_field(3, b"hello", &persist).unwrap();
        let field = rec.field(3).unwrap();
        assert_eq!(&field[..5], b"hello");
        assert!(field[5..].iter().all(|b| *b == 0));
        assert_eq!(rec.field(2).unwrap(), [b'x'; FIELD_SIZE]);
        assert_eq!(rec.field(4).unwrap(), [b'x'; FIELD_SIZE]);

        let log = persist.take_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, FlushKind::Value);
    }

    #[test]
    fn test_record_rejects_bad_updates() {
        let persist = Persist::default();
        let rec = Record::new();
        assert_eq!(
            rec.write_field(FIELDS, b"a", &persist),
            Err(UpdateError::FieldOutOfRange {
                field: FIELDS,
                fields: FIELDS
            })
        );
        assert_eq!(
            rec.write_field(0, &[0; FIELD_SIZE + 1], &persist),
            Err(UpdateError::ValueTooLong {
                len: FIELD_SIZE + 1,
                max: FIELD_SIZE
            })
        );
        assert!(rec.write_field(9, &[1; FIELD_SIZE], &persist).is_ok());
        assert!(rec.field(FIELDS).is_none());
    }
}
