//! One-byte key fingerprints.
//!
//! A leaf can keep one hash byte per entry and compare it before the key.
//! Fingerprints only ever reject: a matching byte still needs the full key
//! comparison.

/// Hash a key to its fingerprint byte.
///
/// Keys whose bit pattern exceeds `u32::MAX` go through a 32-bit style
/// xor-shift-multiply mix; smaller keys through a 64-bit finalizer.
#[inline]
#[must_use]
#[expect(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub const fn hash(key: i64) -> u8 {
    let mut x: u64 = key as u64;
    if x > u32::MAX as u64 {
        x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b);
        x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b);
        x = (x >> 16) ^ x;
    } else {
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^= x >> 31;
    }
    x as u8
}
