//! Frame masking
//!
//! XOR masking per RFC 6455 §5.3. Masking and unmasking are the same
//! operation, so a single in-place transform serves both directions.

use rand::Rng;

/// Apply the repeating 4-byte mask to `data` in place.
///
/// Works a u64 at a time; the tail falls back to per-byte XOR. Safe to call
/// on an empty slice.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ mask_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    // The remainder starts at a multiple of 8, so the mask phase restarts
    // at index 0.
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Fresh cryptographically random masking key for one client frame
#[inline]
pub fn generate_mask() -> [u8; 4] {
    rand::thread_rng().gen()
}
