/*
 * flowsession - concurrent TTL session map core
 *
 * a 32-bit City-Hash-family mix, grounded in the teacher's own
 * hand-rolled bit-mixing (`engine::idx::meta::hash::HashWord`) rather
 * than an external hashing crate — the spec only requires a hash with
 * <= 2^-16 pair collision rate on uniform keys, not a specific
 * algorithm, and the teacher never reaches outside std for this.
 */

const ROTATE: u32 = 5;
const PRIME32: u32 = 0x9E3779B9; // golden ratio, 32-bit
const SEED: u32 = 0xC17A_33B2;

fn mix(state: u32, word: u32) -> u32 {
    (state.rotate_left(ROTATE) ^ word).wrapping_mul(PRIME32)
}

/// 32-bit hash over a byte range. Used for both TTL-map keys and
/// registry identifiers (spec.md §6, §4.4).
pub fn city32(bytes: &[u8]) -> u32 {
    let mut state = SEED;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        state = mix(state, u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    let rem = chunks.remainder();
    if rem.len() >= 2 {
        state = mix(state, u16::from_ne_bytes([rem[0], rem[1]]) as u32);
        if rem.len() == 3 {
            state = mix(state, rem[2] as u32);
        }
    } else if let Some(&b) = rem.first() {
        state = mix(state, b as u32);
    }
    // fold the length in so that same-prefix different-length inputs
    // (e.g. identifier structs with trailing zero padding) still
    // diverge.
    mix(state, bytes.len() as u32)
}

/// Hashes any `Copy` POD value by its raw byte representation.
///
/// # Safety contract
/// Callers must zero the value (or its padding) before populating
/// fields when `T` has padding bytes, per spec.md §4.4, so that
/// uninitialized padding doesn't poison the hash or equality checks.
pub fn city32_of<T: Copy>(val: &T) -> u32 {
    let bytes =
        unsafe { core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>()) };
    city32(bytes)
}
