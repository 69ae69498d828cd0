/*
 * flowsession - concurrent TTL session map core
 *
 * test-only support: a brute-force key generator that finds real keys
 * colliding under `hash::city32_of` on a given bucket count, so the
 * collision-probing scenario (spec.md §8 scenario 2) can be exercised
 * against the crate's actual hash rather than a hand-picked bucket
 * hint. Every operation under test takes `now: u32` directly (spec.md
 * §4.1's contract), so there is no clock fixture to provide here —
 * tests just pass whatever `u32` they need.
 */

use crate::hash::city32_of;

/// Finds `count` distinct `u64` keys that all land in the same bucket
/// of a map with `buckets` buckets (a power of two) under
/// `hash::city32_of`. Brute-forces upward from `0`; `buckets` is small
/// in every caller (a handful of buckets at most), so this terminates
/// quickly in practice.
pub fn same_bucket_keys(buckets: usize, count: usize) -> Vec<u64> {
    debug_assert!(buckets.is_power_of_two());
    let mask = buckets as u64 - 1;
    let mut target: Option<u64> = None;
    let mut found = Vec::with_capacity(count);
    let mut k = 0u64;
    while found.len() < count {
        let bucket = (city32_of(&k) as u64) & mask;
        match target {
            None => {
                target = Some(bucket);
                found.push(k);
            }
            Some(t) if bucket == t => found.push(k),
            _ => {}
        }
        k += 1;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_keys_that_actually_collide() {
        let keys = same_bucket_keys(8, 5);
        assert_eq!(keys.len(), 5);
        let mask = 7u64;
        let buckets: Vec<u64> = keys.iter().map(|k| (city32_of(k) as u64) & mask).collect();
        assert!(buckets.windows(2).all(|w| w[0] == w[1]));
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), keys.len(), "keys must be distinct");
    }
}
