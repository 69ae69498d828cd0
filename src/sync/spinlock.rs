/*
 * flowsession - concurrent TTL session map core
 *
 * the bucket-level lock. `Bucket` is embedded inside a chunk of raw,
 * possibly shared-memory bytes (spec.md §4.1), so its lock cannot be a
 * heap-backed mutex like `parking_lot::Mutex` — it must be valid as
 * plain bytes with no process-local bookkeeping. `spin::Mutex` is
 * exactly that: a lock word plus an `UnsafeCell`, grounded in the
 * vendored concurrent hash table's own choice of `spin::MutexGuard`
 * for its per-partition lock.
 */

pub type Lock<T> = spin::Mutex<T>;
pub type LockGuard<'a, T> = spin::MutexGuard<'a, T>;
