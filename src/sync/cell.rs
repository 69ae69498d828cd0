/*
 * flowsession - concurrent TTL session map core
 *
 * `MapCell<T>`: an epoch-protected single-writer cell, adapted from
 * `engine::sync::cell::TMCell`. `SessionTable` holds one of these per
 * map slot (spec.md §4.3): workers dereference the current value under
 * an epoch pin, the control plane swaps in a freshly built replacement
 * during a resize, and the old value is freed only once
 * `crossbeam_epoch` has proven no pinned reader could still observe it
 * (`defer_destroy`), rather than being freed synchronously the instant
 * the swap completes.
 *
 * Takes ownership through `Box<T>` rather than `T` directly: `Owned<T>`
 * and `Atomic<T>` both have a `From<Box<T>>` that reuses the box's
 * existing heap allocation instead of relocating the value, which
 * matters here because `TtlMap`'s chunk table stores address-relative
 * offsets that only stay valid if the map is never moved after it is
 * built.
 */

use core::sync::atomic::Ordering;
use crossbeam_epoch::{Atomic, Guard, Owned};
use parking_lot::Mutex;

/// Always holds a live value after construction; never observed null
/// by a caller going through `load`.
pub struct MapCell<T: 'static> {
    inner: Atomic<T>,
    // serializes control-plane writers. `SessionTable` has exactly one
    // (the thread driving `resize`), so this never contends in
    // practice; it exists to make "exactly one writer at a time" a
    // compile-time-enforced invariant rather than a documented one.
    write_lock: Mutex<()>,
}

impl<T: 'static> MapCell<T> {
    pub fn new(value: Box<T>) -> Self {
        Self {
            inner: Atomic::from(value),
            write_lock: Mutex::new(()),
        }
    }

    /// Acquire-loads the current value. Borrowed for as long as `guard`
    /// stays pinned, matching `TMCell::begin_read_txn`'s contract.
    pub fn load<'g>(&self, guard: &'g Guard) -> &'g T {
        let shared = self.inner.load(Ordering::Acquire, guard);
        // SAFETY: `inner` is never null after construction; `swap`
        // only ever installs another live `Owned::new(..)`.
        unsafe { shared.deref() }
    }

    /// Installs `new`, publishing it with release ordering, and defers
    /// destruction of the value it replaced until the epoch reclaims it
    /// (`TMCell::publish_commit`). Blocks on the write lock if another
    /// writer is mid-swap, which spec.md §5 rules out at the call-site
    /// level (one control-plane writer per table) but is still safe if
    /// violated.
    pub fn swap(&self, new: Box<T>, guard: &Guard) {
        let _serialize = self.write_lock.lock();
        let old = self.inner.swap(Owned::from(new), Ordering::AcqRel, guard);
        // SAFETY: `old` was installed by a previous `new`/`swap` on
        // this cell and is being replaced under the write lock, so no
        // other writer can be racing to retire the same pointer twice.
        unsafe {
            guard.defer_destroy(old);
        }
    }
}

impl<T: 'static> Drop for MapCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no other thread can be
        // dereferencing this cell's pointer through a pin right now.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let shared = self.inner.load(Ordering::Relaxed, guard);
            drop(shared.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_sees_latest_swap() {
        let cell = MapCell::new(Box::new(1u64));
        {
            let guard = crossbeam_epoch::pin();
            assert_eq!(*cell.load(&guard), 1);
        }
        {
            let guard = crossbeam_epoch::pin();
            cell.swap(Box::new(2), &guard);
        }
        let guard = crossbeam_epoch::pin();
        assert_eq!(*cell.load(&guard), 2);
    }

    #[test]
    fn repeated_swaps_do_not_leak_or_double_free() {
        let cell = MapCell::new(Box::new(0u64));
        for i in 1..50u64 {
            let guard = crossbeam_epoch::pin();
            cell.swap(Box::new(i), &guard);
        }
        let guard = crossbeam_epoch::pin();
        assert_eq!(*cell.load(&guard), 49);
    }
}
