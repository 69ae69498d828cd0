/*
 * flowsession - concurrent TTL session map core
 *
 * `SessionTable`: the online-resizable structure the control plane
 * sees (spec.md §4.3). Two [`TtlMap`] slots behind [`MapCell`]s,
 * addressed by a generation counter, so a resize can publish a freshly
 * built map and retire the old one without a worker's read or write
 * path ever blocking on the swap itself.
 */

use crate::alloc::Allocator;
use crate::bucket::Upsert;
use crate::error::CoreResult;
use crate::sync::cell::MapCell;
use crate::sync::rcu::{RcuEpoch, MAX_WORKERS};
use crate::ttlmap::{TtlMap, TtlMapConfig};
use core::sync::atomic::{AtomicU64, Ordering};

/// Maps a generation counter onto one of the two map slots.
///
/// `idx(gen) = ((gen + 1) & 0b11) >> 1`, which over four consecutive
/// generations visits slots `0, 1, 1, 0` (spec.md §9 open question:
/// this exact formula must be preserved, not simplified to `gen & 1`).
/// A resize spans exactly two publishes: the first flips the active
/// slot to the map it just finished building, the second only closes
/// the fallback window without flipping again. `gen & 1` would instead
/// flip on *every* publish, undoing the first publish's swap on the
/// second.
fn idx(gen: u64) -> usize {
    (((gen + 1) & 0b11) >> 1) as usize
}

/// A resize's migration is in flight for exactly one generation after
/// its first publish: `gen` odd means a read miss on the active map
/// must additionally consult the previous one (spec.md §4.3 step 3/4).
fn in_fallback_window(gen: u64) -> bool {
    gen & 1 == 1
}

/// Snapshot returned by [`SessionTable::fill_balancer_info`]. The
/// spec's `fill_balancer_info` leaves its exact output shape
/// unspecified beyond "enough for the control plane to decide whether
/// to resize"; this is that shape.
#[derive(Debug, Clone, Copy)]
pub struct SessionTableStats {
    pub live_entries: u64,
    pub capacity: u64,
    pub current_generation: u64,
    pub migration_overflow: u64,
}

pub struct SessionTable<K: 'static, V: 'static, A: 'static> {
    maps: [MapCell<TtlMap<K, V, A>>; 2],
    rcu: RcuEpoch,
    migration_overflow: AtomicU64,
}

// SAFETY: all cross-thread access to table contents goes through
// `TtlMap`'s own bucket locks and the epoch-guarded `MapCell`s; the
// table's own fields carry no extra thread-affinity.
unsafe impl<K: Send, V: Send, A: Send + Sync> Send for SessionTable<K, V, A> {}
unsafe impl<K: Send, V: Send, A: Send + Sync> Sync for SessionTable<K, V, A> {}

impl<K, V, A> SessionTable<K, V, A>
where
    K: Copy + Eq + Default + 'static,
    V: Copy + Default + 'static,
    A: Allocator + Clone + 'static,
{
    /// Builds a table with slot 0 sized for `config` and slot 1 as a
    /// minimal placeholder that becomes live on the first `resize`.
    pub fn new(config: TtlMapConfig, alloc: A) -> CoreResult<Self> {
        let first = TtlMap::new(config, alloc.clone())?;
        let second = TtlMap::new(
            TtlMapConfig {
                initial_kv_entries: 1,
            },
            alloc,
        )?;
        Ok(Self {
            maps: [MapCell::new(first), MapCell::new(second)],
            rcu: RcuEpoch::new(),
            migration_overflow: AtomicU64::new(0),
        })
    }

    /// Worker read-only path (spec.md §4.3): consult the active map;
    /// during a resize's fallback window, a miss additionally consults
    /// the previous one. Returns an owned copy (`V: Copy`) so no lock
    /// or epoch pin needs to outlive this call.
    pub fn lookup(&self, worker: usize, key: &K, now: u32) -> Option<V> {
        let (gen, guard) = self.rcu.observe(worker);
        let active = idx(gen);
        if let Some((_, v)) = self.maps[active].load(&guard).lookup(key, now) {
            return Some(v);
        }
        if in_fallback_window(gen) {
            let prev = 1 - active;
            if let Some((_, v)) = self.maps[prev].load(&guard).lookup(key, now) {
                return Some(v);
            }
        }
        None
    }

    /// Worker upsert path (spec.md §4.3): targets the active map only
    /// — there is no write-side fallback. `f` runs with the bucket
    /// lock and the epoch pin both held, so it must return promptly
    /// and must not call back into this table.
    pub fn get<F, R>(&self, worker: usize, key: K, now: u32, timeout: u32, f: F) -> R
    where
        F: FnOnce(Upsert<'_, K, V>) -> R,
    {
        let (gen, guard) = self.rcu.observe(worker);
        let active = idx(gen);
        let upsert = self.maps[active].load(&guard).get(key, now, timeout);
        f(upsert)
    }

    /// Visits the active map only. A resize in flight is invisible
    /// here: iteration is a control-plane diagnostic, not a
    /// consistency-sensitive read (spec.md §4.3).
    pub fn iter<F: FnMut(&K, &V, u32) -> bool>(&self, now: u32, callback: F) -> bool {
        let guard = crossbeam_epoch::pin();
        let gen = self.rcu.current();
        self.maps[idx(gen)].load(&guard).iter(now, callback)
    }

    pub fn capacity(&self) -> u64 {
        let guard = crossbeam_epoch::pin();
        let gen = self.rcu.current();
        self.maps[idx(gen)].load(&guard).capacity()
    }

    pub fn fill_balancer_info(&self, now: u32) -> SessionTableStats {
        let mut live = 0u64;
        self.iter(now, |_, _, _| {
            live += 1;
            false
        });
        SessionTableStats {
            live_entries: live,
            capacity: self.capacity(),
            current_generation: self.rcu.current(),
            migration_overflow: self.migration_overflow.load(Ordering::Relaxed),
        }
    }

    /// Control-plane-only online resize (spec.md §4.3):
    ///
    /// 1. build a fresh map for the slot that is not currently active
    /// 2. publish once — the fresh map becomes active, and a read miss
    ///    now additionally falls back to the old (now previous) map
    /// 3. walk every live entry in the old map and reinsert it into the
    ///    new one with its remaining TTL, tallying entries that fail to
    ///    land instead of retrying them
    /// 4. publish again — the fallback window closes
    /// 5. wait for every worker to have observed a generation at least
    ///    as new as the second publish, so none can still be reading
    ///    through a generation that still names the old map
    /// 6. the old map is retired: its `MapCell` slot already holds the
    ///    placeholder/other map from step 1's swap, and the map it
    ///    replaced is freed once the epoch proves it unreachable
    ///
    /// `workers` must equal the data plane's actual worker count
    /// (`<= MAX_WORKERS`); understating it lets step 5 return before a
    /// live worker has actually caught up.
    pub fn resize(&self, workers: usize, new_kv_entries: u64, now: u32) -> CoreResult<()> {
        debug_assert!(workers <= MAX_WORKERS);
        let gen0 = self.rcu.current();
        let active = idx(gen0);
        let other = 1 - active;

        let alloc = {
            let guard = crossbeam_epoch::pin();
            self.maps[active].load(&guard).allocator().clone()
        };
        let fresh = TtlMap::new(
            TtlMapConfig {
                initial_kv_entries: new_kv_entries,
            },
            alloc,
        )?;

        {
            let guard = crossbeam_epoch::pin();
            self.maps[other].swap(fresh, &guard);
        }
        let gen1 = self.rcu.publish();
        debug_assert_eq!(
            idx(gen1),
            other,
            "first publish of a resize must flip the active slot"
        );
        log::info!(
            "session table resize: generation {gen1} now serving {new_kv_entries} entries, migrating from the previous generation"
        );

        let mut overflow = 0u64;
        {
            let guard = crossbeam_epoch::pin();
            let old = self.maps[active].load(&guard);
            let fresh_ref = self.maps[other].load(&guard);
            old.iter(now, |key, value, deadline| {
                let remaining = deadline.saturating_sub(now);
                if remaining == 0 {
                    return false;
                }
                match fresh_ref.get(*key, now, remaining) {
                    Upsert::Ok { mut guard, .. } => {
                        *guard.value_mut() = *value;
                        guard.release();
                    }
                    Upsert::Failed => overflow += 1,
                }
                false
            });
        }
        if overflow > 0 {
            log::warn!(
                "session table resize: {overflow} entries dropped migrating into generation {gen1}"
            );
            self.migration_overflow.fetch_add(overflow, Ordering::Relaxed);
        }

        let gen2 = self.rcu.publish();
        debug_assert_eq!(
            idx(gen2),
            other,
            "second publish of a resize must not flip the active slot again"
        );
        self.rcu.quiesce(gen2, workers);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapAllocator;
    use crate::bucket::B;

    fn table(initial_entries: u64) -> SessionTable<u64, u64, HeapAllocator> {
        SessionTable::new(
            TtlMapConfig {
                initial_kv_entries: initial_entries,
            },
            HeapAllocator::default(),
        )
        .unwrap()
    }

    #[test]
    fn idx_follows_the_0_1_1_0_cycle() {
        let observed: Vec<usize> = (0..8).map(idx).collect();
        assert_eq!(observed, vec![0, 1, 1, 0, 0, 1, 1, 0]);
    }

    #[test]
    fn insert_then_lookup_on_fresh_table() {
        let t = table(16 * B as u64);
        t.get(0, 42, 100, 30, |up| {
            let Upsert::Ok { status, guard } = up else {
                panic!("expected insert")
            };
            assert!(status.is_inserted());
            guard.release();
        });
        assert_eq!(t.lookup(0, &42, 110), Some(0));
        assert_eq!(t.lookup(0, &42, 131), None);
    }

    #[test]
    fn resize_preserves_live_entries_values_and_remaining_ttl() {
        let t = table(16 * B as u64);
        for k in 0..10u64 {
            t.get(0, k, 0, 1000, |up| {
                let Upsert::Ok { mut guard, .. } = up else {
                    panic!("expected insert")
                };
                // distinct, non-default values: a migration that
                // silently replaced the value with `V::default()` would
                // pass a values-left-at-0 test and not be caught.
                *guard.value_mut() = k * 100 + 7;
                guard.release();
            });
        }

        // `workers: 0` — this test drives no background worker thread to
        // keep polling `observe` after the resize publishes, so passing
        // any nonzero count here would spin `quiesce` forever waiting on
        // a slot nothing ever advances again.
        t.resize(0, 64 * B as u64, 500).unwrap();

        assert_eq!(t.capacity(), 64 * B as u64);
        for k in 0..10u64 {
            assert_eq!(
                t.lookup(0, &k, 500),
                Some(k * 100 + 7),
                "key {k}'s value should survive resize unchanged"
            );
        }
        // the remaining TTL (1000 - 500 = 500) must have carried over,
        // not been reset to a fresh full timeout.
        assert_eq!(t.lookup(0, &0, 999), Some(7));
        assert_eq!(t.lookup(0, &0, 1001), None);
        assert_eq!(t.fill_balancer_info(500).migration_overflow, 0);
    }

    #[test]
    fn lookup_falls_back_to_previous_map_mid_resize() {
        let t = table(16 * B as u64);
        t.get(0, 7, 0, 1000, |up| {
            let Upsert::Ok { guard, .. } = up else {
                panic!()
            };
            guard.release();
        });
        // a single `get` in flight should not lose a key that only the
        // fallback path (not the fresh map) can still answer; simulate
        // the mid-resize window directly via the same two publishes
        // `resize` performs, without the migration step, so the key
        // only exists in the now-previous map.
        let gen0 = t.rcu.current();
        let active = idx(gen0);
        let other = 1 - active;
        let alloc = {
            let guard = crossbeam_epoch::pin();
            t.maps[active].load(&guard).allocator().clone()
        };
        let fresh = TtlMap::new(
            TtlMapConfig {
                initial_kv_entries: 16 * B as u64,
            },
            alloc,
        )
        .unwrap();
        {
            let guard = crossbeam_epoch::pin();
            t.maps[other].swap(fresh, &guard);
        }
        let gen1 = t.rcu.publish();
        assert!(in_fallback_window(gen1));

        assert_eq!(t.lookup(0, &7, 10), Some(0));
    }

    // spec.md §8 end-to-end scenario 4: a resize in flight must never
    // cause a concurrent reader to miss a key that was live before the
    // resize started.
    #[test]
    fn concurrent_lookups_never_miss_during_a_live_resize() {
        use rand::Rng;
        use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
        use std::sync::Arc;
        use std::thread;

        let t = Arc::new(table(16 * B as u64));
        for k in 0..10u64 {
            t.get(0, k, 0, 10_000, |up| {
                let Upsert::Ok { guard, .. } = up else {
                    panic!("expected insert")
                };
                guard.release();
            });
        }

        // readers use worker slots 0..3 so `resize`'s `quiesce(target, 3)`
        // waits on exactly the slots these threads actually poll; worker
        // slot 0's earlier use for the setup inserts above is a one-off
        // control-plane-thread call, not a standing reader, so it must
        // not be among the slots `quiesce` waits on here.
        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|worker| {
                let t = Arc::clone(&t);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut misses = 0usize;
                    while !stop.load(AtomicOrdering::Relaxed) {
                        let k: u64 = rng.gen_range(0..10);
                        if t.lookup(worker, &k, 0).is_none() {
                            misses += 1;
                        }
                    }
                    misses
                })
            })
            .collect();

        t.resize(3, 64 * B as u64, 0).unwrap();
        stop.store(true, AtomicOrdering::Relaxed);

        for reader in readers {
            let misses = reader.join().unwrap();
            assert_eq!(misses, 0, "a live key must never miss mid-resize");
        }
        assert_eq!(t.capacity(), 64 * B as u64);
        for k in 0..10u64 {
            assert_eq!(t.lookup(0, &k, 0), Some(0));
        }
    }

    // spec.md §8 end-to-end scenario 5: shrinking a table can pack more
    // live entries into a new bucket than it has slots for; the excess
    // must be dropped, not retried, and counted as migration overflow.
    #[test]
    fn shrinking_a_table_drops_overflow_and_counts_it() {
        let t = table(256); // 16 buckets of 16 slots each
        let mut inserted = 0u64;
        for k in 0..200u64 {
            t.get(0, k, 0, 1000, |up| {
                if let Upsert::Ok { guard, .. } = up {
                    inserted += 1;
                    guard.release();
                }
            });
        }
        assert!(inserted > B as u64, "need more live keys than one bucket holds");

        // shrink to a single bucket: every surviving key now collides on
        // bucket 0, so anything past the first 16 migrated must overflow.
        // `workers: 0` for the same reason as above — no background
        // thread is polling `observe` here.
        t.resize(0, B as u64, 0).unwrap();

        let stats = t.fill_balancer_info(0);
        assert_eq!(stats.capacity, B as u64);
        assert_eq!(stats.live_entries, B as u64);
        assert_eq!(stats.migration_overflow, inserted - B as u64);
    }
}
