/*
 * flowsession - concurrent TTL session map core
 *
 * the RCU-style barrier consumed by `SessionTable::resize` (spec.md
 * §4.3, §6). Modeled as "publish, then wait for every worker to have
 * polled at least once": a single control-plane writer bumps a
 * generation counter with release ordering (`publish`, i.e.
 * `rcu_update`); every worker records the generation it last observed
 * on every operation (`observe`, i.e. `rcu_load`) with acquire
 * ordering; the control plane spins on `quiesce` until all `W <= 8`
 * worker slots have caught up.
 *
 * Workers additionally pin the process-wide epoch
 * (`crossbeam_epoch::pin`, re-exported here the way
 * `engine::sync::atm` re-exports it as `cpin`) for the duration of
 * their operation, so that any memory a control-plane resize retires
 * is safe to reclaim only once no pinned worker could still be
 * dereferencing it.
 */

use core::sync::atomic::{AtomicU64, Ordering};
pub use crossbeam_epoch::{pin as cpin, Guard};

/// Hard ceiling on worker count (spec.md §5: "W <= 8").
pub const MAX_WORKERS: usize = 8;

/// Per-table RCU barrier. Each [`crate::sessiontable::SessionTable`]
/// owns one; there is no process-wide singleton (spec.md §9).
pub struct RcuEpoch {
    current_gen: AtomicU64,
    worker_seen: [AtomicU64; MAX_WORKERS],
}

impl RcuEpoch {
    pub fn new() -> Self {
        Self {
            current_gen: AtomicU64::new(0),
            worker_seen: [(); MAX_WORKERS].map(|_| AtomicU64::new(0)),
        }
    }

    /// Current generation, acquire-ordered (spec.md §5: workers read
    /// `current_gen` with acquire ordering on every operation).
    pub fn current(&self) -> u64 {
        self.current_gen.load(Ordering::Acquire)
    }

    /// Control-plane-only: advance the generation by one, release
    /// ordered, establishing happens-before with any worker that later
    /// acquire-loads it (`rcu_update`).
    pub fn publish(&self) -> u64 {
        self.current_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Worker-side: pin the epoch and record that `worker` has now
    /// observed the current generation (`rcu_load`). Returns the
    /// observed generation and the pin guard, which the caller should
    /// hold for the duration of the operation it is about to perform.
    pub fn observe(&self, worker: usize) -> (u64, Guard) {
        debug_assert!(worker < MAX_WORKERS);
        let guard = cpin();
        let gen = self.current();
        self.worker_seen[worker].store(gen, Ordering::Release);
        (gen, guard)
    }

    /// Control-plane-only: block until every one of `workers` worker
    /// slots has observed a generation `>= target`. `workers` must be
    /// `<= MAX_WORKERS` and match the data plane's actual worker count
    /// — slots beyond it are never written and would spin forever.
    pub fn quiesce(&self, target: u64, workers: usize) {
        debug_assert!(workers <= MAX_WORKERS);
        loop {
            let all_caught_up = self.worker_seen[..workers]
                .iter()
                .all(|seen| seen.load(Ordering::Acquire) >= target);
            if all_caught_up {
                return;
            }
            core::hint::spin_loop();
        }
    }
}

impl Default for RcuEpoch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn quiesce_waits_for_every_worker() {
        let rcu = Arc::new(RcuEpoch::new());
        let target = rcu.publish();

        let r2 = Arc::clone(&rcu);
        let handle = thread::spawn(move || {
            // simulate a worker that is slow to poll
            thread::sleep(std::time::Duration::from_millis(20));
            let (gen, _guard) = r2.observe(0);
            assert_eq!(gen, target);
        });

        rcu.quiesce(target, 1);
        handle.join().unwrap();
        assert!(rcu.worker_seen[0].load(Ordering::Acquire) >= target);
    }

    #[test]
    fn unused_slots_dont_block_quiesce() {
        let rcu = RcuEpoch::new();
        let target = rcu.publish();
        let (_gen, _guard) = rcu.observe(0);
        // only worker 0 is active; quiesce(target, 1) must return
        // without waiting on slots 1..MAX_WORKERS.
        rcu.quiesce(target, 1);
    }
}
