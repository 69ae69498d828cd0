/*
 * flowsession - concurrent TTL session map core
 *
 * identifier-indexed registries (spec.md §4.4): a dense, block-grown
 * array of state plus a separately-chained hash index over a composite
 * identifier. Control-plane-only and mutation-heavy, unlike `ttlmap`'s
 * swiss-style open addressing, so separate chaining is the right
 * tradeoff here — a bucket miss costs one hash, not a B-slot scan.
 */

mod ident;

pub use ident::{RealIdentifier, RealServerState, ServiceIdentifier, ServiceState};

use crate::alloc::Offset;
use crate::hash::city32_of;
use parking_lot::Mutex;

/// Entries per growth block (spec.md §2: "up to 4096 entries per
/// block"). Existing entries never move when the array grows, so a
/// `&mut T` returned from `find_or_insert` stays valid even as later
/// inserts land in a new block.
const BLOCK_SIZE: usize = 4096;

/// Append-only, block-grown dense array. Entries are addressed by a
/// stable `u64` index for the lifetime of the registry.
pub struct DenseRegistry<T> {
    blocks: Vec<Box<[T; BLOCK_SIZE]>>,
    len: usize,
}

impl<T: Copy + Default> DenseRegistry<T> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a zero-valued entry and returns its dense index.
    pub fn push(&mut self) -> u64 {
        let block = self.len / BLOCK_SIZE;
        let slot = self.len % BLOCK_SIZE;
        if block == self.blocks.len() {
            self.blocks.push(Box::new([T::default(); BLOCK_SIZE]));
        }
        debug_assert!(slot < BLOCK_SIZE);
        let idx = self.len as u64;
        self.len += 1;
        idx
    }

    /// Drops the most recently pushed entry. Used to roll an insert
    /// back when the paired hash-index insert fails (spec.md §4.4:
    /// "on failure the dense array is rolled back").
    pub fn pop(&mut self) {
        debug_assert!(self.len > 0);
        self.len -= 1;
    }

    pub fn get(&self, idx: u64) -> &T {
        let idx = idx as usize;
        &self.blocks[idx / BLOCK_SIZE][idx % BLOCK_SIZE]
    }

    pub fn get_mut(&mut self, idx: u64) -> &mut T {
        let idx = idx as usize;
        &mut self.blocks[idx / BLOCK_SIZE][idx % BLOCK_SIZE]
    }
}

impl<T: Copy + Default> Default for DenseRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

const INITIAL_BUCKETS: usize = 16;
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

struct IndexNode<Id> {
    id: Id,
    dense_idx: u64,
    next: Offset<IndexNode<Id>>,
}

/// Open-hashing, separately-chained index from a composite identifier
/// to a dense array slot. Bucket heads and chain `next` pointers are
/// offset-encoded (spec.md §4.4), matching `ttlmap`'s chunk table; this
/// is sound here because every node is individually boxed and never
/// moves once inserted, and the bucket array itself is only ever
/// replaced wholesale (on a load-factor rehash), never grown in place.
pub struct IdentIndex<Id> {
    buckets: Box<[Offset<IndexNode<Id>>]>,
    nodes: Vec<Box<IndexNode<Id>>>,
}

impl<Id: Copy + PartialEq> IdentIndex<Id> {
    pub fn new() -> Self {
        Self {
            buckets: (0..INITIAL_BUCKETS)
                .map(|_| Offset::empty())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            nodes: Vec::new(),
        }
    }

    fn bucket_of(&self, id: &Id) -> usize {
        city32_of(id) as usize & (self.buckets.len() - 1)
    }

    /// Walks the chain at `id`'s bucket; `None` on a miss.
    pub fn lookup(&self, id: &Id) -> Option<u64> {
        let mut cur = self.buckets[self.bucket_of(id)].resolve();
        while let Some(ptr) = cur {
            // SAFETY: every non-empty offset in a bucket head or a
            // node's `next` field was produced by `set` against a live
            // node in `self.nodes`, which never relocates once pushed.
            let node = unsafe { &*ptr };
            if node.id == *id {
                return Some(node.dense_idx);
            }
            cur = node.next.resolve();
        }
        None
    }

    /// Inserts `id -> dense_idx`, rehashing first if the load factor
    /// threshold would be crossed. Caller must not insert an `id`
    /// already present; `find_or_insert` checks that itself.
    fn insert(&mut self, id: Id, dense_idx: u64) {
        if (self.nodes.len() + 1) * LOAD_FACTOR_DEN > self.buckets.len() * LOAD_FACTOR_NUM {
            self.rehash(self.buckets.len() * 2);
        }
        let bucket = self.bucket_of(&id);
        let mut node = Box::new(IndexNode {
            id,
            dense_idx,
            next: Offset::empty(),
        });
        let node_ptr: *mut IndexNode<Id> = &mut *node;
        if let Some(head) = self.buckets[bucket].resolve() {
            node.next.set(head);
        }
        self.buckets[bucket].set(node_ptr);
        self.nodes.push(node);
    }

    fn rehash(&mut self, new_bucket_count: usize) {
        let mut new_buckets: Vec<Offset<IndexNode<Id>>> =
            (0..new_bucket_count).map(|_| Offset::empty()).collect();
        for node in &mut self.nodes {
            node.next.clear();
        }
        // re-chain every existing node into the fresh bucket array;
        // node storage itself never moves, so this only rewrites
        // offsets, never node contents.
        let ids_and_ptrs: Vec<(usize, *mut IndexNode<Id>)> = self
            .nodes
            .iter_mut()
            .map(|n| {
                let bucket = city32_of(&n.id) as usize & (new_bucket_count - 1);
                (bucket, &mut **n as *mut IndexNode<Id>)
            })
            .collect();
        for (bucket, ptr) in ids_and_ptrs {
            if let Some(head) = new_buckets[bucket].resolve() {
                // SAFETY: `ptr` is one of `self.nodes`'s boxed entries,
                // still live and not aliased mutably elsewhere here.
                unsafe { (*ptr).next.set(head) };
            }
            new_buckets[bucket].set(ptr);
        }
        self.buckets = new_buckets.into_boxed_slice();
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }
}

impl<Id: Copy + PartialEq> Default for IdentIndex<Id> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense state plus identifier index, behind one control-plane mutex
/// (spec.md §5: "protected by a single control-plane mutex during
/// mutation; workers read them only after the data plane's global RCU
/// barrier has been crossed").
pub struct Registry<Id, T> {
    inner: Mutex<RegistryInner<Id, T>>,
}

struct RegistryInner<Id, T> {
    dense: DenseRegistry<T>,
    index: IdentIndex<Id>,
}

/// The `(slot: ServiceState&, idx: u64)` pair spec.md §4.4's
/// `find_or_insert` returns, held together as one guard over the
/// registry's control-plane mutex — the same RAII rendering
/// `bucket::BucketGuard` uses in place of a raw value pointer plus a
/// separately acquired lock, so a caller can write the freshly
/// found/inserted slot's state without a second lock-acquiring call.
pub struct RegistryGuard<'a, Id, T> {
    guard: parking_lot::MutexGuard<'a, RegistryInner<Id, T>>,
    idx: u64,
}

impl<'a, Id, T: Copy + Default> RegistryGuard<'a, Id, T> {
    pub fn idx(&self) -> u64 {
        self.idx
    }
    pub fn value(&self) -> &T {
        self.guard.dense.get(self.idx)
    }
    pub fn value_mut(&mut self) -> &mut T {
        self.guard.dense.get_mut(self.idx)
    }
}

impl<Id, T> Registry<Id, T>
where
    Id: Copy + PartialEq,
    T: Copy + Default,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                dense: DenseRegistry::new(),
                index: IdentIndex::new(),
            }),
        }
    }

    /// Returns the slot and dense index for `id`, inserting a
    /// zero-valued entry if absent (spec.md §4.4). Idempotent: a second
    /// call with the same `id` returns the same index without mutating
    /// state. The returned guard holds the control-plane mutex, so the
    /// caller can populate a freshly inserted slot in the same critical
    /// section that found or created it.
    pub fn find_or_insert(&self, id: Id) -> RegistryGuard<'_, Id, T> {
        let mut guard = self.inner.lock();
        let idx = match guard.index.lookup(&id) {
            Some(idx) => idx,
            None => {
                let idx = guard.dense.push();
                guard.index.insert(id, idx);
                idx
            }
        };
        RegistryGuard { guard, idx }
    }

    pub fn lookup_by_id(&self, id: &Id) -> Option<usize> {
        self.inner.lock().index.lookup(id).map(|idx| idx as usize)
    }

    /// Applies `f` to the state at `idx` under the control-plane lock.
    /// Workers call this only after crossing the data plane's RCU
    /// barrier, at which point the registries are immutable from their
    /// point of view (spec.md §5), so no further synchronization is
    /// required on the read side beyond this lock.
    pub fn lookup<R>(&self, idx: usize, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock();
        f(guard.dense.get(idx as u64))
    }

    pub fn with_mut<R>(&self, idx: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(guard.dense.get_mut(idx as u64))
    }

    pub fn size(&self) -> usize {
        self.inner.lock().dense.len()
    }
}

impl<Id, T> Default for Registry<Id, T>
where
    Id: Copy + PartialEq,
    T: Copy + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

pub type ServiceRegistry = Registry<ServiceIdentifier, ServiceState>;
pub type RealServerRegistry = Registry<RealIdentifier, RealServerState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_registry_blocks_grow_without_moving_existing_entries() {
        let mut d: DenseRegistry<u64> = DenseRegistry::new();
        let first = d.push();
        *d.get_mut(first) = 0xAAAA;
        let first_ptr: *const u64 = d.get(first);
        for _ in 0..(BLOCK_SIZE * 2) {
            d.push();
        }
        assert_eq!(*d.get(first), 0xAAAA);
        assert_eq!(d.get(first) as *const u64, first_ptr);
    }

    #[test]
    fn ident_index_survives_a_rehash() {
        let mut idx: IdentIndex<u64> = IdentIndex::new();
        for k in 0..100u64 {
            idx.insert(k, k);
        }
        assert_eq!(idx.size(), 100);
        for k in 0..100u64 {
            assert_eq!(idx.lookup(&k), Some(k));
        }
    }

    #[test]
    fn find_or_insert_is_idempotent() {
        let reg: Registry<u64, u64> = Registry::new();
        let a = reg.find_or_insert(7).idx();
        let b = reg.find_or_insert(7).idx();
        assert_eq!(a, b);
        assert_eq!(reg.size(), 1);

        for k in 0..50u64 {
            reg.find_or_insert(k);
        }
        assert_eq!(reg.size(), 50);
        for k in 0..50u64 {
            assert_eq!(reg.lookup_by_id(&k), Some(k as usize));
        }
    }

    #[test]
    fn find_or_insert_guard_writes_the_slot_it_just_found() {
        let reg: Registry<u64, u64> = Registry::new();
        let idx = {
            let mut slot = reg.find_or_insert(42);
            assert_eq!(*slot.value(), 0);
            *slot.value_mut() = 9000;
            slot.idx()
        };
        reg.lookup(idx as usize, |v| {
            assert_eq!(*v, 9000);
        });
    }
}
