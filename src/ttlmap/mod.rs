/*
 * flowsession - concurrent TTL session map core
 *
 * `TtlMap`: a power-of-two array of [`Bucket`]s addressed by a 32-bit
 * hash, sliced across chunks sized to the allocator's block ceiling,
 * with chunk pointers stored as offsets so the map is valid when mapped
 * into multiple processes at different base addresses (spec.md §4.2).
 */

use crate::alloc::{Allocator, Offset};
use crate::bucket::{Bucket, Upsert, B};
use crate::error::{CoreError, CoreResult};
use crate::hash::city32_of;
use core::mem;

/// Small compile-time ceiling on the number of chunks a map can span.
const C_MAX: usize = 64;
/// Sentinel `buckets_log2` denoting the empty/unconstructed state.
const EMPTY_SENTINEL: u8 = u8::MAX;

fn floor_pow2(x: usize) -> usize {
    if x <= 1 {
        1
    } else {
        1usize << (usize::BITS - 1 - x.leading_zeros())
    }
}

/// Construction-time configuration. Not file/YAML-backed — config
/// loading from disk or a control-plane RPC is an excluded external
/// collaborator (spec.md §1); this is the narrow argument struct the
/// control plane passes in after parsing its own config.
#[derive(Clone, Copy, Debug)]
pub struct TtlMapConfig {
    pub initial_kv_entries: u64,
}

pub struct TtlMap<K, V, A> {
    alloc: A,
    chunk_offsets: [Offset<Bucket<K, V>>; C_MAX],
    chunk_bucket_counts: [usize; C_MAX],
    num_chunks: usize,
    buckets_per_chunk_log2: u8,
    buckets_log2: u8,
}

// SAFETY: every cross-thread access to bucket contents goes through
// `Bucket`'s embedded lock, so it is sound to share a `TtlMap` across
// threads as long as the key/value types themselves are `Send`. The
// map's own fields (`Offset`, plain integers, the allocator) carry no
// thread-affinity of their own.
unsafe impl<K: Send, V: Send, A: Send + Sync> Send for TtlMap<K, V, A> {}
unsafe impl<K: Send, V: Send, A: Send + Sync> Sync for TtlMap<K, V, A> {}

impl<K, V, A: Allocator> TtlMap<K, V, A>
where
    K: Copy + Eq + Default,
    V: Copy + Default,
{
    fn bucket_size_align() -> (usize, usize) {
        (mem::size_of::<Bucket<K, V>>(), mem::align_of::<Bucket<K, V>>())
    }

    fn buckets_per_chunk(&self) -> usize {
        let (bucket_size, _) = Self::bucket_size_align();
        floor_pow2((self.alloc.max_block_size() / bucket_size).max(1))
    }

    /// Builds an empty map sized for `config.initial_kv_entries`,
    /// rounding up to a power of two then dividing by `B` and ceiling
    /// to a power of two again (spec.md §4.2). Always heap-allocated
    /// (`Box`) and never moved afterward: the chunk table's offset
    /// pointers are relative to their own storage address, which must
    /// stay fixed for the lifetime of the map, mirroring the
    /// shared-memory deployment where the structure is never relocated
    /// after the control plane publishes it.
    pub fn new(config: TtlMapConfig, alloc: A) -> CoreResult<Box<Self>> {
        let mut boxed = Box::new(Self {
            alloc,
            chunk_offsets: core::array::from_fn(|_| Offset::empty()),
            chunk_bucket_counts: [0; C_MAX],
            num_chunks: 0,
            buckets_per_chunk_log2: 0,
            buckets_log2: EMPTY_SENTINEL,
        });
        boxed.init(config.initial_kv_entries)?;
        Ok(boxed)
    }

    fn init(&mut self, initial_kv_entries: u64) -> CoreResult<()> {
        let target_kv = initial_kv_entries.max(1).next_power_of_two();
        let raw_buckets = (target_kv / B as u64).max(1);
        let buckets = raw_buckets.next_power_of_two();
        let buckets_log2 = buckets.trailing_zeros() as u8;

        let buckets_per_chunk = self.buckets_per_chunk();
        let buckets_per_chunk_log2 = buckets_per_chunk.trailing_zeros() as u8;
        let num_chunks = (buckets as usize).div_ceil(buckets_per_chunk);
        if num_chunks > C_MAX {
            return Err(CoreError::invalid_config(format!(
                "{num_chunks} chunks required, exceeds C_MAX={C_MAX}"
            )));
        }

        let (bucket_size, bucket_align) = Self::bucket_size_align();
        let chunk_bytes = buckets_per_chunk * bucket_size;

        for i in 0..num_chunks {
            let Some(ptr) = self.alloc.balloc(chunk_bytes, bucket_align) else {
                self.free_chunks();
                self.buckets_log2 = EMPTY_SENTINEL;
                return Err(CoreError::allocation_failed(chunk_bytes));
            };
            for j in 0..buckets_per_chunk {
                // SAFETY: `ptr` is a fresh, uninitialized allocation of
                // at least `buckets_per_chunk` buckets; `j` is in
                // range.
                unsafe {
                    let slot = (ptr.as_ptr() as *mut Bucket<K, V>).add(j);
                    slot.write(Bucket::new_empty());
                }
            }
            self.chunk_offsets[i].set(ptr.as_ptr() as *mut Bucket<K, V>);
            self.chunk_bucket_counts[i] = buckets_per_chunk;
            self.num_chunks = i + 1;
        }

        self.buckets_log2 = buckets_log2;
        self.buckets_per_chunk_log2 = buckets_per_chunk_log2;
        Ok(())
    }

    fn free_chunks(&mut self) {
        let (bucket_size, bucket_align) = Self::bucket_size_align();
        let buckets_per_chunk = self.buckets_per_chunk();
        let chunk_bytes = buckets_per_chunk * bucket_size;
        for i in 0..self.num_chunks {
            if let Some(ptr) = self.chunk_offsets[i].resolve() {
                // SAFETY: this offset was produced by a prior
                // successful `balloc` of exactly `chunk_bytes` from
                // the same allocator.
                unsafe {
                    self.alloc.bfree(
                        core::ptr::NonNull::new_unchecked(ptr as *mut u8),
                        chunk_bytes,
                        bucket_align,
                    );
                }
                self.chunk_offsets[i].clear();
            }
        }
        self.num_chunks = 0;
    }

    fn is_empty_sentinel(&self) -> bool {
        self.buckets_log2 == EMPTY_SENTINEL
    }

    /// Total bucket count, a power of two, or `0` for the empty
    /// sentinel.
    pub fn buckets(&self) -> usize {
        if self.is_empty_sentinel() {
            0
        } else {
            1usize << self.buckets_log2
        }
    }

    /// `buckets * B`, or `0` for the empty sentinel (spec.md §8).
    pub fn capacity(&self) -> u64 {
        self.buckets() as u64 * B as u64
    }

    /// The allocator handle this map was built with, so a caller
    /// building a sibling map (`sessiontable::SessionTable::resize`)
    /// can reuse the same backing arena.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    fn addressing(&self, key: &K) -> (usize, usize, usize) {
        let hash = city32_of(key) as usize;
        let bucket_id = hash & (self.buckets() - 1);
        let chunk = bucket_id >> self.buckets_per_chunk_log2;
        let local = bucket_id & ((1usize << self.buckets_per_chunk_log2) - 1);
        let hint = (hash >> self.buckets_log2) & (B - 1);
        (chunk, local, hint)
    }

    /// # Safety
    /// Only valid when `!self.is_empty_sentinel()`; `chunk`/`local`
    /// must come from `addressing` against the same map.
    unsafe fn bucket_at(&self, chunk: usize, local: usize) -> &Bucket<K, V> {
        let base = self.chunk_offsets[chunk]
            .resolve()
            .expect("chunk slot must be populated on a constructed map");
        &*base.add(local)
    }

    /// Computes `hash = city_hash32(key)`, selects the bucket, and
    /// delegates to [`Bucket::lookup_copy`] (spec.md §4.2).
    pub fn lookup(&self, key: &K, now: u32) -> Option<(usize, V)> {
        if self.is_empty_sentinel() {
            return None;
        }
        let (chunk, local, hint) = self.addressing(key);
        // SAFETY: map is constructed, addressing came from `self`.
        unsafe { self.bucket_at(chunk, local) }.lookup_copy(key, hint, now)
    }

    /// Same addressing as `lookup`; delegates to
    /// [`Bucket::get_or_insert`]. The caller receives a live value
    /// reference and the bucket lock bundled in the returned guard;
    /// `release`/drop it when done (spec.md §4.2).
    pub fn get(&self, key: K, now: u32, timeout: u32) -> Upsert<'_, K, V> {
        if self.is_empty_sentinel() {
            return Upsert::Failed;
        }
        let (chunk, local, hint) = self.addressing(&key);
        // SAFETY: map is constructed, addressing came from `self`.
        unsafe { self.bucket_at(chunk, local) }.get_or_insert(key, hint, now, timeout)
    }

    /// Visits every bucket in ascending index order (spec.md §4.2).
    pub fn iter<F: FnMut(&K, &V, u32) -> bool>(&self, now: u32, mut callback: F) -> bool {
        if self.is_empty_sentinel() {
            return false;
        }
        let buckets_per_chunk = 1usize << self.buckets_per_chunk_log2;
        'outer: for chunk in 0..self.num_chunks {
            for local in 0..buckets_per_chunk.min(self.chunk_bucket_counts[chunk]) {
                let bucket_id = (chunk << self.buckets_per_chunk_log2) + local;
                if bucket_id >= self.buckets() {
                    break 'outer;
                }
                // SAFETY: map is constructed, (chunk, local) is in range.
                if unsafe { self.bucket_at(chunk, local) }.iter(now, &mut callback) {
                    return true;
                }
            }
        }
        false
    }
}

impl<K, V, A> Drop for TtlMap<K, V, A>
where
    K: Copy + Eq + Default,
    V: Copy + Default,
    A: Allocator,
{
    fn drop(&mut self) {
        self.free_chunks();
    }
}
