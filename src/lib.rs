/*
 * flowsession - concurrent TTL session map core
 *
 * A lock-striped, TTL-keyed concurrent hash map (`ttlmap::TtlMap`) and
 * the generation-swapped session table built on top of it
 * (`sessiontable::SessionTable`), together with the identifier-indexed
 * registries (`registry`) a software load balancer's data plane uses
 * to track per-flow state and the service/real-server topology that
 * flows are matched against. The allocator this crate reads memory
 * through (`alloc::Allocator`) is an external collaborator supplied by
 * the embedding process; this crate never opens a socket, parses a
 * config file, or spawns a thread. Time is read the same way every
 * operation's contract says it is: every call that needs "now" takes
 * it as a plain `u32` seconds-since-epoch argument, so the embedding
 * process's own clock — whatever it is — never needs a trait of its
 * own here.
 */

pub mod alloc;
pub mod bucket;
pub mod error;
pub mod hash;
pub mod registry;
pub mod sessiontable;
pub mod sync;
#[cfg(test)]
mod testutil;
pub mod ttlmap;

pub use alloc::{Allocator, HeapAllocator, Offset};
pub use bucket::{Bucket, BucketGuard, Status, Upsert};
pub use error::{CoreError, CoreResult};
pub use sessiontable::{SessionTable, SessionTableStats};
pub use ttlmap::{TtlMap, TtlMapConfig};
