//! Cache fixed-size device blocks in a sharded, fixed-capacity buffer pool.
//!
//! A [BufferCache] owns a fixed arena of buffer slots, each holding one cached
//! copy of a `(device, block)` pair from a [BackingStore]. Slots are never
//! allocated or destroyed after startup, only recycled: admitting a new key
//! evicts the stalest unreferenced buffer and rewrites its identity in place.
//!
//! # Sharding
//!
//! Buffer metadata lives in hash buckets keyed by block number, each guarded
//! by its own lock, so cache hits on different buckets never contend. A single
//! coordinator lock serializes the admit path (eviction and cross-bucket
//! victim migration) cache-wide, so two threads can never select and relocate
//! the same victim. Hits never touch the coordinator lock.
//!
//! # Lock Order
//!
//! Three lock tiers exist, and they are always acquired in this order:
//!
//! 1. the coordinator lock (admit path only);
//! 2. bucket locks (only the coordinator holder may hold two at once);
//! 3. the per-buffer blocking lock, never acquired while a coordinator or
//!    bucket lock is held (victim repurposing uses a `try_lock` that cannot
//!    block).
//!
//! Bucket, coordinator, and shard locks are short-hold: no thread blocks while
//! holding one. Waiting for another thread's buffer is the only blocking
//! point, and it happens with no other lock held.
//!
//! # Eviction
//!
//! Each release of an unreferenced buffer stamps it with a monotone logical
//! clock. Victim selection is purely timestamp-based: the unreferenced buffer
//! with the smallest stamp in the home bucket, then (round robin) in the first
//! other bucket holding any candidate. Buffers with a nonzero refcount are
//! never evicted. If no bucket holds an evictable buffer the cache panics:
//! unlike allocator exhaustion, cache exhaustion signals that every buffer is
//! simultaneously referenced, which this design treats as unrecoverable.
//!
//! # Example
//!
//! ```rust
//! use kestrel_cache::{BackingStore, BufferCache, Config};
//! use prometheus_client::registry::Registry;
//! use std::num::NonZeroUsize;
//!
//! struct ZeroStore;
//!
//! impl BackingStore for ZeroStore {
//!     fn load(&self, _dev: u32, _block: u64, data: &mut [u8]) {
//!         data.fill(0);
//!     }
//!     fn store(&self, _dev: u32, _block: u64, _data: &[u8]) {}
//! }
//!
//! let mut registry = Registry::default();
//! let config = Config {
//!     buffers: NonZeroUsize::new(30).unwrap(),
//!     buckets: NonZeroUsize::new(13).unwrap(),
//!     block_size: NonZeroUsize::new(1024).unwrap(),
//! };
//! let cache = BufferCache::new(ZeroStore, config, &mut registry);
//!
//! // Read block 7 of device 1, mutate it, and persist it.
//! let mut buf = cache.read(1, 7);
//! buf.as_mut()[0] = 42;
//! buf.write();
//! drop(buf); // releases the buffer for reuse
//! ```

use std::num::NonZeroUsize;

mod storage;
pub use storage::{BufferCache, BufferGuard, PinnedBlock};

/// Synchronous block transfer used by [BufferCache] to materialize and persist
/// buffer contents.
///
/// Both operations block until the transfer completes and are assumed to
/// always succeed; the cache performs no retries and models no I/O failures.
/// They are only ever invoked while the calling thread holds the buffer's
/// blocking lock.
pub trait BackingStore: Send + Sync {
    /// Fills `data` with the contents of `block` on device `dev`.
    fn load(&self, dev: u32, block: u64, data: &mut [u8]);

    /// Persists `data` as the contents of `block` on device `dev`.
    fn store(&self, dev: u32, block: u64, data: &[u8]);
}

/// Configuration for a [BufferCache].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of buffer slots in the pool.
    pub buffers: NonZeroUsize,

    /// Number of hash buckets the slots are partitioned into.
    pub buckets: NonZeroUsize,

    /// Size of each cached block in bytes.
    pub block_size: NonZeroUsize,
}
