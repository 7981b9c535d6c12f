//! Allocate fixed-size page frames from per-core shards of a managed memory range.
//!
//! A [FramePool] owns one contiguous, page-aligned memory region and hands out
//! exclusive ownership of individual frames within it. The free frames are split
//! across per-core shards, each guarded by its own lock, so cores allocating
//! concurrently do not contend on a single global freelist.
//!
//! # Shard Borrowing
//!
//! [FramePool::allocate] pops from the calling core's shard. If that shard is
//! empty, it scans every other shard in a fixed order and pops from the first
//! non-empty one, trading locality for availability: a core never fails to
//! allocate merely because its own shard happens to be empty while others have
//! frames. Only when every shard is empty does allocation return
//! [Error::Exhausted], which callers may retry or propagate.
//!
//! [FramePool::free] pushes the frame onto the *current* core's shard, not
//! necessarily the shard it was drawn from, so frames migrate toward the cores
//! that use them.
//!
//! # Ownership
//!
//! A frame address is owned either by exactly one shard's freelist or by the
//! caller that allocated it, never both. Freeing an address that is misaligned
//! or outside the managed range is a caller bug and panics (the library analog
//! of a kernel fatal abort); exhaustion, by contrast, is a recoverable result.
//!
//! # Scrubbing
//!
//! Freed frames are overwritten with [FREED_PATTERN]. In debug builds,
//! allocated frames are additionally filled with [ALLOCATED_PATTERN] before
//! being returned, so reads of stale or dangling frame contents surface as
//! recognizable junk rather than plausible data.
//!
//! # Example
//!
//! ```rust
//! use kestrel_frame::{Config, FramePool};
//! use prometheus_client::registry::Registry;
//! use std::num::NonZeroUsize;
//!
//! let mut registry = Registry::default();
//! let config = Config {
//!     page_size: NonZeroUsize::new(4096).unwrap(),
//!     pages: NonZeroUsize::new(16).unwrap(),
//!     shards: NonZeroUsize::new(4).unwrap(),
//! };
//! let pool = FramePool::new(config, &mut registry);
//!
//! // Allocate a frame on behalf of core 0 and write through it.
//! let addr = pool.allocate(0).unwrap();
//! // SAFETY: addr was just allocated and has not been freed.
//! unsafe { pool.frame_mut(addr)[0] = 42 };
//! pool.free(0, addr);
//! ```

use std::num::NonZeroUsize;
use thiserror::Error;

mod pool;
pub use pool::{FramePool, ALLOCATED_PATTERN, FREED_PATTERN};

/// Errors that can occur when allocating from a [FramePool].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Every shard's freelist is empty.
    #[error("all shards exhausted")]
    Exhausted,
}

/// Configuration for a [FramePool].
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of each frame in bytes. Must be a power of two.
    pub page_size: NonZeroUsize,

    /// Total number of frames in the managed range.
    pub pages: NonZeroUsize,

    /// Number of per-core shards the frames are partitioned into.
    ///
    /// Each shard receives an equal contiguous sub-range of the managed range
    /// (the last shard also receives any remainder). A shard count larger than
    /// the page count leaves the excess shards initially empty.
    pub shards: NonZeroUsize,
}

impl Config {
    /// Preset using the host page size.
    pub fn host(pages: NonZeroUsize, shards: NonZeroUsize) -> Self {
        Self {
            page_size: NonZeroUsize::new(pool::page_size()).expect("page size is nonzero"),
            pages,
            shards,
        }
    }

    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `page_size` is not a power of two
    pub(crate) fn validate(&self) {
        assert!(
            self.page_size.is_power_of_two(),
            "page_size must be a power of two"
        );
    }
}
