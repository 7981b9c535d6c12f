use crate::{Config, Error};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    alloc::{alloc, dealloc, Layout},
    ops::Range,
    ptr::NonNull,
};
use tracing::{debug, trace};

/// Byte pattern written over a frame when it is freed.
pub const FREED_PATTERN: u8 = 0x01;

/// Byte pattern written over a frame when it is allocated (debug builds only).
pub const ALLOCATED_PATTERN: u8 = 0x05;

/// Returns the system page size.
///
/// On Unix systems, queries the actual page size via `sysconf`.
/// On other systems (Windows), defaults to 4KB.
#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096 // Safe fallback if sysconf fails
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
pub(crate) fn page_size() -> usize {
    4096
}

/// Label for frame pool metrics, identifying the shard.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ShardLabel {
    shard: u64,
}

/// Metrics for the frame pool.
struct Metrics {
    /// Number of frames currently on each shard's freelist.
    free: Family<ShardLabel, Gauge>,
    /// Total number of successful allocations.
    allocations_total: Counter,
    /// Total number of allocations satisfied from a foreign shard.
    borrowed_total: Counter,
    /// Total number of frames freed.
    freed_total: Counter,
    /// Total number of failed allocations (every shard empty).
    exhausted_total: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            free: Family::default(),
            allocations_total: Counter::default(),
            borrowed_total: Counter::default(),
            freed_total: Counter::default(),
            exhausted_total: Counter::default(),
        };

        registry.register(
            "frame_pool_free",
            "Number of frames currently on each shard's freelist",
            metrics.free.clone(),
        );
        registry.register(
            "frame_pool_allocations",
            "Total number of successful frame allocations",
            metrics.allocations_total.clone(),
        );
        registry.register(
            "frame_pool_borrowed",
            "Total number of allocations satisfied from a foreign shard",
            metrics.borrowed_total.clone(),
        );
        registry.register(
            "frame_pool_freed",
            "Total number of frames freed",
            metrics.freed_total.clone(),
        );
        registry.register(
            "frame_pool_exhausted",
            "Total number of failed allocations due to every shard being empty",
            metrics.exhausted_total.clone(),
        );

        metrics
    }
}

/// The managed memory range.
///
/// One aligned allocation covering every frame the pool hands out.
/// Deallocates itself on drop using the stored layout.
struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Region owns its memory and can be sent between threads.
unsafe impl Send for Region {}
// SAFETY: access to the memory behind `ptr` is arbitrated by the pool's
// ownership rules, not by Region itself.
unsafe impl Sync for Region {}

impl Region {
    /// Allocates a new region with the given size and alignment.
    ///
    /// # Panics
    ///
    /// Panics if allocation fails or alignment is not a power of two.
    fn new(size: usize, alignment: usize) -> Self {
        let layout = Layout::from_size_align(size, alignment).expect("invalid layout");

        // SAFETY: Layout is valid (non-zero size, power-of-two alignment).
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failed");

        Self { ptr, layout }
    }

    #[inline]
    const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A pool of fixed-size page frames partitioned into per-core shards.
///
/// See the [crate] documentation for allocation, borrowing, and scrubbing
/// semantics.
pub struct FramePool {
    /// First address of the managed range. Always `page_size`-aligned.
    base: usize,
    /// First address past the managed range.
    limit: usize,
    page_size: usize,
    /// Per-shard freelists of frame addresses.
    ///
    /// # Invariants
    ///
    /// Every address on a freelist is `page_size`-aligned and inside
    /// `base..limit`, and appears on at most one freelist.
    shards: Box<[Mutex<Vec<usize>>]>,
    /// Backing memory for `base..limit`. Held only for its allocation
    /// lifetime; all access goes through frame addresses.
    _region: Region,
    metrics: Metrics,
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("base", &self.base)
            .field("limit", &self.limit)
            .field("page_size", &self.page_size)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl FramePool {
    /// Creates a new frame pool with the given configuration.
    ///
    /// The managed range is partitioned into `config.shards` equal contiguous
    /// sub-ranges (the last also receives any remainder), and every frame is
    /// scrubbed and pushed onto its sub-range's freelist.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid or the region cannot be
    /// allocated.
    pub fn new(config: Config, registry: &mut Registry) -> Self {
        config.validate();

        let page_size = config.page_size.get();
        let pages = config.pages.get();
        let shards = config.shards.get();
        let size = pages
            .checked_mul(page_size)
            .expect("managed range size overflows usize");

        let region = Region::new(size, page_size);
        let base = region.as_ptr() as usize;
        let limit = base + size;
        let metrics = Metrics::new(registry);

        // Distribute equal contiguous runs of frames, remainder to the last
        // shard.
        let per_shard = pages / shards;
        let mut freelists = Vec::with_capacity(shards);
        for shard in 0..shards {
            let start = shard * per_shard;
            let end = if shard == shards - 1 {
                pages
            } else {
                start + per_shard
            };
            let mut freelist = Vec::with_capacity(end - start);
            for page in start..end {
                let addr = base + page * page_size;
                // SAFETY: addr..addr+page_size is inside the freshly allocated
                // region and nothing else references it yet.
                unsafe { std::ptr::write_bytes(addr as *mut u8, FREED_PATTERN, page_size) };
                freelist.push(addr);
            }
            metrics
                .free
                .get_or_create(&ShardLabel {
                    shard: shard as u64,
                })
                .set(freelist.len() as i64);
            freelists.push(Mutex::new(freelist));
        }

        Self {
            base,
            limit,
            page_size,
            shards: freelists.into_boxed_slice(),
            _region: region,
            metrics,
        }
    }

    /// Returns the frame size in bytes.
    #[inline]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the managed address range.
    #[inline]
    pub const fn managed_range(&self) -> Range<usize> {
        self.base..self.limit
    }

    /// Returns the number of shards.
    #[inline]
    pub const fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Allocates one frame on behalf of `core`, preferring the core's own
    /// shard and borrowing from the others if it is empty.
    ///
    /// The returned address is `page_size`-aligned, inside the managed range,
    /// and exclusively owned by the caller until passed back to
    /// [Self::free]. In debug builds the frame is filled with
    /// [ALLOCATED_PATTERN].
    ///
    /// # Errors
    ///
    /// - [Error::Exhausted]: every shard's freelist is empty
    pub fn allocate(&self, core: usize) -> Result<usize, Error> {
        let home = core % self.shards.len();
        if let Some(addr) = self.pop(home) {
            return Ok(self.hand_out(addr));
        }

        // The home shard is empty: borrow from the other shards in a fixed
        // order.
        for shard in 0..self.shards.len() {
            if shard == home {
                continue;
            }
            let Some(addr) = self.pop(shard) else {
                continue;
            };
            trace!(core, shard, "borrowed frame from foreign shard");
            self.metrics.borrowed_total.inc();
            return Ok(self.hand_out(addr));
        }

        debug!(core, "frame pool exhausted");
        self.metrics.exhausted_total.inc();
        Err(Error::Exhausted)
    }

    /// Frees a frame previously returned by [Self::allocate], pushing it onto
    /// the *current* core's shard (not necessarily the shard it was drawn
    /// from). The frame is scrubbed with [FREED_PATTERN] before it becomes
    /// allocatable again.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not `page_size`-aligned or lies outside the managed
    /// range; both indicate a caller bug, never a recoverable condition.
    pub fn free(&self, core: usize, addr: usize) {
        assert!(
            addr.is_multiple_of(self.page_size),
            "freed frame is not page aligned: {addr:#x}"
        );
        assert!(
            addr >= self.base && addr < self.limit,
            "freed frame outside managed range: {addr:#x}"
        );

        // SAFETY: the caller owned addr until this call; it is not yet on any
        // freelist.
        unsafe { std::ptr::write_bytes(addr as *mut u8, FREED_PATTERN, self.page_size) };

        let shard = core % self.shards.len();
        self.shards[shard].lock().push(addr);
        self.metrics.freed_total.inc();
        self.metrics
            .free
            .get_or_create(&ShardLabel {
                shard: shard as u64,
            })
            .inc();
    }

    /// Returns the memory of an allocated frame.
    ///
    /// # Safety
    ///
    /// `addr` must have been returned by [Self::allocate] on this pool and not
    /// yet freed, and the caller must not hold any other reference to the same
    /// frame. Frames are disjoint, so references to different frames may
    /// coexist.
    pub unsafe fn frame_mut(&self, addr: usize) -> &mut [u8] {
        debug_assert!(addr.is_multiple_of(self.page_size));
        debug_assert!(addr >= self.base && addr < self.limit);
        // SAFETY: per the contract above, the caller exclusively owns
        // addr..addr+page_size.
        unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, self.page_size) }
    }

    /// Pops one frame address from `shard`'s freelist.
    fn pop(&self, shard: usize) -> Option<usize> {
        let addr = self.shards[shard].lock().pop()?;
        self.metrics
            .free
            .get_or_create(&ShardLabel {
                shard: shard as u64,
            })
            .dec();
        Some(addr)
    }

    /// Final bookkeeping for a frame leaving the pool.
    fn hand_out(&self, addr: usize) -> usize {
        if cfg!(debug_assertions) {
            // SAFETY: addr was just popped from a freelist, so nothing else
            // owns it.
            unsafe { std::ptr::write_bytes(addr as *mut u8, ALLOCATED_PATTERN, self.page_size) };
        }
        self.metrics.allocations_total.inc();
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, num::NonZeroUsize};
    use test_case::test_case;

    const PAGE: usize = 4096;

    fn nz(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    fn test_pool(pages: usize, shards: usize) -> FramePool {
        let config = Config {
            page_size: nz(PAGE),
            pages: nz(pages),
            shards: nz(shards),
        };
        FramePool::new(config, &mut Registry::default())
    }

    #[test]
    fn test_page_size() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_host_config() {
        let config = Config::host(nz(8), nz(2));
        assert_eq!(config.page_size.get(), page_size());
        config.validate();
    }

    #[test]
    #[should_panic(expected = "page_size must be a power of two")]
    fn test_invalid_page_size() {
        let config = Config {
            page_size: nz(3000),
            pages: nz(8),
            shards: nz(2),
        };
        FramePool::new(config, &mut Registry::default());
    }

    #[test_case(1; "one shard")]
    #[test_case(2; "two shards")]
    #[test_case(3; "three shards")]
    #[test_case(8; "shard per page")]
    fn test_drain_unique_aligned(shards: usize) {
        let pool = test_pool(8, shards);
        let range = pool.managed_range();

        let mut seen = HashSet::new();
        for _ in 0..8 {
            let addr = pool.allocate(0).unwrap();
            assert!(addr.is_multiple_of(PAGE));
            assert!(range.contains(&addr));
            assert!(seen.insert(addr), "duplicate frame {addr:#x}");
        }
        assert!(matches!(pool.allocate(0), Err(Error::Exhausted)));
    }

    #[test]
    fn test_borrow_from_foreign_shard() {
        // Two shards with two frames each. A thread on core 0 drains its own
        // shard, then borrows both of shard 1's frames.
        let pool = test_pool(4, 2);

        pool.allocate(0).unwrap();
        pool.allocate(0).unwrap();
        assert_eq!(pool.metrics.borrowed_total.get(), 0);

        pool.allocate(0).unwrap();
        pool.allocate(0).unwrap();
        assert_eq!(pool.metrics.borrowed_total.get(), 2);

        assert!(matches!(pool.allocate(0), Err(Error::Exhausted)));
        assert_eq!(pool.metrics.exhausted_total.get(), 1);
    }

    #[test]
    fn test_free_to_current_shard() {
        // One frame per shard. After core 1 frees a frame that core 0
        // allocated, the frame belongs to shard 1.
        let pool = test_pool(2, 2);

        let a = pool.allocate(0).unwrap();
        let b = pool.allocate(1).unwrap();
        assert_ne!(a, b);

        pool.free(1, a);
        assert_eq!(pool.allocate(1).unwrap(), a);

        // Shard 0 is still empty: core 0 must borrow.
        pool.free(1, b);
        assert_eq!(pool.allocate(0).unwrap(), b);
        assert_eq!(pool.metrics.borrowed_total.get(), 1);
    }

    #[test]
    fn test_scrub_patterns() {
        let pool = test_pool(2, 1);
        let addr = pool.allocate(0).unwrap();

        if cfg!(debug_assertions) {
            // SAFETY: addr is allocated and unaliased.
            let frame = unsafe { pool.frame_mut(addr) };
            assert!(frame.iter().all(|&b| b == ALLOCATED_PATTERN));
        }

        // SAFETY: addr is allocated and unaliased.
        unsafe { pool.frame_mut(addr).fill(0xAB) };
        pool.free(0, addr);

        // The freed frame must no longer hold caller data.
        // SAFETY: nothing else references the frame; the pool only scrubs it
        // again once it is reallocated.
        let frame = unsafe { pool.frame_mut(addr) };
        assert!(frame.iter().all(|&b| b == FREED_PATTERN));
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn test_free_misaligned() {
        let pool = test_pool(2, 1);
        let addr = pool.allocate(0).unwrap();
        pool.free(0, addr + 1);
    }

    #[test]
    #[should_panic(expected = "outside managed range")]
    fn test_free_out_of_range() {
        let pool = test_pool(2, 1);
        pool.free(0, pool.managed_range().end);
    }

    #[test]
    fn test_remainder_goes_to_last_shard() {
        // 7 frames over 3 shards: 2 + 2 + 3.
        let pool = test_pool(7, 3);
        for (shard, expected) in [(0, 2), (1, 2), (2, 3)] {
            assert_eq!(pool.shards[shard].lock().len(), expected);
        }
    }

    #[test]
    fn test_metrics_encoded() {
        let mut registry = Registry::default();
        let config = Config {
            page_size: nz(PAGE),
            pages: nz(4),
            shards: nz(2),
        };
        let pool = FramePool::new(config, &mut registry);
        pool.allocate(0).unwrap();

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("frame_pool_free"));
        assert!(buffer.contains("frame_pool_allocations"));
    }

    #[test]
    fn test_concurrent_allocate_free() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let pool = test_pool(16, 4);
        let outstanding = Mutex::new(HashSet::new());

        std::thread::scope(|s| {
            for core in 0..4 {
                let pool = &pool;
                let outstanding = &outstanding;
                s.spawn(move || {
                    let mut held = Vec::new();
                    for round in 0..200 {
                        match pool.allocate(core) {
                            Ok(addr) => {
                                assert!(
                                    outstanding.lock().insert(addr),
                                    "frame {addr:#x} allocated twice"
                                );
                                held.push(addr);
                            }
                            Err(Error::Exhausted) => {}
                        }
                        if round % 3 == 0 {
                            if let Some(addr) = held.pop() {
                                assert!(outstanding.lock().remove(&addr));
                                pool.free(core, addr);
                            }
                        }
                    }
                    for addr in held {
                        assert!(outstanding.lock().remove(&addr));
                        pool.free(core, addr);
                    }
                });
            }
        });

        assert!(outstanding.lock().is_empty());
        assert_eq!(
            pool.metrics.allocations_total.get(),
            pool.metrics.freed_total.get()
        );

        // Every frame is back on some freelist.
        let free: usize = (0..pool.shards()).map(|s| pool.shards[s].lock().len()).sum();
        assert_eq!(free, 16);
    }
}
