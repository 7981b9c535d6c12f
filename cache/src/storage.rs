use crate::{BackingStore, Config};
use parking_lot::{Mutex, MutexGuard};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    mem::ManuallyDrop,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, trace};

/// Metrics for the buffer cache.
pub(crate) struct Metrics {
    /// Total acquires served from a resident buffer.
    pub(crate) hits: Counter,
    /// Total acquires that admitted a new key.
    pub(crate) misses: Counter,
    /// Total buffers repurposed to admit a new key.
    pub(crate) evictions: Counter,
    /// Total victims migrated from a foreign bucket.
    pub(crate) migrations: Counter,
    /// Total blocks materialized from the backing store.
    pub(crate) loads: Counter,
    /// Total blocks persisted to the backing store.
    pub(crate) stores: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            hits: Counter::default(),
            misses: Counter::default(),
            evictions: Counter::default(),
            migrations: Counter::default(),
            loads: Counter::default(),
            stores: Counter::default(),
        };

        registry.register(
            "block_cache_hits",
            "Total acquires served from a resident buffer",
            metrics.hits.clone(),
        );
        registry.register(
            "block_cache_misses",
            "Total acquires that admitted a new key",
            metrics.misses.clone(),
        );
        registry.register(
            "block_cache_evictions",
            "Total buffers repurposed to admit a new key",
            metrics.evictions.clone(),
        );
        registry.register(
            "block_cache_migrations",
            "Total victims migrated from a foreign bucket",
            metrics.migrations.clone(),
        );
        registry.register(
            "block_cache_loads",
            "Total blocks materialized from the backing store",
            metrics.loads.clone(),
        );
        registry.register(
            "block_cache_stores",
            "Total blocks persisted to the backing store",
            metrics.stores.clone(),
        );

        metrics
    }
}

/// Payload of one buffer slot, guarded by the slot's blocking lock.
///
/// `bytes` is well-defined only while `valid` is set; repurposing a slot for a
/// new key clears `valid` so the next [BufferCache::read] reloads it.
struct BufferData {
    valid: bool,
    bytes: Box<[u8]>,
}

/// One pre-allocated buffer slot.
///
/// The mutex is the buffer's blocking lock: acquiring it may suspend the
/// calling thread until the current holder releases it, and it is the only
/// lock in the cache a thread may block on while other threads make progress.
struct Slot {
    data: Mutex<BufferData>,
}

/// Metadata for one buffer, owned by exactly one bucket at a time.
struct Entry {
    /// Index of the buffer's slot in the arena. Never changes.
    slot: usize,
    /// Identity of the cached block. `None` until the slot is first used.
    key: Option<(u32, u64)>,
    /// Reference count. Nonzero entries are never evicted and never leave
    /// their bucket.
    refs: usize,
    /// Logical-clock stamp of the last release to zero references.
    /// `0` means never released, which sorts as the stalest possible.
    released_at: u64,
}

/// One hash bucket: the set of entries whose block number hashes here (plus
/// any entries parked here at startup or by migration).
///
/// Scan order is maintained incidentally by the backing vector; eviction
/// ignores position and compares release stamps only, with ties broken by
/// scan order.
struct Bucket {
    entries: Vec<Entry>,
}

impl Bucket {
    /// Bumps the refcount of the entry for `(dev, block)` and returns its slot
    /// index, if the key is resident.
    fn hit(&mut self, dev: u32, block: u64) -> Option<usize> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.key == Some((dev, block)))?;
        entry.refs += 1;
        Some(entry.slot)
    }

    /// Returns the position of the eviction victim: the unreferenced entry
    /// with the smallest release stamp, ties broken by scan order.
    fn victim(&self) -> Option<usize> {
        let mut found: Option<(usize, u64)> = None;
        for (pos, entry) in self.entries.iter().enumerate() {
            if entry.refs != 0 {
                continue;
            }
            match found {
                Some((_, stamp)) if entry.released_at >= stamp => {}
                _ => found = Some((pos, entry.released_at)),
            }
        }
        found.map(|(pos, _)| pos)
    }
}

/// A fixed pool of block buffers shared by all threads.
///
/// See the [crate] documentation for the sharding, lock-order, and eviction
/// design.
pub struct BufferCache<B: BackingStore> {
    store: B,
    /// The buffer arena. Entries in `buckets` refer into it by index.
    slots: Box<[Slot]>,
    buckets: Box<[Mutex<Bucket>]>,
    /// Coordinator lock: serializes the admit path (eviction and cross-bucket
    /// migration). Always acquired before any bucket lock; never held on a
    /// hit.
    admit: Mutex<()>,
    /// Logical clock for release stamps.
    clock: AtomicU64,
    pub(crate) metrics: Metrics,
}

impl<B: BackingStore> std::fmt::Debug for BufferCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("buffers", &self.slots.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl<B: BackingStore> BufferCache<B> {
    /// Creates a new buffer cache over `store` with every slot pre-allocated.
    ///
    /// All slots start unused and parked in the first bucket; they migrate to
    /// their keys' home buckets as the cache warms up.
    pub fn new(store: B, config: Config, registry: &mut Registry) -> Self {
        let block_size = config.block_size.get();
        let slots: Box<[Slot]> = (0..config.buffers.get())
            .map(|_| Slot {
                data: Mutex::new(BufferData {
                    valid: false,
                    bytes: vec![0; block_size].into_boxed_slice(),
                }),
            })
            .collect();

        let mut buckets: Vec<Mutex<Bucket>> = (0..config.buckets.get())
            .map(|_| Mutex::new(Bucket {
                entries: Vec::new(),
            }))
            .collect();
        let initial = buckets[0].get_mut();
        initial.entries.reserve_exact(slots.len());
        for slot in 0..slots.len() {
            initial.entries.push(Entry {
                slot,
                key: None,
                refs: 0,
                released_at: 0,
            });
        }

        Self {
            store,
            slots,
            buckets: buckets.into_boxed_slice(),
            admit: Mutex::new(()),
            clock: AtomicU64::new(0),
            metrics: Metrics::new(registry),
        }
    }

    /// Returns the backing store.
    pub fn store(&self) -> &B {
        &self.store
    }

    /// Returns the size of each cached block in bytes.
    pub fn block_size(&self) -> usize {
        // Slot payloads are only resized at construction.
        self.slots[0].data.lock().bytes.len()
    }

    /// Returns whether `(dev, block)` is currently resident.
    pub fn contains(&self, dev: u32, block: u64) -> bool {
        self.buckets[self.bucket_of(block)]
            .lock()
            .entries
            .iter()
            .any(|entry| entry.key == Some((dev, block)))
    }

    /// Acquires the buffer for `(dev, block)`, admitting the key (and evicting
    /// a victim) if it is not resident, then blocks until the buffer's lock is
    /// held.
    ///
    /// The returned guard grants exclusive access to the payload, which is
    /// meaningful only after a [Self::read] has validated it. Acquiring a
    /// buffer the calling thread already holds deadlocks, so guards should be
    /// short-lived; use [BufferGuard::pin] to keep a block resident across
    /// operations instead.
    ///
    /// # Panics
    ///
    /// Panics if every buffer in the pool is referenced and no victim exists
    /// anywhere (see the crate docs on exhaustion).
    pub fn acquire(&self, dev: u32, block: u64) -> BufferGuard<'_, B> {
        let index = self.bucket_of(block);

        // Fast path: the key is resident in its home bucket.
        let hit = self.buckets[index].lock().hit(dev, block);
        if let Some(slot) = hit {
            self.metrics.hits.inc();
            let data = self.slots[slot].data.lock();
            return self.guard(slot, dev, block, data);
        }

        self.metrics.misses.inc();
        trace!(dev, block, "cache miss");

        // Admit path. The coordinator lock comes first, then the home bucket;
        // this order is fixed everywhere.
        let admit = self.admit.lock();
        let mut bucket = self.buckets[index].lock();

        // Another thread may have admitted the key while we waited on the
        // coordinator.
        if let Some(slot) = bucket.hit(dev, block) {
            drop(bucket);
            drop(admit);
            let data = self.slots[slot].data.lock();
            return self.guard(slot, dev, block, data);
        }

        // Recycle the stalest unreferenced buffer in the home bucket.
        if let Some(pos) = bucket.victim() {
            let slot = bucket.entries[pos].slot;
            let data = self.repurpose(&mut bucket.entries[pos], dev, block);
            drop(bucket);
            drop(admit);
            return self.guard(slot, dev, block, data);
        }

        // The home bucket has nothing evictable: steal a victim from the
        // other buckets, round robin from the next one. Holding two bucket
        // locks is safe here because only the coordinator holder ever does
        // so.
        for offset in 1..self.buckets.len() {
            let other_index = (index + offset) % self.buckets.len();
            let mut other = self.buckets[other_index].lock();
            let Some(pos) = other.victim() else {
                continue;
            };
            let mut entry = other.entries.swap_remove(pos);
            drop(other);

            debug!(
                dev,
                block,
                from = other_index,
                to = index,
                "migrating victim across buckets"
            );
            self.metrics.migrations.inc();
            let slot = entry.slot;
            let data = self.repurpose(&mut entry, dev, block);
            bucket.entries.push(entry);
            drop(bucket);
            drop(admit);
            return self.guard(slot, dev, block, data);
        }

        panic!("buffer cache exhausted: every buffer is referenced");
    }

    /// Returns the locked buffer for `(dev, block)` with its contents
    /// materialized from the backing store if they were not already resident.
    ///
    /// Concurrent reads of the same key trigger at most one load: followers
    /// block on the buffer's lock and find the payload valid once they hold
    /// it.
    ///
    /// # Panics
    ///
    /// Panics on pool exhaustion, as [Self::acquire] does.
    pub fn read(&self, dev: u32, block: u64) -> BufferGuard<'_, B> {
        let mut guard = self.acquire(dev, block);
        if !guard.data.valid {
            self.store.load(dev, block, &mut guard.data.bytes);
            guard.data.valid = true;
            self.metrics.loads.inc();
        }
        guard
    }

    fn bucket_of(&self, block: u64) -> usize {
        (block % self.buckets.len() as u64) as usize
    }

    /// Rewrites an unreferenced entry's identity in place for a new key and
    /// takes its blocking lock.
    ///
    /// The caller must hold the coordinator lock and the lock of the bucket
    /// that owns (or is receiving) the entry.
    fn repurpose<'a>(
        &'a self,
        entry: &mut Entry,
        dev: u32,
        block: u64,
    ) -> MutexGuard<'a, BufferData> {
        // refs == 0 means no holder and no waiter, so this cannot fail; it
        // also cannot block, which keeps the no-blocking rule for bucket
        // locks intact.
        let mut data = self.slots[entry.slot]
            .data
            .try_lock()
            .expect("unreferenced buffer has no lock holder");
        if entry.key.is_some() {
            trace!(dev, block, evicted = ?entry.key, "evicting buffer");
        }
        data.valid = false;
        entry.key = Some((dev, block));
        entry.refs = 1;
        self.metrics.evictions.inc();
        data
    }

    fn guard<'a>(
        &'a self,
        slot: usize,
        dev: u32,
        block: u64,
        data: MutexGuard<'a, BufferData>,
    ) -> BufferGuard<'a, B> {
        BufferGuard {
            cache: self,
            slot,
            dev,
            block,
            data: ManuallyDrop::new(data),
        }
    }

    /// Drops one reference to `slot`, stamping it eviction-eligible when the
    /// count reaches zero. Called with the blocking lock already released.
    fn release(&self, slot: usize, block: u64) {
        let mut bucket = self.buckets[self.bucket_of(block)].lock();
        let entry = Self::entry_mut(&mut bucket, slot);
        entry.refs -= 1;
        if entry.refs == 0 {
            entry.released_at = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        }
    }

    /// Adds a reference to `slot` without touching its blocking lock.
    fn pin_slot(&self, slot: usize, block: u64) {
        let mut bucket = self.buckets[self.bucket_of(block)].lock();
        Self::entry_mut(&mut bucket, slot).refs += 1;
    }

    /// Drops a pin reference. Unlike [Self::release] this stamps no release
    /// time: pinning is residency control, not a use of the block.
    fn unpin_slot(&self, slot: usize, block: u64) {
        let mut bucket = self.buckets[self.bucket_of(block)].lock();
        Self::entry_mut(&mut bucket, slot).refs -= 1;
    }

    fn entry_mut<'a>(bucket: &'a mut Bucket, slot: usize) -> &'a mut Entry {
        bucket
            .entries
            .iter_mut()
            .find(|entry| entry.slot == slot)
            .expect("referenced buffer stays in its home bucket")
    }
}

/// Exclusive handle to one locked buffer.
///
/// Holding the guard is holding the buffer's blocking lock: the payload may
/// only be observed or mutated through a live guard, which is what makes
/// [BufferGuard::write] safe to offer without a runtime "lock held" check.
/// Dropping the guard releases the lock and the reference together.
pub struct BufferGuard<'a, B: BackingStore> {
    cache: &'a BufferCache<B>,
    slot: usize,
    dev: u32,
    block: u64,
    data: ManuallyDrop<MutexGuard<'a, BufferData>>,
}

impl<B: BackingStore> std::fmt::Debug for BufferGuard<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferGuard")
            .field("dev", &self.dev)
            .field("block", &self.block)
            .field("valid", &self.data.valid)
            .finish()
    }
}

impl<'a, B: BackingStore> BufferGuard<'a, B> {
    /// Returns the device id of the cached block.
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Returns the block number of the cached block.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Persists the payload to the backing store, blocking until the transfer
    /// completes.
    pub fn write(&self) {
        self.cache.store.store(self.dev, self.block, &self.data.bytes);
        self.cache.metrics.stores.inc();
    }

    /// Pins the block so it stays resident after this guard is dropped.
    ///
    /// A pin holds a reference without holding the blocking lock, so it does
    /// not grant access to the payload and other threads may lock the buffer
    /// while it is pinned.
    pub fn pin(&self) -> PinnedBlock<'a, B> {
        self.cache.pin_slot(self.slot, self.block);
        PinnedBlock {
            cache: self.cache,
            slot: self.slot,
            block: self.block,
        }
    }
}

impl<B: BackingStore> AsRef<[u8]> for BufferGuard<'_, B> {
    fn as_ref(&self) -> &[u8] {
        &self.data.bytes
    }
}

impl<B: BackingStore> AsMut<[u8]> for BufferGuard<'_, B> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data.bytes
    }
}

impl<B: BackingStore> Drop for BufferGuard<'_, B> {
    fn drop(&mut self) {
        // The blocking lock is released before the bucket lock is taken, so
        // neither is ever held together with the other.
        // SAFETY: drop runs once and `data` is not used afterwards.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release(self.slot, self.block);
    }
}

/// A reference that keeps a block resident without holding its lock.
///
/// Dropping the pin (or calling [Self::unpin]) makes the block
/// eviction-eligible again once no other references remain.
pub struct PinnedBlock<'a, B: BackingStore> {
    cache: &'a BufferCache<B>,
    slot: usize,
    block: u64,
}

impl<B: BackingStore> PinnedBlock<'_, B> {
    /// Releases the pin. Equivalent to dropping the handle.
    pub fn unpin(self) {}
}

impl<B: BackingStore> Drop for PinnedBlock<'_, B> {
    fn drop(&mut self) {
        self.cache.unpin_slot(self.slot, self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MemStore;
    use std::num::NonZeroUsize;
    use test_case::test_case;

    fn nz(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    fn test_cache(buffers: usize, buckets: usize) -> BufferCache<MemStore> {
        let config = Config {
            buffers: nz(buffers),
            buckets: nz(buckets),
            block_size: nz(64),
        };
        BufferCache::new(MemStore::new(), config, &mut Registry::default())
    }

    fn entry(slot: usize, refs: usize, released_at: u64) -> Entry {
        Entry {
            slot,
            key: Some((1, slot as u64)),
            refs,
            released_at,
        }
    }

    #[test]
    fn test_victim_prefers_smallest_stamp() {
        let bucket = Bucket {
            entries: vec![entry(0, 0, 9), entry(1, 0, 3), entry(2, 0, 7)],
        };
        assert_eq!(bucket.victim(), Some(1));
    }

    #[test]
    fn test_victim_skips_referenced() {
        let bucket = Bucket {
            entries: vec![entry(0, 1, 1), entry(1, 2, 2), entry(2, 0, 8)],
        };
        assert_eq!(bucket.victim(), Some(2));

        let busy = Bucket {
            entries: vec![entry(0, 1, 1), entry(1, 1, 2)],
        };
        assert_eq!(busy.victim(), None);
    }

    #[test]
    fn test_victim_tie_breaks_in_scan_order() {
        let bucket = Bucket {
            entries: vec![entry(0, 0, 5), entry(1, 0, 5), entry(2, 0, 5)],
        };
        assert_eq!(bucket.victim(), Some(0));
    }

    #[test]
    fn test_release_stamps_are_monotone() {
        let cache = test_cache(4, 1);
        drop(cache.read(1, 1));
        drop(cache.read(1, 2));

        let bucket = cache.buckets[0].lock();
        let stamp_of = |block: u64| {
            bucket
                .entries
                .iter()
                .find(|entry| entry.key == Some((1, block)))
                .unwrap()
                .released_at
        };
        assert!(stamp_of(1) > 0);
        assert!(stamp_of(2) > stamp_of(1));
    }

    #[test]
    fn test_hold_does_not_stamp() {
        let cache = test_cache(4, 1);
        let buf = cache.read(1, 1);
        {
            let bucket = cache.buckets[0].lock();
            let entry = bucket.entries.iter().find(|e| e.slot == buf.slot).unwrap();
            assert_eq!(entry.refs, 1);
            assert_eq!(entry.released_at, 0);
        }
        drop(buf);
        let bucket = cache.buckets[0].lock();
        assert!(bucket.entries.iter().any(|e| e.released_at > 0));
    }

    #[test_case(2; "two buckets")]
    #[test_case(4; "four buckets")]
    fn test_single_buffer_migrates_between_buckets(buckets: usize) {
        // One slot serving keys from every bucket: each admit after the first
        // must steal the slot from a foreign bucket.
        let cache = test_cache(1, buckets);
        for block in 0..buckets as u64 {
            drop(cache.read(1, block));
            assert!(cache.contains(1, block));
        }
        assert_eq!(cache.store().loads(), buckets);
        assert_eq!(cache.metrics.migrations.get(), buckets as u64 - 1);

        // The slot's entry now lives in the last key's home bucket.
        let last = buckets as u64 - 1;
        let home = cache.bucket_of(last);
        assert!(cache.buckets[home]
            .lock()
            .entries
            .iter()
            .any(|entry| entry.key == Some((1, last))));
    }

    #[test]
    fn test_repurpose_invalidates_payload() {
        let cache = test_cache(1, 1);
        drop(cache.read(1, 1));
        drop(cache.read(1, 2));

        // Re-admitting block 1 must reload it rather than resurrect stale
        // bytes.
        drop(cache.read(1, 1));
        assert_eq!(cache.store().loads(), 3);
    }

    #[test]
    fn test_bucket_of_wraps() {
        let cache = test_cache(2, 4);
        assert_eq!(cache.bucket_of(0), 0);
        assert_eq!(cache.bucket_of(5), 1);
        assert_eq!(cache.bucket_of(7), 3);
    }

    #[test]
    fn test_block_size() {
        let cache = test_cache(2, 1);
        assert_eq!(cache.block_size(), 64);
    }
}
