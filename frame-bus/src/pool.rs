use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Per-slot control word pair. `size` is only meaningful while
/// `refcount > 0`; publish stores `size` first and `refcount` last
/// (Release), so a reader that observes `refcount > 0` (Acquire) also
/// observes a valid `size` and payload.
pub struct ControlEntry {
    size: AtomicU32,
    refcount: AtomicI32,
}

/// Parallel array of control entries, index-matched with the slots.
pub struct ControlTable {
    entries: Box<[ControlEntry]>,
}

impl ControlTable {
    fn new(len: usize) -> Self {
        let entries = (0..len)
            .map(|_| ControlEntry {
                size: AtomicU32::new(0),
                refcount: AtomicI32::new(0),
            })
            .collect();
        Self { entries }
    }

    pub fn refcount(&self, slot: usize) -> i32 {
        self.entries[slot].refcount.load(Ordering::Acquire)
    }

    pub fn size(&self, slot: usize) -> u32 {
        self.entries[slot].size.load(Ordering::Relaxed)
    }
}

struct Slot {
    data: UnsafeCell<Box<[u8]>>,
    /// Bumped on every successful publish. Lets stress tests assert that a
    /// slot was not overwritten between acquire and release.
    generation: AtomicU64,
}

// The refcount protocol is what makes this sound: the publisher only writes
// a slot while its refcount is 0, and readers only hold views while it is
// > 0. The Release store on publish and the AcqRel fetch_sub on release are
// the synchronization edges.
unsafe impl Sync for Slot {}
unsafe impl Send for Slot {}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("payload of {len} bytes exceeds slot capacity {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("slot {slot} still has outstanding readers")]
    SlotBusy { slot: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishResult {
    pub slot: usize,
    pub size: u32,
}

/// Publish-side counters. Invariant checked by tests:
/// `attempts == published + dropped_busy + dropped_too_large`.
#[derive(Default)]
pub struct PoolCounters {
    pub attempts: AtomicU64,
    pub published: AtomicU64,
    pub dropped_busy: AtomicU64,
    pub dropped_too_large: AtomicU64,
}

/// Fixed pool of fixed-capacity frame slots shared between one publisher and
/// any number of readers. All cross-thread state lives in the control table;
/// there is no lock anywhere on the publish/acquire/release path.
pub struct FramePool {
    slots: Box<[Slot]>,
    control: ControlTable,
    max_frame_size: usize,
    counters: PoolCounters,
}

impl FramePool {
    /// Creates the pool plus the unique publisher handle that owns the
    /// round-robin cursor.
    pub fn new(pool_size: usize, max_frame_size: usize) -> (PoolPublisher, Arc<FramePool>) {
        assert!(pool_size > 0, "pool must have at least one slot");
        let slots = (0..pool_size)
            .map(|_| Slot {
                data: UnsafeCell::new(vec![0u8; max_frame_size].into_boxed_slice()),
                generation: AtomicU64::new(0),
            })
            .collect();
        let pool = Arc::new(FramePool {
            slots,
            control: ControlTable::new(pool_size),
            max_frame_size,
            counters: PoolCounters::default(),
        });
        let publisher = PoolPublisher {
            pool: Arc::clone(&pool),
            cursor: 0,
        };
        (publisher, pool)
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn control(&self) -> &ControlTable {
        &self.control
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    pub fn generation(&self, slot: usize) -> u64 {
        self.slots[slot].generation.load(Ordering::Acquire)
    }

    /// Read-only view of the published bytes in `slot`. The caller must have
    /// been notified of the publish and must not hold the view past its
    /// matching `release`.
    pub fn acquire(&self, slot: usize) -> FrameView<'_> {
        let refcount = self.control.entries[slot].refcount.load(Ordering::Acquire);
        debug_assert!(refcount > 0, "acquire on slot {slot} with no publish outstanding");
        let size = self.control.entries[slot].size.load(Ordering::Relaxed) as usize;
        FrameView { pool: self, slot, size }
    }

    /// Drops one outstanding reader reference. Must be called exactly once
    /// per notification, on every path. Panics on a release with no matching
    /// publish: that is a protocol defect, not a runtime condition.
    pub fn release(&self, slot: usize) {
        let prev = self.control.entries[slot]
            .refcount
            .fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "release on slot {slot} with no outstanding readers");
    }

    /// RAII wrapper over `release`: the lease releases exactly once no
    /// matter which path drops it.
    pub fn lease(self: &Arc<Self>, slot: usize) -> SlotLease {
        SlotLease {
            pool: Arc::clone(self),
            slot,
        }
    }
}

/// Single-owner publish handle. The cursor is plain state on purpose: only
/// this handle ever advances it.
pub struct PoolPublisher {
    pool: Arc<FramePool>,
    cursor: usize,
}

impl PoolPublisher {
    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Publishes one payload into the next round-robin slot and arms its
    /// refcount with `fanout` (the number of notifications the caller will
    /// send for it). A busy slot rejects the frame and leaves the cursor in
    /// place so the same slot is retried next call.
    pub fn publish(&mut self, payload: &[u8], fanout: u32) -> Result<PublishResult, PublishError> {
        let counters = &self.pool.counters;
        counters.attempts.fetch_add(1, Ordering::Relaxed);

        if payload.len() > self.pool.max_frame_size {
            counters.dropped_too_large.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::PayloadTooLarge {
                len: payload.len(),
                max: self.pool.max_frame_size,
            });
        }

        let slot = self.cursor;
        let entry = &self.pool.control.entries[slot];
        if entry.refcount.load(Ordering::Acquire) > 0 {
            counters.dropped_busy.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::SlotBusy { slot });
        }

        // refcount == 0: no reader can hold a view, this handle is the only
        // writer.
        unsafe {
            let data = &mut *self.pool.slots[slot].data.get();
            data[..payload.len()].copy_from_slice(payload);
        }
        self.pool.slots[slot].generation.fetch_add(1, Ordering::Release);
        entry.size.store(payload.len() as u32, Ordering::Relaxed);
        entry
            .refcount
            .store(fanout as i32, Ordering::Release);

        self.cursor = (self.cursor + 1) % self.pool.slots.len();
        counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(PublishResult {
            slot,
            size: payload.len() as u32,
        })
    }
}

/// Borrowed read-only view of one published slot.
pub struct FrameView<'a> {
    pool: &'a FramePool,
    slot: usize,
    size: usize,
}

impl FrameView<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl std::ops::Deref for FrameView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Published payload is immutable until refcount reaches 0, which
        // cannot happen while the notified reader has not released.
        unsafe { &(&*self.pool.slots[self.slot].data.get())[..self.size] }
    }
}

/// Owned reader reference to one slot; releases on drop.
pub struct SlotLease {
    pool: Arc<FramePool>,
    slot: usize,
}

impl SlotLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn view(&self) -> FrameView<'_> {
        self.pool.acquire(self.slot)
    }

    pub fn generation(&self) -> u64 {
        self.pool.generation(self.slot)
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
