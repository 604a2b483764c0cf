//! Zero-copy transport between the classifier and a drainer.
//!
//! Each steered queue owns a frame pool and a pair of single-producer
//! single-consumer rings: the RX ring carries descriptors of steered
//! frames (classifier to drainer), the fill ring returns free frame
//! offsets (drainer to classifier). A frame offset has exactly one owner
//! at any instant:
//!
//! ```text
//! FREE (fill ring) -> INFLIGHT (classifier writes) -> READY (RX ring)
//!      ^                                                  |
//!      +---------- PROCESSING (drainer peeked) <----------+
//! ```
//!
//! When zero-copy is disabled the same drainer API is served by a bounded
//! copy queue instead.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Default frame slot size; fits a 1500-byte MTU frame plus headroom.
pub const DEFAULT_FRAME_SIZE: usize = 2048;

/// Default RX ring capacity. Roughly two seconds of buffering at 1 Gbps;
/// undersized rings were the dominant loss source in earlier iterations.
pub const DEFAULT_RING_CAPACITY: u32 = 4096;

/// Default drainer batch size.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Packed RX descriptor: frame offset in the upper 48 bits, byte length
/// in the lower 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc(u64);

impl FrameDesc {
    pub fn new(offset: u64, len: u16) -> Self {
        debug_assert!(offset < 1 << 48, "frame offset exceeds 48 bits");
        Self(offset << 16 | len as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn offset(self) -> u64 {
        self.0 >> 16
    }

    pub fn len(self) -> u16 {
        self.0 as u16
    }
}

/// Contiguous frame storage shared by both ring endpoints.
///
/// Mutable access is handed out per frame. Soundness rests on the ring
/// discipline: a frame offset lives in exactly one place (fill ring, RX
/// ring, or one thread's working set), so no two threads ever touch the
/// same frame concurrently.
pub struct FramePool {
    mem: UnsafeCell<Box<[u8]>>,
    frame_size: usize,
    frames: usize,
}

// SAFETY: frames are disjoint byte ranges and the single-owner ring
// discipline guarantees exclusive access to each range at any instant.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    pub fn new(frames: usize, frame_size: usize) -> Self {
        assert!(frames > 0 && frame_size > 0);
        Self {
            mem: UnsafeCell::new(vec![0u8; frames * frame_size].into_boxed_slice()),
            frame_size,
            frames,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn size(&self) -> usize {
        self.frames * self.frame_size
    }

    /// Read view of `len` bytes at `offset`.
    ///
    /// Caller must own the frame at `offset` (a peeked, unreleased
    /// descriptor).
    #[inline]
    pub(crate) fn frame(&self, offset: u64, len: usize) -> &[u8] {
        let offset = offset as usize;
        assert!(offset % self.frame_size == 0 && offset + len <= self.size());
        assert!(len <= self.frame_size);
        // SAFETY: bounds checked above; exclusivity per the pool contract.
        unsafe {
            let base = (*self.mem.get()).as_ptr().add(offset);
            std::slice::from_raw_parts(base, len)
        }
    }

    /// Write view of the whole frame at `offset`.
    ///
    /// Caller must own the frame at `offset` (a reserved fill-ring entry).
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) fn frame_mut(&self, offset: u64) -> &mut [u8] {
        let offset = offset as usize;
        assert!(offset % self.frame_size == 0 && offset + self.frame_size <= self.size());
        // SAFETY: bounds checked above; exclusivity per the pool contract.
        unsafe {
            let base = (*self.mem.get()).as_mut_ptr().add(offset);
            std::slice::from_raw_parts_mut(base, self.frame_size)
        }
    }
}

/// Single-producer single-consumer ring of u64 values.
///
/// Indices are monotonically increasing counters; the slot is
/// `index & (capacity - 1)`. The producer publishes with a release store,
/// the consumer observes with an acquire load.
pub struct SpscRing {
    slots: Box<[AtomicU64]>,
    mask: u64,
    prod: CachePadded<AtomicU64>,
    cons: CachePadded<AtomicU64>,
}

impl SpscRing {
    pub fn with_capacity(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots: Vec<AtomicU64> = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            prod: CachePadded::new(AtomicU64::new(0)),
            cons: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    pub fn len(&self) -> u64 {
        self.prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Returns false when the ring is full.
    #[inline]
    pub fn try_push(&self, value: u64) -> bool {
        let head = self.prod.load(Ordering::Relaxed);
        let tail = self.cons.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() {
            return false;
        }
        self.slots[(head & self.mask) as usize].store(value, Ordering::Relaxed);
        self.prod.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side. Pops a single value.
    #[inline]
    pub fn try_pop(&self) -> Option<u64> {
        let tail = self.cons.load(Ordering::Relaxed);
        let head = self.prod.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.slots[(tail & self.mask) as usize].load(Ordering::Relaxed);
        self.cons.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Consumer side. Copies up to `max` values into `out` without
    /// advancing the consumer index; pair with [`SpscRing::release`].
    pub fn peek(&self, out: &mut Vec<u64>, max: usize) -> usize {
        out.clear();
        let tail = self.cons.load(Ordering::Relaxed);
        let head = self.prod.load(Ordering::Acquire);
        let avail = head.wrapping_sub(tail).min(max as u64);
        for i in 0..avail {
            out.push(self.slots[(tail.wrapping_add(i) & self.mask) as usize].load(Ordering::Relaxed));
        }
        avail as usize
    }

    /// Consumer side. Releases `count` previously peeked slots.
    pub fn release(&self, count: u64) {
        let tail = self.cons.load(Ordering::Relaxed);
        self.cons.store(tail.wrapping_add(count), Ordering::Release);
    }
}

/// Readiness signal for a sleeping drainer.
///
/// The producer only takes the lock on an empty-to-nonempty transition,
/// so the hot path stays syscall-free while the ring has backlog.
#[derive(Default)]
struct Notifier {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Notifier {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    /// Waits until `ready` holds or `timeout` elapses. Spurious wakeups
    /// surface as a false return and are harmless to the caller's loop.
    fn wait_ready(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
        if ready() {
            return true;
        }
        let mut guard = self.lock.lock();
        if ready() {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        ready()
    }
}

/// One steered queue's zero-copy endpoint pair.
pub struct RingQueue {
    pool: FramePool,
    rx: SpscRing,
    fill: SpscRing,
    ready: Notifier,
}

impl RingQueue {
    /// Builds the pool and rings and pre-populates the fill ring with
    /// every pool offset.
    pub fn new(ring_capacity: u32, pool_frames: u32, frame_size: usize) -> Self {
        let pool = FramePool::new(pool_frames as usize, frame_size);
        let rx = SpscRing::with_capacity(ring_capacity);
        // The fill ring must be able to hold the entire pool.
        let fill = SpscRing::with_capacity(pool_frames.next_power_of_two());

        for i in 0..pool_frames as u64 {
            let pushed = fill.try_push(i * frame_size as u64);
            debug_assert!(pushed);
        }

        Self {
            pool,
            rx,
            fill,
            ready: Notifier::default(),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Frames currently free (fill ring).
    pub fn free_frames(&self) -> u64 {
        self.fill.len()
    }

    /// Frames currently published and not yet peeked or released.
    pub fn ready_frames(&self) -> u64 {
        self.rx.len()
    }

    // --- classifier (producer) side ---

    /// Take a free frame to receive into. None means drainer starvation.
    #[inline]
    pub fn reserve(&self) -> Option<u64> {
        self.fill.try_pop()
    }

    /// Write access to a reserved frame.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn reserved_frame_mut(&self, offset: u64) -> &mut [u8] {
        self.pool.frame_mut(offset)
    }

    /// Publish a filled frame to the drainer. Returns false when the RX
    /// ring is full; the caller keeps ownership and should recycle.
    #[inline]
    pub fn publish(&self, desc: FrameDesc) -> bool {
        let was_empty = self.rx.is_empty();
        if !self.rx.try_push(desc.raw()) {
            return false;
        }
        if was_empty {
            self.ready.notify();
        }
        true
    }

    /// Return an unpublished frame to the fill ring.
    ///
    /// The drainer is the fill ring's only runtime producer, so this must
    /// only be called when no drainer is active (startup and post-join
    /// shutdown). During a run the classifier keeps its reserved frame and
    /// reuses it for the next receive instead.
    #[inline]
    pub fn recycle(&self, offset: u64) {
        let pushed = self.fill.try_push(offset);
        // The fill ring is sized for the whole pool; this cannot fail
        // while the ownership discipline holds.
        debug_assert!(pushed, "fill ring rejected a pool offset");
    }

    // --- drainer (consumer) side ---

    /// Block until the RX ring has entries, up to `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.wait_ready(timeout, || !self.rx.is_empty())
    }

    /// Peek up to `max` descriptors without consuming them.
    pub fn peek(&self, out: &mut Vec<FrameDesc>, max: usize) -> usize {
        let mut raw = Vec::with_capacity(max);
        let n = self.rx.peek(&mut raw, max);
        out.clear();
        out.extend(raw.into_iter().map(FrameDesc::from_raw));
        n
    }

    /// Read view of a peeked frame.
    #[inline]
    pub fn frame(&self, desc: FrameDesc) -> &[u8] {
        self.pool.frame(desc.offset(), desc.len() as usize)
    }

    /// Return a processed batch to the fill ring and consume its RX slots.
    pub fn release(&self, batch: &[FrameDesc]) {
        for desc in batch {
            let pushed = self.fill.try_push(desc.offset());
            debug_assert!(pushed, "fill ring rejected a pool offset");
        }
        self.rx.release(batch.len() as u64);
    }
}

/// Copy-mode fallback queue for platforms or deployments where the
/// zero-copy path is disabled. Frames are copied once on steer and
/// delivered as owned buffers.
pub struct CopyQueue {
    queue: ArrayQueue<Vec<u8>>,
    ready: Notifier,
}

impl CopyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            ready: Notifier::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Producer side. Returns false when the queue is full.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let was_empty = self.queue.is_empty();
        if self.queue.push(frame).is_err() {
            return false;
        }
        if was_empty {
            self.ready.notify();
        }
        true
    }

    /// Consumer side. Pops up to `max` frames into `out`.
    pub fn pop_batch(&self, out: &mut Vec<Vec<u8>>, max: usize) -> usize {
        out.clear();
        while out.len() < max {
            match self.queue.pop() {
                Some(frame) => out.push(frame),
                None => break,
            }
        }
        out.len()
    }

    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.wait_ready(timeout, || !self.queue.is_empty())
    }
}

/// A steered queue endpoint as seen through the steer table.
pub enum SteerQueue {
    Ring(RingQueue),
    Copy(CopyQueue),
}

impl SteerQueue {
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        match self {
            SteerQueue::Ring(q) => q.wait_ready(timeout),
            SteerQueue::Copy(q) => q.wait_ready(timeout),
        }
    }
}
