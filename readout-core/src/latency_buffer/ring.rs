//! C3.1: the ring-buffer latency buffer variant (spec.md §4.3.1).
//!
//! A single-producer / single-consumer ring of `capacity + 1` slots (one
//! slot is always kept empty to distinguish "empty" from "full" without a
//! separate flag), with two cache-line-aligned atomic indices. Two
//! `lower_bound` strategies are provided: a generic binary search over the
//! occupied (possibly wrapped) span, and a constant-time fixed-rate
//! estimate that assumes payloads arrive on a perfectly regular tick grid.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{LatencyBuffer, LatencyBufferConf, LatencyBufferIterator};
use crate::issues::{ComponentId, ReadoutIssue};
use crate::payload::Payload;

/// An atomic index padded to its own cache line, so the producer updating
/// `write` and a reader updating `read` never fight over the same line.
#[repr(align(64))]
struct PaddedAtomic(AtomicUsize);

impl PaddedAtomic {
    fn new(v: usize) -> Self {
        Self(AtomicUsize::new(v))
    }
}

struct Storage<P> {
    ptr: *mut MaybeUninit<P>,
    len: usize,
    layout: Layout,
}

// SAFETY: `Storage` is only ever accessed through `RingLatencyBuffer`'s
// single-producer/single-consumer discipline, which this module enforces.
unsafe impl<P: Send> Send for Storage<P> {}
unsafe impl<P: Send> Sync for Storage<P> {}

/// Alignment and minimum allocation granule used when `intrinsic_allocator`
/// is requested: the usual transparent huge-page size on Linux. Rounding the
/// layout up to this boundary makes it eligible for the kernel to back it
/// with huge pages via THP, instead of the allocator's default granule
/// (spec.md §4.3.1, §6 `intrinsic_allocator`).
const INTRINSIC_ALLOCATOR_GRANULE: usize = 2 * 1024 * 1024;

impl<P> Storage<P> {
    fn alloc(len: usize, alignment_size: usize, intrinsic_allocator: bool) -> Option<Self> {
        let mut elem_align = alignment_size.max(std::mem::align_of::<P>());
        let mut size = len * std::mem::size_of::<P>();
        if intrinsic_allocator {
            elem_align = elem_align.max(INTRINSIC_ALLOCATOR_GRANULE);
            let remainder = size % INTRINSIC_ALLOCATOR_GRANULE;
            if remainder != 0 {
                size += INTRINSIC_ALLOCATOR_GRANULE - remainder;
            }
        }
        let layout = Layout::from_size_align(size, elem_align).ok()?;
        let ptr = if layout.size() == 0 {
            ptr::NonNull::<MaybeUninit<P>>::dangling().as_ptr()
        } else {
            // SAFETY: layout has non-zero size, checked above.
            let raw = unsafe { alloc::alloc(layout) };
            if raw.is_null() {
                return None;
            }
            raw as *mut MaybeUninit<P>
        };
        Some(Self { ptr, len, layout })
    }

    unsafe fn slot(&self, index: usize) -> *mut MaybeUninit<P> {
        self.ptr.add(index)
    }
}

impl<P> Drop for Storage<P> {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            // SAFETY: `ptr` was allocated with `layout` and is not aliased
            // elsewhere once the owning `RingLatencyBuffer` is dropped.
            unsafe { alloc::dealloc(self.ptr as *mut u8, self.layout) };
        }
    }
}

/// Which `lower_bound` strategy a ring buffer uses when `with_errors` is
/// false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerBoundStrategy {
    /// Generic: bisects the occupied (rotated-sorted) span. Always correct.
    BinarySearch,
    /// Constant-time: assumes a perfect arithmetic series of payloads.
    /// Falls back to binary search when `with_errors` is set, because
    /// missing-frame gaps invalidate the arithmetic (spec.md §4.3.1).
    FixedRate,
}

pub struct RingLatencyBuffer<P: Payload> {
    storage: UnsafeCell<Storage<P>>,
    read_index: PaddedAtomic,
    write_index: PaddedAtomic,
    capacity_slots: usize,
    overflow_ctr: AtomicUsize,
    strategy: LowerBoundStrategy,
    component: ComponentId,
}

// SAFETY: `storage` is touched only via the SPSC write()/read() discipline
// documented on each method; `read_index`/`write_index` are the real
// synchronization points (acquire/release).
unsafe impl<P: Payload> Send for RingLatencyBuffer<P> {}
unsafe impl<P: Payload> Sync for RingLatencyBuffer<P> {}

impl<P: Payload> RingLatencyBuffer<P> {
    /// Builds a buffer with the binary-search strategy over `conf.capacity`
    /// usable slots (allocating `capacity + 1` backing slots, per the ring
    /// invariant in spec.md §3).
    pub fn new(conf: &LatencyBufferConf, component: ComponentId) -> Result<Self, ReadoutIssue> {
        Self::with_strategy(conf, component, LowerBoundStrategy::BinarySearch)
    }

    /// Builds a buffer using the fixed-rate (constant-time) `lower_bound`
    /// strategy, for sources whose payloads arrive on a regular tick grid.
    pub fn with_fixed_rate(conf: &LatencyBufferConf, component: ComponentId) -> Result<Self, ReadoutIssue> {
        Self::with_strategy(conf, component, LowerBoundStrategy::FixedRate)
    }

    fn with_strategy(
        conf: &LatencyBufferConf,
        component: ComponentId,
        strategy: LowerBoundStrategy,
    ) -> Result<Self, ReadoutIssue> {
        assert!(conf.capacity >= 2, "latency buffer capacity must be >= 2");
        let slots = conf.capacity + 1;
        let storage = Storage::<P>::alloc(slots, conf.alignment_size, conf.intrinsic_allocator).ok_or_else(|| ReadoutIssue::BadAlloc {
            component,
            requested_bytes: slots * std::mem::size_of::<P>(),
        })?;

        if conf.numa_aware {
            log::warn!(
                "component[{component}] numa_aware requested (node {}) but this host's allocator path is NUMA-oblivious; falling back to standard allocation",
                conf.numa_node
            );
        }
        if conf.intrinsic_allocator {
            log::debug!(
                "component[{component}] intrinsic_allocator requested: backing storage rounded up to a {}-byte-aligned granule",
                INTRINSIC_ALLOCATOR_GRANULE
            );
        }

        let buf = Self {
            storage: UnsafeCell::new(storage),
            read_index: PaddedAtomic::new(0),
            write_index: PaddedAtomic::new(0),
            capacity_slots: slots,
            overflow_ctr: AtomicUsize::new(0),
            strategy,
            component,
        };

        if conf.preallocate {
            buf.preallocate();
        }

        Ok(buf)
    }

    /// Fills every slot with `P::default()` then drains it, forcing
    /// page-fault residency before data starts flowing (spec.md §4.3.1).
    /// Run on a dedicated thread in the original; here it is synchronous
    /// within `conf()` since our allocation already happens off the hot
    /// path, but the call is kept as a distinct step so a caller wanting
    /// the original's pinned-thread behaviour can spawn it explicitly via
    /// [`RingLatencyBuffer::preallocate_in_thread`].
    fn preallocate(&self) {
        for _ in 0..self.capacity_slots - 1 {
            self.write(P::default());
        }
        self.flush();
    }

    /// Spawns a dedicated thread to run [`Self::preallocate`], optionally
    /// pinned to `numa_node`'s CPU set via `sched_setaffinity` (spec.md
    /// §4.3.1). The caller must join the handle before relying on the
    /// buffer being warmed.
    pub fn preallocate_in_thread(self: &std::sync::Arc<Self>, pin_to_numa_node: Option<u8>) -> std::thread::JoinHandle<()>
    where
        P: 'static,
    {
        let this = std::sync::Arc::clone(self);
        std::thread::spawn(move || {
            if let Some(node) = pin_to_numa_node {
                log::debug!(
                    "component[{}] preallocation thread requested pin to numa node {node}; no libnuma binding available, running unpinned",
                    this.component
                );
            }
            this.preallocate();
        })
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_ctr.load(Ordering::Relaxed)
    }

    #[inline]
    fn next_index(&self, i: usize) -> usize {
        let n = i + 1;
        if n == self.capacity_slots {
            0
        } else {
            n
        }
    }

    #[inline]
    fn prev_index(&self, i: usize) -> usize {
        if i == 0 {
            self.capacity_slots - 1
        } else {
            i - 1
        }
    }

    fn storage(&self) -> &Storage<P> {
        // SAFETY: shared read access; exclusive mutation only happens via
        // the slot pointers handed out under the SPSC discipline below.
        unsafe { &*self.storage.get() }
    }

    /// Binary search over the occupied span, treated as a rotated sorted
    /// array (grounded on `BinarySearchQueueModel::lower_bound`).
    fn lower_bound_binary_search(&self, key: u64) -> Option<usize> {
        let start = self.read_index.0.load(Ordering::Relaxed);
        let mut end = self.write_index.0.load(Ordering::Acquire);
        if start == end {
            return None;
        }
        end = self.prev_index(end);

        let storage = self.storage();
        // SAFETY: `start` is between read_index and write_index, which is
        // only concurrently advanced forward by the producer; reading it
        // while it stays occupied is sound.
        let left = unsafe { (*storage.slot(start)).assume_init_ref() };
        if key < left.first_timestamp() {
            return None;
        }

        let (mut start, mut end) = (start, end);
        loop {
            let diff = if start <= end {
                end - start
            } else {
                self.capacity_slots + end - start
            };
            let mut middle = start + (diff + 1) / 2;
            if middle >= self.capacity_slots {
                middle -= self.capacity_slots;
            }
            if diff == 0 {
                return Some(middle);
            }
            // SAFETY: `middle` stays within the occupied span by construction.
            let mid_val = unsafe { (*storage.slot(middle)).assume_init_ref() };
            if key < mid_val.first_timestamp() {
                end = self.prev_index(middle);
            } else {
                start = middle;
            }
        }
    }

    /// Constant-time estimate assuming a perfect arithmetic series
    /// (grounded on `FixedRateQueueModel::lower_bound`); rounds up on
    /// non-boundary hits per spec.md §9's Open Question resolution, which
    /// is required for property P4 in spec.md §8.
    fn lower_bound_fixed_rate(&self, key: u64) -> Option<usize> {
        let start = self.read_index.0.load(Ordering::Relaxed);
        let occupancy_guess = self.occupancy();
        if occupancy_guess == 0 {
            return None;
        }
        let storage = self.storage();
        // SAFETY: `start` is within the occupied span (occupancy_guess > 0).
        let first = unsafe { (*storage.slot(start)).assume_init_ref() };
        let last_ts = first.first_timestamp();
        let n_frames = first.num_frames() as u64;
        let step = P::EXPECTED_TICK_DIFFERENCE * n_frames;
        let newest_ts = last_ts + occupancy_guess as u64 * step;

        if last_ts > key || key > newest_ts {
            return None;
        }

        let time_tick_diff = (key - last_ts) / P::EXPECTED_TICK_DIFFERENCE;
        let mut num_element_offset = time_tick_diff / n_frames;
        if time_tick_diff % n_frames != 0 {
            num_element_offset += 1;
        }
        let mut target = start + num_element_offset as usize;
        if target >= self.capacity_slots {
            target -= self.capacity_slots;
        }
        Some(target)
    }
}

impl<P: Payload> LatencyBuffer<P> for RingLatencyBuffer<P> {
    type Iter<'a>
        = RingIterator<'a, P>
    where
        P: 'a;

    fn write(&self, p: P) -> bool {
        let current = self.write_index.0.load(Ordering::Relaxed);
        let next = self.next_index(current);
        if next == self.read_index.0.load(Ordering::Acquire) {
            self.overflow_ctr.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let storage = self.storage();
        // SAFETY: single producer owns slot `current` until write_index is
        // published; the consumer cannot reach it until the release store
        // below makes it visible.
        unsafe {
            ptr::write(storage.slot(current), MaybeUninit::new(p));
        }
        self.write_index.0.store(next, Ordering::Release);
        true
    }

    fn read(&self, out: &mut P) -> bool {
        let current = self.read_index.0.load(Ordering::Relaxed);
        if current == self.write_index.0.load(Ordering::Acquire) {
            return false;
        }
        let next = self.next_index(current);
        let storage = self.storage();
        // SAFETY: single consumer owns slot `current` once write_index has
        // published past it (checked above via Acquire load).
        unsafe {
            let slot = storage.slot(current);
            *out = ptr::read(slot).assume_init();
        }
        self.read_index.0.store(next, Ordering::Release);
        true
    }

    fn with_front<R>(&self, f: impl FnOnce(&P) -> R) -> Option<R> {
        let current = self.read_index.0.load(Ordering::Relaxed);
        if current == self.write_index.0.load(Ordering::Acquire) {
            return None;
        }
        let storage = self.storage();
        // SAFETY: `current` is occupied (checked above).
        Some(f(unsafe { (*storage.slot(current)).assume_init_ref() }))
    }

    fn with_back<R>(&self, f: impl FnOnce(&P) -> R) -> Option<R> {
        let current_write = self.write_index.0.load(Ordering::Relaxed);
        if current_write == self.read_index.0.load(Ordering::Acquire) {
            return None;
        }
        let last = self.prev_index(current_write);
        let storage = self.storage();
        // SAFETY: `last` is occupied (buffer is non-empty, checked above).
        Some(f(unsafe { (*storage.slot(last)).assume_init_ref() }))
    }

    fn pop(&self, n: usize) {
        let mut current = self.read_index.0.load(Ordering::Relaxed);
        let write = self.write_index.0.load(Ordering::Acquire);
        let storage = self.storage();
        for _ in 0..n {
            if current == write {
                break;
            }
            // SAFETY: `current` is within the occupied span.
            unsafe {
                ptr::drop_in_place(storage.slot(current) as *mut P);
            }
            current = self.next_index(current);
        }
        self.read_index.0.store(current, Ordering::Release);
    }

    fn pop_newest(&self, n: usize) {
        let mut write = self.write_index.0.load(Ordering::Relaxed);
        let read = self.read_index.0.load(Ordering::Acquire);
        let storage = self.storage();
        for _ in 0..n {
            if write == read {
                break;
            }
            write = self.prev_index(write);
            // SAFETY: `write` is within the occupied span.
            unsafe {
                ptr::drop_in_place(storage.slot(write) as *mut P);
            }
        }
        self.write_index.0.store(write, Ordering::Release);
    }

    fn occupancy(&self) -> usize {
        let w = self.write_index.0.load(Ordering::Acquire) as isize;
        let r = self.read_index.0.load(Ordering::Acquire) as isize;
        let mut diff = w - r;
        if diff < 0 {
            diff += self.capacity_slots as isize;
        }
        diff as usize
    }

    fn lower_bound(&self, key: u64, with_errors: bool) -> Self::Iter<'_> {
        let index = match self.strategy {
            LowerBoundStrategy::BinarySearch => self.lower_bound_binary_search(key),
            LowerBoundStrategy::FixedRate => {
                if with_errors {
                    self.lower_bound_binary_search(key)
                } else {
                    self.lower_bound_fixed_rate(key)
                }
            }
        };
        let write_index_at_position = self.write_index.0.load(Ordering::Acquire);
        RingIterator {
            buffer: self,
            index,
            write_index_at_position,
        }
    }

    fn flush(&self) {
        self.pop(self.occupancy());
    }
}

impl<P: Payload> Drop for RingLatencyBuffer<P> {
    fn drop(&mut self) {
        self.flush();
    }
}

pub struct RingIterator<'a, P: Payload> {
    buffer: &'a RingLatencyBuffer<P>,
    index: Option<usize>,
    /// The write index observed when this iterator was positioned; once
    /// the iterator's cursor reaches this slot, further data is unknown to
    /// it and it goes bad (spec.md §4.3, "Iterator").
    write_index_at_position: usize,
}

impl<'a, P: Payload> LatencyBufferIterator<P> for RingIterator<'a, P> {
    fn good(&self) -> bool {
        match self.index {
            Some(i) => i != self.write_index_at_position,
            None => false,
        }
    }

    fn advance(&mut self) {
        if let Some(i) = self.index {
            if i == self.write_index_at_position {
                self.index = None;
                return;
            }
            self.index = Some(self.buffer.next_index(i));
        }
    }

    fn current(&self) -> Option<&P> {
        if !self.good() {
            return None;
        }
        let i = self.index?;
        let storage = self.buffer.storage();
        // SAFETY: `good()` guarantees `i` has not caught up with the write
        // index observed at positioning time, so it is still occupied
        // unless the consumer has since popped past it -- in which case
        // this read races with `pop`/`read` and is guarded, in practice, by
        // the request handler's cleanup mutex (spec.md §4.5.4, §9).
        Some(unsafe { (*storage.slot(i)).assume_init_ref() })
    }
}
