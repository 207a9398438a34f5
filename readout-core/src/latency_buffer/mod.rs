//! C3: latency buffer (spec.md §4.3).
//!
//! Two concrete realisations share one contract: a fixed-rate/binary-search
//! ring ([`ring`]) and a concurrent skip list ([`skip_list`]). Both are
//! generic over a [`Payload`](crate::payload::Payload) type `P`.

pub mod ring;
pub mod skip_list;

use crate::payload::Payload;

/// Positioning/alignment configuration applied at `conf()` time
/// (spec.md §4.3, §6).
#[derive(Debug, Clone)]
pub struct LatencyBufferConf {
    pub capacity: usize,
    pub numa_aware: bool,
    pub numa_node: u8,
    pub intrinsic_allocator: bool,
    /// 0 means "no special alignment"; otherwise must be a multiple of 4
    /// and of the payload size (spec.md §6).
    pub alignment_size: usize,
    pub preallocate: bool,
}

impl Default for LatencyBufferConf {
    fn default() -> Self {
        Self {
            capacity: 8192,
            numa_aware: false,
            numa_node: 0,
            intrinsic_allocator: false,
            alignment_size: 0,
            preallocate: false,
        }
    }
}

/// A positionable, forward-only view into a latency buffer, usable to walk
/// from some starting key to the present write position. `good()` goes
/// false once the iterator has been advanced past what was the write index
/// at positioning time, signalling that the underlying data moved on
/// (spec.md §4.3, "Iterator").
pub trait LatencyBufferIterator<P: Payload> {
    /// True while the iterator still points at a live, readable entry.
    fn good(&self) -> bool;
    /// Advances to the next entry. A no-op once `good()` is false.
    fn advance(&mut self);
    /// The entry the iterator currently points at, if `good()`.
    fn current(&self) -> Option<&P>;
}

/// Shared contract implemented by both latency-buffer variants
/// (spec.md §4.3).
pub trait LatencyBuffer<P: Payload> {
    type Iter<'a>: LatencyBufferIterator<P>
    where
        Self: 'a;

    /// Appends `p`. Returns `false` (and bumps the overflow counter) on a
    /// full ring or a duplicate key in the skip list. Single producer.
    fn write(&self, p: P) -> bool;

    /// Moves the oldest entry into `out`, returning `false` if empty.
    /// Single consumer.
    fn read(&self, out: &mut P) -> bool;

    /// Calls `f` with the oldest entry, if any, while whatever keeps that
    /// entry alive (an epoch guard, for the skip-list variant) is still
    /// held. A plain `Option<&P>` accessor cannot express this for every
    /// variant: the skip list's entries are only pinned for the lifetime of
    /// the guard `SkipMap::front()` returns, not for the lifetime of `&self`.
    fn with_front<R>(&self, f: impl FnOnce(&P) -> R) -> Option<R>;

    /// Calls `f` with the newest entry, if any. See [`Self::with_front`].
    fn with_back<R>(&self, f: impl FnOnce(&P) -> R) -> Option<R>;

    /// Drops the `n` oldest entries. This is what the cleanup protocol
    /// (spec.md §4.5.4) and normal steady-state reclamation use.
    fn pop(&self, n: usize);

    /// Drops the `n` newest entries. Exposed because the original skip-list
    /// model's generic `pop()` removed from the tail (newest) while its
    /// only real caller removed from the head (oldest) directly -- spec.md
    /// §9 resolves the ambiguity by exposing both and leaving the choice to
    /// the request handler, which defaults to [`LatencyBuffer::pop`].
    fn pop_newest(&self, n: usize);

    /// Approximate occupancy, consistent when read from a single thread.
    fn occupancy(&self) -> usize;

    /// Positions an iterator at the earliest entry with key >= `key`, or at
    /// "end" if none exists. `with_errors` forces the binary-search
    /// fallback on the fixed-rate variant (spec.md §4.3.1).
    fn lower_bound(&self, key: u64, with_errors: bool) -> Self::Iter<'_>;

    /// Drains the buffer entirely.
    fn flush(&self);
}
