//! C1: the payload trait (spec.md §3, §4.1).
//!
//! `Payload` is the narrow capability set the rest of the core needs from a
//! raw transport-level unit: enough to order it, size it, walk its frames,
//! and (for the emulator) stamp synthetic values onto it. The concrete
//! on-wire layout of `P` is out of scope; the core only ever touches it
//! through this trait, monomorphised per link.

/// A pointer/length pair identifying one frame (or a whole payload body)
/// inside a `Payload`'s backing storage. `ptr` is only valid for as long as
/// the latency buffer slot it was taken from is not reclaimed; the request
/// handler's cleanup mutex is what keeps that true for the lifetime of a
/// fragment assembly (spec.md §9, "zero-copy fragment pieces").
#[derive(Debug, Clone, Copy)]
pub struct FramePiece {
    pub ptr: *const u8,
    pub len: usize,
}

// SAFETY: a FramePiece is a raw view into payload storage that outlives it
// for the duration the cleanup mutex guarantees (see request_handler). It
// carries no ownership and is only ever read.
unsafe impl Send for FramePiece {}
unsafe impl Sync for FramePiece {}

/// Capability set required of a raw payload type (spec.md §3).
///
/// Total ordering on `P` is by `(first_timestamp, tie_break_key)`; entries
/// with equal keys are duplicates and must not coexist in a latency buffer
/// (enforced by the buffer, not this trait).
pub trait Payload: Default + Send + 'static {
    /// Tick delta between consecutive frames within a payload, and between
    /// adjacent payloads of the same source. Fixed at compile time per `P`.
    const EXPECTED_TICK_DIFFERENCE: u64;

    /// Monotone-per-source tick count of the first enclosed frame.
    fn first_timestamp(&self) -> u64;

    /// Number of frames carried by this payload.
    fn num_frames(&self) -> u16;

    /// Size in bytes of a single frame.
    fn frame_size(&self) -> usize;

    /// Total byte size of the payload; invariant `payload_size ==
    /// num_frames * frame_size` (spec.md §4.1).
    fn payload_size(&self) -> usize {
        self.num_frames() as usize * self.frame_size()
    }

    /// A secondary key used to break ties when two payloads share a
    /// `first_timestamp` (only meaningful for the skip-list variant, where
    /// insertion order does not imply key order).
    fn tie_break_key(&self) -> u64 {
        0
    }

    /// Pointer to the start of the payload's frame storage, for zero-copy
    /// whole-payload pieces.
    fn begin(&self) -> *const u8;

    /// Timestamp of the `index`-th frame. The default implementation
    /// assumes the compile-time tick invariant in spec.md §4.1 holds;
    /// violations are recorded in the frame-error registry rather than
    /// rejected, so this is never fallible.
    fn frame_timestamp(&self, index: u16) -> u64 {
        self.first_timestamp() + index as u64 * Self::EXPECTED_TICK_DIFFERENCE
    }

    /// Pointer to the start of the `index`-th frame.
    fn frame_ptr(&self, index: u16) -> *const u8 {
        // SAFETY: `index < num_frames()` is an invariant of every caller in
        // this crate (request_handler::fragment walks 0..num_frames).
        unsafe { self.begin().add(index as usize * self.frame_size()) }
    }

    /// Opaque system/subsystem tag carried by the payload.
    fn subsystem(&self) -> u16;

    /// Opaque fragment-type tag carried by the payload.
    fn fragment_type(&self) -> u16;

    /// Synthetic mutator used by the source emulator: stamps a new base
    /// timestamp and tick spacing onto the payload.
    fn set_timestamps(&mut self, base: u64, tick_diff: u64);

    /// Synthetic mutator: stamps geographic/link addressing fields.
    fn set_geo(&mut self, crate_id: u16, slot: u16, link: u16);

    /// Synthetic mutator: stamps per-frame error bits.
    fn set_errors(&mut self, bits: &[u16]);

    /// Synthetic mutator: lifts one ADC channel to its maximum value,
    /// used by the emulator's periodic test-pattern injection.
    fn set_adc_pattern(&mut self, channel: u16);
}
