//! A concrete, fixed-size frame type wiring the demo driver's latency
//! buffer, processor, request handler and emulator to one real `Payload` +
//! `EmulatedPayload` implementation.
//!
//! Kept a plain, fixed-layout (`Copy`) struct on purpose: the emulator
//! reads the source file in `size_of::<P>()`-sized elements, so `P` must
//! have a size that does not depend on its contents.

use readout_core::emulator::EmulatedPayload;
use readout_core::payload::Payload;

const FRAME_BYTES: usize = 32;

#[derive(Clone, Copy)]
pub struct DemoFrame {
    timestamp: u64,
    num_frames: u16,
    crate_id: u16,
    slot: u16,
    link: u16,
    error_bits: u16,
    data: [u8; FRAME_BYTES],
}

impl Default for DemoFrame {
    fn default() -> Self {
        Self {
            timestamp: 0,
            num_frames: 1,
            crate_id: 0,
            slot: 0,
            link: 0,
            error_bits: 0,
            data: [0u8; FRAME_BYTES],
        }
    }
}

impl Payload for DemoFrame {
    const EXPECTED_TICK_DIFFERENCE: u64 = 25;

    fn first_timestamp(&self) -> u64 {
        self.timestamp
    }

    fn num_frames(&self) -> u16 {
        self.num_frames
    }

    fn frame_size(&self) -> usize {
        FRAME_BYTES
    }

    fn begin(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn subsystem(&self) -> u16 {
        0
    }

    fn fragment_type(&self) -> u16 {
        1
    }

    fn set_timestamps(&mut self, base: u64, _tick_diff: u64) {
        self.timestamp = base;
    }

    fn set_geo(&mut self, crate_id: u16, slot: u16, link: u16) {
        self.crate_id = crate_id;
        self.slot = slot;
        self.link = link;
    }

    fn set_errors(&mut self, bits: &[u16]) {
        self.error_bits = bits.iter().fold(0u16, |acc, b| acc | b);
    }

    fn set_adc_pattern(&mut self, channel: u16) {
        let offset = (channel as usize) % self.data.len();
        self.data[offset] = 0xFF;
    }
}

impl EmulatedPayload for DemoFrame {
    fn from_raw_bytes(bytes: &[u8], _frame_size: usize, num_frames: u16) -> Self {
        let mut frame = Self {
            num_frames,
            ..Self::default()
        };
        let n = bytes.len().min(FRAME_BYTES);
        frame.data[..n].copy_from_slice(&bytes[..n]);
        frame
    }
}
