//! Shared fixtures for the integration suite: a fixed-size test payload and
//! a `FragmentSender` that captures what it was sent instead of forwarding
//! it anywhere.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use readout_core::payload::Payload;
use readout_core::transport::{DataRequest, Fragment, FragmentSender};

pub const TICK_DIFF: u64 = 25;
pub const FRAME_SIZE: usize = 16;

#[derive(Clone, Copy, Default)]
pub struct TestPayload {
    pub ts: u64,
    pub frames: [u8; FRAME_SIZE],
}

impl TestPayload {
    /// Builds a payload at `ts`, with the timestamp also stamped into the
    /// raw frame bytes so recorded/copied byte streams can be decoded back
    /// into the timestamp sequence they came from.
    pub fn at(ts: u64) -> Self {
        let mut frames = [0u8; FRAME_SIZE];
        frames[0..8].copy_from_slice(&ts.to_le_bytes());
        Self { ts, frames }
    }
}

impl Payload for TestPayload {
    const EXPECTED_TICK_DIFFERENCE: u64 = TICK_DIFF;

    fn first_timestamp(&self) -> u64 {
        self.ts
    }
    fn num_frames(&self) -> u16 {
        1
    }
    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }
    fn begin(&self) -> *const u8 {
        self.frames.as_ptr()
    }
    fn subsystem(&self) -> u16 {
        0
    }
    fn fragment_type(&self) -> u16 {
        0
    }
    fn set_timestamps(&mut self, base: u64, _tick_diff: u64) {
        self.ts = base;
    }
    fn set_geo(&mut self, _c: u16, _s: u16, _l: u16) {}
    fn set_errors(&mut self, _bits: &[u16]) {}
    fn set_adc_pattern(&mut self, _channel: u16) {}
}

/// Captures every fragment handed to it, regardless of `data_destination`.
#[derive(Default)]
pub struct CapturingFragmentSender {
    pub sent: Mutex<Vec<Fragment>>,
}

impl CapturingFragmentSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait_for_one(&self, timeout: Duration) -> Option<Fragment> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(f) = self.sent.lock().unwrap().first().cloned() {
                return Some(f);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl FragmentSender for CapturingFragmentSender {
    fn send(&self, _destination: &str, fragment: Fragment, _timeout: Duration) -> bool {
        self.sent.lock().unwrap().push(fragment);
        true
    }
}

pub fn data_request(window_begin: u64, window_end: u64, allow_partial: bool, component: u32) -> DataRequest {
    DataRequest {
        component,
        trigger_number: 1,
        sequence_number: 0,
        run_number: 1,
        window_begin,
        window_end,
        allow_partial,
        data_destination: "test".to_string(),
    }
}
