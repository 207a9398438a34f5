//! C7 (emulator half): replays a file of packed payloads at a configured
//! rate (spec.md §4.7). Grounded on `SourceEmulatorModel`; `RateLimiter`
//! becomes a plain busy-wait/sleep hybrid, `FileSourceBuffer` becomes
//! [`FileSourceBuffer`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{EmulatorConfig, SetT0};
use crate::issues::{ComponentId, ReadoutIssue, ReadoutWarning};
use crate::payload::Payload;

/// A payload type the emulator can manufacture from a raw byte slice read
/// off disk. Kept separate from [`Payload`] because most payload types
/// (including every test fixture in this crate) have no need to round-trip
/// through an on-disk byte layout; only a concrete production frame type
/// wired into `readout-cli` need implement it.
pub trait EmulatedPayload: Payload {
    /// Builds a payload by copying `bytes` (exactly `frame_size * num_frames`
    /// long) into fresh storage, mirroring the original's `memcpy` from the
    /// source file buffer into a stack `ReadoutType`.
    fn from_raw_bytes(bytes: &[u8], frame_size: usize, num_frames: u16) -> Self;
}

/// Sender of manufactured payloads to the raw-input channel (spec.md §6).
pub trait RawSender<P>: Send + Sync {
    fn send(&self, payload: P, timeout: Duration) -> bool;
}

/// Reads a flat file of fixed-size elements into memory once, exposing it
/// as a cyclic source of raw byte blocks (spec.md §4.7). Grounded on
/// `FileSourceBuffer`.
pub struct FileSourceBuffer {
    data: Vec<u8>,
    element_size: usize,
}

impl FileSourceBuffer {
    pub fn read(path: &std::path::Path, element_size: usize, size_limit: usize, component: ComponentId) -> Result<Self, ReadoutIssue> {
        let mut data = std::fs::read(path).map_err(|e| ReadoutIssue::ConfigurationError {
            component,
            reason: format!("cannot read emulator source file {}: {e}", path.display()),
        })?;
        if size_limit > 0 && data.len() > size_limit {
            data.truncate(size_limit);
        }
        let usable = (data.len() / element_size) * element_size;
        data.truncate(usable);
        if data.is_empty() {
            return Err(ReadoutIssue::ConfigurationError {
                component,
                reason: "emulator source file contains no whole elements".to_string(),
            });
        }
        Ok(Self { data, element_size })
    }

    pub fn num_elements(&self) -> usize {
        self.data.len() / self.element_size
    }

    fn element(&self, index: usize) -> &[u8] {
        let start = index * self.element_size;
        &self.data[start..start + self.element_size]
    }
}

/// A busy-wait/sleep rate limiter targeting `rate_khz` logical ticks per
/// millisecond (spec.md §4.7).
struct RateLimiter {
    period: Duration,
    next_due: std::sync::Mutex<Instant>,
}

impl RateLimiter {
    fn new(rate_khz: f64) -> Self {
        let period = if rate_khz > 0.0 {
            Duration::from_secs_f64(1.0 / (rate_khz * 1000.0))
        } else {
            Duration::from_millis(1)
        };
        Self {
            period,
            next_due: std::sync::Mutex::new(Instant::now() + period),
        }
    }

    fn limit(&self) {
        let mut next_due = self.next_due.lock().unwrap();
        let now = Instant::now();
        if *next_due > now {
            let remaining = *next_due - now;
            if remaining > Duration::from_micros(100) {
                std::thread::sleep(remaining - Duration::from_micros(50));
            }
            while Instant::now() < *next_due {
                std::hint::spin_loop();
            }
        }
        *next_due = (*next_due).max(now) + self.period;
    }
}

/// Replays a payload stream for one link at a configured rate, with
/// dropout and frame-error injection (spec.md §4.7).
pub struct SourceEmulator<P: EmulatedPayload> {
    component: ComponentId,
    sender: Arc<dyn RawSender<P>>,
    conf: EmulatorConfig,
    source: FileSourceBuffer,
    dropouts: Vec<bool>,
    error_bits: Vec<u16>,

    run_marker: Arc<AtomicBool>,
    packet_count: AtomicU64,
    packet_count_total: AtomicU64,
    handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<P: EmulatedPayload> SourceEmulator<P> {
    pub fn new(component: ComponentId, sender: Arc<dyn RawSender<P>>, conf: EmulatorConfig) -> Result<Self, ReadoutIssue> {
        let frame_size = std::mem::size_of::<P>().max(1);
        let source = FileSourceBuffer::read(&conf.data_file, frame_size, conf.input_file_size_limit, component)?;

        let mut rng = StdRng::from_entropy();
        let population = conf.random_population_size.max(1);
        let dropouts: Vec<bool> = if conf.dropout_rate == 0.0 {
            vec![true]
        } else {
            (0..population).map(|_| rng.gen::<f64>() >= conf.dropout_rate).collect()
        };

        let error_bits = generate_error_bit_stream(&mut rng, population, conf.frame_error_rate_hz, conf.rate_khz);

        Ok(Self {
            component,
            sender,
            conf,
            source,
            dropouts,
            error_bits,
            run_marker: Arc::new(AtomicBool::new(false)),
            packet_count: AtomicU64::new(0),
            packet_count_total: AtomicU64::new(0),
            handle: parking_lot::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.run_marker.store(true, Ordering::SeqCst);
        self.packet_count.store(0, Ordering::SeqCst);
        let this = Arc::clone(self);
        *self.handle.lock() = Some(std::thread::spawn(move || this.run_produce()));
    }

    pub fn stop(&self) {
        self.run_marker.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_produce(&self) {
        let limiter = RateLimiter::new(self.conf.rate_khz);
        let frame_size = std::mem::size_of::<P>().max(1);
        let num_frames = self.conf.frames_per_tick;

        let mut offset = 0usize;
        let mut dropout_index = 0usize;
        let mut error_index = 0usize;
        let num_elem = self.source.num_elements();

        let mut timestamp = match self.conf.set_t0 {
            SetT0::Value(v) => v,
            SetT0::Now => now_epoch_ticks(),
            SetT0::None => 0,
        };
        let tick_diff = P::EXPECTED_TICK_DIFFERENCE;
        let mut time_to_wait = 0u64;

        while self.run_marker.load(Ordering::SeqCst) {
            if offset >= num_elem {
                offset = 0;
            }

            let create_frame = self.dropouts[dropout_index];
            dropout_index = (dropout_index + 1) % self.dropouts.len();

            if create_frame {
                let bytes = self.source.element(offset);
                let mut payload = P::from_raw_bytes(bytes, frame_size, num_frames);
                payload.set_timestamps(timestamp, tick_diff);
                payload.set_geo(0, 0, self.component as u16);

                let mut errs = Vec::with_capacity(num_frames as usize);
                for _ in 0..num_frames {
                    errs.push(self.error_bits[error_index]);
                    error_index = (error_index + 1) % self.error_bits.len();
                }
                payload.set_errors(&errs);

                if self.conf.generate_periodic_adc_pattern {
                    if time_to_wait == 0 {
                        payload.set_adc_pattern(0);
                        time_to_wait = 1000;
                    } else {
                        time_to_wait -= 1;
                    }
                }

                if !self.sender.send(payload, Duration::from_millis(100)) {
                    ReadoutWarning::CannotWriteToQueue {
                        component: self.component,
                        queue: "raw data input queue".to_string(),
                    }
                    .log();
                }

                offset += 1;
                self.packet_count.fetch_add(1, Ordering::Relaxed);
                self.packet_count_total.fetch_add(1, Ordering::Relaxed);
            }

            timestamp += tick_diff * num_frames as u64;
            limiter.limit();
        }
    }

    /// Returns `(new_since_last_call, total)`, resetting the first
    /// (spec.md §4.6-style `get_info` convention applied to C7).
    pub fn get_info(&self) -> (u64, u64) {
        (self.packet_count.swap(0, Ordering::Relaxed), self.packet_count_total.load(Ordering::Relaxed))
    }
}

/// Draws one independent Bernoulli sample per tick at the probability that
/// yields `rate_hz` errors per second given ticks arrive at `rate_khz * 1000`
/// Hz (grounded on `SourceEmulatorModel`'s own per-frame error draw; a flat
/// density over the population window would drift from `rate_hz` as
/// `rate_khz` changes).
fn generate_error_bit_stream(rng: &mut StdRng, population: usize, rate_hz: f64, rate_khz: f64) -> Vec<u16> {
    if rate_hz <= 0.0 {
        return vec![0];
    }
    let ticks_per_second = (rate_khz * 1000.0).max(1.0);
    let density = (rate_hz / ticks_per_second).clamp(0.0, 1.0);
    (0..population.max(1))
        .map(|_| if rng.gen::<f64>() < density { 1u16 } else { 0u16 })
        .collect()
}

fn now_epoch_ticks() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct FixedPayload {
        ts: u64,
        data: [u8; 8],
    }

    impl Payload for FixedPayload {
        const EXPECTED_TICK_DIFFERENCE: u64 = 25;
        fn first_timestamp(&self) -> u64 {
            self.ts
        }
        fn num_frames(&self) -> u16 {
            1
        }
        fn frame_size(&self) -> usize {
            8
        }
        fn begin(&self) -> *const u8 {
            self.data.as_ptr()
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

    impl EmulatedPayload for FixedPayload {
        fn from_raw_bytes(bytes: &[u8], _frame_size: usize, _num_frames: u16) -> Self {
            let mut data = [0u8; 8];
            let n = bytes.len().min(8);
            data[..n].copy_from_slice(&bytes[..n]);
            Self { ts: 0, data }
        }
    }

    struct CollectingSender {
        sent: StdMutex<Vec<FixedPayload>>,
    }

    impl RawSender<FixedPayload> for CollectingSender {
        fn send(&self, payload: FixedPayload, _timeout: Duration) -> bool {
            self.sent.lock().unwrap().push(payload);
            true
        }
    }

    #[test]
    fn file_source_buffer_truncates_to_whole_elements() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().write_all(&[0u8; 20]).unwrap();
        let source = FileSourceBuffer::read(tmp.path(), 8, 0, 1).unwrap();
        assert_eq!(source.num_elements(), 2);
    }

    #[test]
    fn emulator_emits_payloads_with_monotonic_timestamps() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().write_all(&[7u8; 64]).unwrap();

        let mut conf = EmulatorConfig::default();
        conf.data_file = tmp.path().to_path_buf();
        conf.rate_khz = 1000.0;
        conf.frames_per_tick = 1;
        conf.dropout_rate = 0.0;

        let sender = Arc::new(CollectingSender { sent: StdMutex::new(Vec::new()) });
        let emulator = Arc::new(SourceEmulator::<FixedPayload>::new(1, sender.clone(), conf).unwrap());
        emulator.start();
        std::thread::sleep(Duration::from_millis(50));
        emulator.stop();

        let sent = sender.sent.lock().unwrap();
        assert!(!sent.is_empty());
        for window in sent.windows(2) {
            assert!(window[1].ts >= window[0].ts);
        }
    }
}
