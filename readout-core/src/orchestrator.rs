//! C6: readout orchestrator (spec.md §4.6).
//!
//! Owns one link end to end: the frame-error registry, latency buffer,
//! raw-data processor and request handler, plus the consumer and timesync
//! threads that drive them. Grounded on `ReadoutModel`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::counters::{OrchestratorCounters, OrchestratorCountersSnapshot};
use crate::issues::{ComponentId, RequestSourceIdMismatch};
use crate::latency_buffer::{LatencyBuffer, LatencyBufferIterator};
use crate::payload::Payload;
use crate::processor::Processor;
use crate::request_handler::RequestHandler;
use crate::timesync::TimeSync;
use crate::transport::{DataRequest, DataRequestReceiver, RawReceiver, TimeSyncSender};

/// Wires a [`RawReceiver`], a [`Processor`], a [`LatencyBuffer`] and a
/// [`RequestHandler`] into one running link, and owns their consumer and
/// timesync threads (spec.md §4.6).
pub struct Orchestrator<P: Payload, L: LatencyBuffer<P> + Send + Sync + 'static> {
    component: ComponentId,
    raw_receiver: Arc<dyn RawReceiver<P>>,
    data_request_receiver: Arc<dyn DataRequestReceiver>,
    timesync_sender: Arc<dyn TimeSyncSender>,
    buffer: Arc<L>,
    processor: Arc<Processor<P>>,
    request_handler: Arc<RequestHandler<P, L>>,

    counters: OrchestratorCounters,
    run_marker: Arc<AtomicBool>,
    run_number: AtomicU32,
    fake_trigger: AtomicBool,
    source_queue_timeout_ms: AtomicU64,
    post_processing_delay_ticks: AtomicU64,
    processed_up_to_ts: AtomicU64,

    consumer_handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    timesync_handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<P: Payload, L: LatencyBuffer<P> + Send + Sync + 'static> Orchestrator<P, L> {
    pub fn new(
        component: ComponentId,
        raw_receiver: Arc<dyn RawReceiver<P>>,
        data_request_receiver: Arc<dyn DataRequestReceiver>,
        timesync_sender: Arc<dyn TimeSyncSender>,
        buffer: Arc<L>,
        processor: Arc<Processor<P>>,
        request_handler: Arc<RequestHandler<P, L>>,
    ) -> Self {
        Self {
            component,
            raw_receiver,
            data_request_receiver,
            timesync_sender,
            buffer,
            processor,
            request_handler,
            counters: OrchestratorCounters::default(),
            run_marker: Arc::new(AtomicBool::new(false)),
            run_number: AtomicU32::new(1),
            fake_trigger: AtomicBool::new(false),
            source_queue_timeout_ms: AtomicU64::new(100),
            post_processing_delay_ticks: AtomicU64::new(0),
            processed_up_to_ts: AtomicU64::new(0),
            consumer_handle: parking_lot::Mutex::new(None),
            timesync_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn conf(&self, source_queue_timeout_ms: u64, fake_trigger: bool, post_processing_delay_ticks: u64) {
        self.source_queue_timeout_ms.store(source_queue_timeout_ms, Ordering::Relaxed);
        self.fake_trigger.store(fake_trigger, Ordering::Relaxed);
        self.post_processing_delay_ticks.store(post_processing_delay_ticks, Ordering::Relaxed);
    }

    /// Spawns the consumer and timesync threads, starts C4/C5, and
    /// registers the request-dispatch callback (spec.md §4.6). Strict
    /// start order: downstream components first, then the callback that
    /// can start delivering requests.
    pub fn start(self: &Arc<Self>, run_number: u32) {
        self.run_number.store(run_number, Ordering::SeqCst);
        self.run_marker.store(true, Ordering::SeqCst);

        self.processor.start();
        self.request_handler.start();

        let consumer_this = Arc::clone(self);
        *self.consumer_handle.lock() = Some(std::thread::spawn(move || consumer_this.run_consume()));

        let timesync_this = Arc::clone(self);
        *self.timesync_handle.lock() = Some(std::thread::spawn(move || timesync_this.run_timesync()));

        let dispatch_this = Arc::clone(self);
        self.data_request_receiver
            .register_callback(Arc::new(move |dr: DataRequest| dispatch_this.dispatch_request(dr)));
    }

    /// Strict stop order (spec.md §4.6): remove the request callback first
    /// so no new requests enter, stop C5, join timesync, join consumer,
    /// flush the buffer, stop C4.
    pub fn stop(&self) {
        self.data_request_receiver.remove_callback();
        self.run_marker.store(false, Ordering::SeqCst);

        self.request_handler.stop();

        if let Some(handle) = self.timesync_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.consumer_handle.lock().take() {
            let _ = handle.join();
        }

        self.buffer.flush();
        self.processor.stop();
    }

    fn dispatch_request(&self, dr: DataRequest) {
        if dr.component != self.component {
            RequestSourceIdMismatch {
                component: self.component,
                requested: dr.component,
            }
            .log();
            return;
        }
        self.request_handler.issue_request(dr);
    }

    fn run_consume(&self) {
        let timeout = Duration::from_millis(self.source_queue_timeout_ms.load(Ordering::Relaxed));
        while self.run_marker.load(Ordering::SeqCst) {
            let Some(mut payload) = self.raw_receiver.try_receive(timeout) else {
                continue;
            };
            self.processor.invoke_preprocess(&mut payload);
            if !self.buffer.write(payload) {
                self.counters.payloads_overwritten.inc();
            }
            self.run_postprocessing_step();
            self.counters.packets_processed.inc();
        }
    }

    /// Runs the post-pipeline over whatever became eligible since the last
    /// call (spec.md §4.6). With `post_processing_delay_ticks` at 0, this is
    /// just the newest entry, same as before. With a non-zero delay `D`,
    /// post-processing is batched: `processed_up_to_ts` tracks how far the
    /// buffer has already been drained through the post-pipeline, and every
    /// buffered entry with `first_timestamp < newest - D` that has not yet
    /// been processed is walked and handed to [`Processor::postprocess`] in
    /// order.
    fn run_postprocessing_step(&self) {
        let delay = self.post_processing_delay_ticks.load(Ordering::Relaxed);
        if delay == 0 {
            self.buffer.with_back(|back| self.processor.postprocess(back));
            return;
        }

        let Some(newest) = self.buffer.with_back(|back| back.first_timestamp()) else {
            return;
        };
        let horizon = newest.saturating_sub(delay);
        let start = self.processed_up_to_ts.load(Ordering::Relaxed);

        let mut iter = self.buffer.lower_bound(start, false);
        let mut advanced_to = start;
        while iter.good() {
            let Some(entry) = iter.current() else { break };
            let ts = entry.first_timestamp();
            if ts >= horizon {
                break;
            }
            self.processor.postprocess(entry);
            advanced_to = ts + P::EXPECTED_TICK_DIFFERENCE * entry.num_frames() as u64;
            iter.advance();
        }
        if advanced_to > start {
            self.processed_up_to_ts.store(advanced_to, Ordering::Relaxed);
        }
    }

    /// Emits a `TimeSync` every 100 ms, checked in 10 ms slices for prompt
    /// stop (spec.md §4.6). Optionally synthesises fake data requests.
    fn run_timesync(&self) {
        let mut sequence_number = 0u64;
        let mut prev_timestamp = 0u64;
        let pid = std::process::id();

        while self.run_marker.load(Ordering::SeqCst) {
            let daq_time = self.processor.last_daq_time();
            if daq_time != 0 && daq_time != prev_timestamp {
                prev_timestamp = daq_time;
                sequence_number += 1;
                let sync = TimeSync {
                    daq_time,
                    system_time: now_epoch_us(),
                    run_number: self.run_number.load(Ordering::SeqCst),
                    sequence_number,
                    source_pid: pid,
                };
                if !self.timesync_sender.send(sync, Duration::from_millis(500)) {
                    crate::issues::ReadoutWarning::TimeSyncTransmissionFailed {
                        component: self.component,
                        destination: "timesync_output".to_string(),
                    }
                    .log();
                }

                if self.fake_trigger.load(Ordering::SeqCst) {
                    let window_begin = daq_time.saturating_sub(500);
                    let window_end = window_begin + 300_000;
                    self.request_handler.issue_request(DataRequest {
                        component: self.component,
                        trigger_number: sequence_number,
                        sequence_number: 0,
                        run_number: self.run_number.load(Ordering::SeqCst),
                        window_begin,
                        window_end,
                        allow_partial: false,
                        data_destination: "data_fragments_q".to_string(),
                    });
                }
            }

            for _ in 0..10 {
                std::thread::sleep(Duration::from_millis(10));
                if !self.run_marker.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    pub fn get_info(&self) -> OrchestratorCountersSnapshot {
        self.counters.snapshot()
    }
}

fn now_epoch_us() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
