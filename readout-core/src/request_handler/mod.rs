//! C5: request handler (spec.md §4.5), the most behaviourally dense
//! component. Grounded on `DefaultRequestHandlerModel`: request matching
//! (§4.5.2), zero-copy fragment assembly ([`fragment`]), the cleanup
//! protocol (§4.5.4), recording ([`recording`]), and the empty-fragment
//! specialisation ([`empty`]).

pub mod empty;
pub mod fragment;
pub mod recording;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::{CompressionAlgorithm, RequestHandlerConfig, RecordingConfig};
use crate::counters::{RequestHandlerCounters, RequestHandlerCountersSnapshot};
use crate::error_registry::FrameErrorRegistry;
use crate::issues::{ComponentId, ReadoutIssue, ReadoutWarning};
use crate::latency_buffer::{LatencyBuffer, LatencyBufferIterator};
use crate::payload::Payload;
use crate::transport::{error_bits, DataRequest, Fragment, FragmentSender};

use fragment::{get_fragment_pieces, PiecesResult};
use recording::BufferedWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Found,
    NotFound,
    NotYet,
}

struct CleanupState {
    requests_running: usize,
    cleanup_requested: bool,
}

struct WaitingRequest {
    request: DataRequest,
    arrived: Instant,
}

/// Trigger-matching request handler for one link, generic over its
/// payload type `P` and concrete latency-buffer backing `L`.
pub struct RequestHandler<P: Payload, L: LatencyBuffer<P>> {
    component: ComponentId,
    buffer: Arc<L>,
    registry: Arc<FrameErrorRegistry>,
    fragment_sender: Arc<dyn FragmentSender>,

    conf: Mutex<RequestHandlerConfig>,
    pop_limit_size: AtomicU64,

    counters: RequestHandlerCounters,
    cleanup_state: Mutex<CleanupState>,
    condvar: Condvar,

    waiting_requests: Mutex<Vec<WaitingRequest>>,

    recording: AtomicBool,
    next_timestamp_to_record: AtomicU64,
    writer: Mutex<Option<BufferedWriter>>,
    recording_conf: Mutex<RecordingConfig>,
    recording_handle: Mutex<Option<std::thread::JoinHandle<()>>>,

    run_marker: Arc<AtomicBool>,
    request_tx: Mutex<Option<Sender<DataRequest>>>,
    pool_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    watcher_handle: Mutex<Option<std::thread::JoinHandle<()>>>,

    _marker: PhantomData<P>,
}

impl<P: Payload, L: LatencyBuffer<P> + Send + Sync + 'static> RequestHandler<P, L> {
    pub fn new(
        component: ComponentId,
        buffer: Arc<L>,
        registry: Arc<FrameErrorRegistry>,
        fragment_sender: Arc<dyn FragmentSender>,
    ) -> Self {
        Self {
            component,
            buffer,
            registry,
            fragment_sender,
            conf: Mutex::new(RequestHandlerConfig::default()),
            pop_limit_size: AtomicU64::new(0),
            counters: RequestHandlerCounters::default(),
            cleanup_state: Mutex::new(CleanupState {
                requests_running: 0,
                cleanup_requested: false,
            }),
            condvar: Condvar::new(),
            waiting_requests: Mutex::new(Vec::new()),
            recording: AtomicBool::new(false),
            next_timestamp_to_record: AtomicU64::new(0),
            writer: Mutex::new(None),
            recording_conf: Mutex::new(RecordingConfig::default()),
            recording_handle: Mutex::new(None),
            run_marker: Arc::new(AtomicBool::new(false)),
            request_tx: Mutex::new(None),
            pool_handles: Mutex::new(Vec::new()),
            cleanup_handle: Mutex::new(None),
            watcher_handle: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Records the pop-limit/pop-size percentages, thread-pool size,
    /// per-request timeout, recording settings (spec.md §4.5.1).
    pub fn conf(&self, buffer_capacity: usize, handler_conf: RequestHandlerConfig, recording_conf: RecordingConfig) -> Result<(), ReadoutIssue> {
        if !(0.0..=1.0).contains(&handler_conf.pop_limit_pct) || !(0.0..=1.0).contains(&handler_conf.pop_size_pct) {
            return Err(ReadoutIssue::ConfigurationError {
                component: self.component,
                reason: "auto-pop percentage out of range".to_string(),
            });
        }
        let pop_limit_size = (handler_conf.pop_limit_pct * buffer_capacity as f32) as u64;
        self.pop_limit_size.store(pop_limit_size, Ordering::Relaxed);

        if recording_conf.enable_raw_recording {
            let _ = std::fs::remove_file(&recording_conf.output_file);
            let writer = BufferedWriter::open(
                self.component,
                &recording_conf.output_file,
                recording_conf.stream_buffer_size,
                recording_conf.compression_algorithm,
                recording_conf.use_o_direct,
            )?;
            *self.writer.lock() = Some(writer);
        }
        *self.recording_conf.lock() = recording_conf;
        *self.conf.lock() = handler_conf;
        Ok(())
    }

    pub fn scrap(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.close();
        }
    }

    /// Spawns the request-handler thread pool, the cleanup thread, and the
    /// waiting-request watcher (spec.md §4.5.1).
    pub fn start(self: &Arc<Self>) {
        self.run_marker.store(true, Ordering::SeqCst);
        let num_threads = self.conf.lock().num_request_handling_threads.max(1);

        let (tx, rx) = crossbeam_channel::unbounded::<DataRequest>();
        *self.request_tx.lock() = Some(tx);

        let mut handles = self.pool_handles.lock();
        for _ in 0..num_threads {
            let this = Arc::clone(self);
            let rx = rx.clone();
            handles.push(std::thread::spawn(move || this.run_worker(rx)));
        }
        drop(handles);

        let cleanup_this = Arc::clone(self);
        *self.cleanup_handle.lock() = Some(std::thread::spawn(move || cleanup_this.run_periodic_cleanups()));

        let watcher_this = Arc::clone(self);
        *self.watcher_handle.lock() = Some(std::thread::spawn(move || watcher_this.run_waiting_watcher()));
    }

    /// Strict stop order: drop the request channel so workers drain and
    /// exit, join the cleanup thread, join the watcher (which drains
    /// waiting requests first), join the worker pool.
    pub fn stop(&self) {
        self.run_marker.store(false, Ordering::SeqCst);
        *self.request_tx.lock() = None;

        if let Some(handle) = self.cleanup_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.watcher_handle.lock().take() {
            let _ = handle.join();
        }
        for handle in self.pool_handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Dispatches `dr` onto the worker pool (spec.md §4.5.1).
    pub fn issue_request(&self, dr: DataRequest) {
        if let Some(tx) = self.request_tx.lock().as_ref() {
            let _ = tx.send(dr);
        }
    }

    fn run_worker(self: Arc<Self>, rx: Receiver<DataRequest>) {
        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(dr) => self.process_request(dr),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.run_marker.load(Ordering::SeqCst) && rx.is_empty() {
                break;
            }
        }
    }

    /// Begins an on-disk capture for `duration`. Rejected as a command
    /// error if a recording is already running or the writer was never
    /// configured (spec.md §4.5.1).
    pub fn record(self: &Arc<Self>, duration: Duration) -> Result<(), ReadoutIssue> {
        if self.recording.load(Ordering::SeqCst) {
            return Err(ReadoutIssue::CommandError {
                component: self.component,
                reason: "a recording is still running".to_string(),
            });
        }
        if self.writer.lock().is_none() {
            return Err(ReadoutIssue::CommandError {
                component: self.component,
                reason: "not configured for recording".to_string(),
            });
        }

        let this = Arc::clone(self);
        *self.recording_handle.lock() = Some(std::thread::spawn(move || this.run_recording(duration)));
        Ok(())
    }

    fn run_recording(&self, duration: Duration) {
        self.recording.store(true, Ordering::SeqCst);
        self.next_timestamp_to_record.store(0, Ordering::SeqCst);
        let deadline = Instant::now() + duration;

        while Instant::now() < deadline {
            let mut next_ts = self.next_timestamp_to_record.load(Ordering::SeqCst);
            if next_ts == 0 {
                if let Some(ts) = self.buffer.with_front(|front| front.first_timestamp()) {
                    next_ts = ts;
                    self.next_timestamp_to_record.store(next_ts, Ordering::SeqCst);
                } else {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }

            self.with_cleanup_guard(|| {
                let mut iter = self.buffer.lower_bound(next_ts, true);
                let mut processed = 0usize;
                while iter.good() && processed < 1000 {
                    let Some(entry) = iter.current() else { break };
                    if entry.first_timestamp() >= next_ts {
                        // SAFETY: held under the cleanup guard, so this slot
                        // is not reclaimed by cleanup concurrently.
                        let bytes = unsafe { std::slice::from_raw_parts(entry.begin(), entry.payload_size()) };
                        let mut writer = self.writer.lock();
                        if let Some(w) = writer.as_mut() {
                            if !w.write(bytes) {
                                ReadoutWarning::CannotWriteToFile {
                                    component: self.component,
                                    file: self.recording_conf.lock().output_file.display().to_string(),
                                }
                                .log();
                            }
                        }
                        self.counters.payloads_recorded.inc();
                        processed += 1;
                        let next = entry.first_timestamp() + P::EXPECTED_TICK_DIFFERENCE * entry.num_frames() as u64;
                        self.next_timestamp_to_record.store(next, Ordering::SeqCst);
                    }
                    iter.advance();
                }
            });
        }

        self.next_timestamp_to_record.store(u64::MAX, Ordering::SeqCst);
        self.recording.store(false, Ordering::SeqCst);
        if let Some(w) = self.writer.lock().as_mut() {
            w.flush();
        }
    }

    /// Scheduled every 50 ms by the cleanup thread (spec.md §4.5.4).
    pub fn cleanup_check(&self) {
        let mut state = self.cleanup_state.lock();
        if self.buffer.occupancy() as u64 > self.pop_limit_size.load(Ordering::Relaxed) && !state.cleanup_requested {
            state.cleanup_requested = true;
            self.condvar.wait_while(&mut state, |s| s.requests_running != 0);
            drop(state);
            self.cleanup();
            let mut state = self.cleanup_state.lock();
            state.cleanup_requested = false;
            self.condvar.notify_all();
        }
    }

    fn cleanup(&self) {
        let occupancy = self.buffer.occupancy();
        let pop_limit_size = self.pop_limit_size.load(Ordering::Relaxed) as usize;
        if occupancy > pop_limit_size {
            self.counters.pop_reqs.inc();
            let to_pop = (self.conf.lock().pop_size_pct * occupancy as f32) as usize;
            let recording_floor = if self.recording.load(Ordering::SeqCst) {
                Some(self.next_timestamp_to_record.load(Ordering::SeqCst))
            } else {
                None
            };

            let mut popped = 0usize;
            for _ in 0..to_pop {
                let Some(front_ts) = self.buffer.with_front(|front| front.first_timestamp()) else { break };
                if let Some(floor) = recording_floor {
                    if front_ts >= floor {
                        break;
                    }
                }
                self.buffer.pop(1);
                popped += 1;
            }
            self.counters.pops_count.add(popped as u64);
            if let Some(ts) = self.buffer.with_front(|front| front.first_timestamp()) {
                self.registry.remove_errors_until(ts);
            }
        }
        self.counters.num_buffer_cleanups.inc();
    }

    fn run_periodic_cleanups(&self) {
        while self.run_marker.load(Ordering::SeqCst) {
            self.cleanup_check();
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Re-issues waiting requests whose window has closed, and force-times
    /// out any whose age exceeds the configured timeout (spec.md §4.5.2).
    /// Sleeps in 10 ms slices and continues draining after stop (spec.md
    /// §4.5.8).
    fn run_waiting_watcher(self: &Arc<Self>) {
        loop {
            let newest = self.buffer.with_back(|b| b.first_timestamp()).unwrap_or(0);
            let timeout_ms = self.conf.lock().request_timeout_ms as u128;
            let warn_on_timeout = self.conf.lock().warn_on_timeout;

            let mut reissue = Vec::new();
            let mut timed_out_requests = Vec::new();
            {
                let mut waiting = self.waiting_requests.lock();
                let mut i = 0;
                while i < waiting.len() {
                    let window_closed = waiting[i].request.window_end < newest;
                    let timed_out = waiting[i].arrived.elapsed().as_millis() >= timeout_ms;
                    if window_closed {
                        reissue.push(waiting.swap_remove(i).request);
                    } else if timed_out {
                        let entry = waiting.swap_remove(i);
                        self.counters.requests_bad.inc();
                        self.counters.requests_timed_out.inc();
                        if warn_on_timeout {
                            ReadoutWarning::VerboseRequestTimedOut {
                                component: self.component,
                                trigger_number: entry.request.trigger_number,
                                sequence_number: entry.request.sequence_number,
                                run_number: entry.request.run_number,
                                window_begin: entry.request.window_begin,
                                window_end: entry.request.window_end,
                            }
                            .log();
                        }
                        timed_out_requests.push(entry.request);
                    } else {
                        i += 1;
                    }
                }
            }
            // Window closed: the data the request was waiting on has since
            // arrived (or the buffer has moved past it), so re-run it
            // through the normal matching path.
            for request in reissue {
                self.issue_request(request);
            }
            // Timed out: force a partial-or-empty answer now rather than
            // matching again, which would just observe the same `NotYet`
            // state and wait forever (spec.md §4.5.2, "Found-partial or
            // bad").
            for request in timed_out_requests {
                self.force_timeout_response(request);
            }

            if !self.run_marker.load(Ordering::SeqCst) && self.waiting_requests.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Answers a timed-out waiting request directly: re-matches it with
    /// `allow_partial` forced on so whatever overlaps the window (possibly
    /// nothing) is returned, always marked `INCOMPLETE` (spec.md §4.5.2,
    /// §4.5.6).
    fn force_timeout_response(&self, dr: DataRequest) {
        let mut forced = dr.clone();
        forced.allow_partial = true;
        let (_, error_bits, body) = self.with_cleanup_guard(|| self.categorize_and_assemble(&forced));
        let fragment = Fragment {
            component: dr.component,
            trigger_number: dr.trigger_number,
            sequence_number: dr.sequence_number,
            run_number: dr.run_number,
            window_begin: dr.window_begin,
            window_end: dr.window_end,
            error_bits: error_bits | error_bits::INCOMPLETE,
            body,
        };
        if !self.fragment_sender.send(&dr.data_destination, fragment, Duration::from_millis(10)) {
            ReadoutWarning::CannotWriteToQueue {
                component: self.component,
                queue: dr.data_destination.clone(),
            }
            .log();
        }
    }

    fn with_cleanup_guard<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.cleanup_state.lock();
            self.condvar.wait_while(&mut state, |s| s.cleanup_requested);
            state.requests_running += 1;
        }
        self.condvar.notify_all();
        let result = f();
        {
            let mut state = self.cleanup_state.lock();
            state.requests_running -= 1;
        }
        self.condvar.notify_all();
        result
    }

    fn process_request(&self, dr: DataRequest) {
        let (kind, error_bits, body) = self.with_cleanup_guard(|| self.categorize_and_assemble(&dr));

        match kind {
            ResultKind::Found | ResultKind::NotFound => {
                if kind == ResultKind::NotFound && (error_bits & error_bits::DATA_NOT_FOUND) != 0 {
                    ReadoutWarning::TrmWithEmptyFragment {
                        component: self.component,
                        detail: format!("trigger {}.{}", dr.trigger_number, dr.sequence_number),
                    }
                    .log();
                }
                let fragment = Fragment {
                    component: dr.component,
                    trigger_number: dr.trigger_number,
                    sequence_number: dr.sequence_number,
                    run_number: dr.run_number,
                    window_begin: dr.window_begin,
                    window_end: dr.window_end,
                    error_bits,
                    body,
                };
                if !self.fragment_sender.send(&dr.data_destination, fragment, Duration::from_millis(10)) {
                    ReadoutWarning::CannotWriteToQueue {
                        component: self.component,
                        queue: dr.data_destination.clone(),
                    }
                    .log();
                }
            }
            ResultKind::NotYet => {
                if self.run_marker.load(Ordering::SeqCst) {
                    self.waiting_requests.lock().push(WaitingRequest {
                        request: dr,
                        arrived: Instant::now(),
                    });
                } else {
                    // run stopping: force a NotFound rather than wait forever
                    self.counters.requests_bad.inc();
                    let fragment = Fragment {
                        component: dr.component,
                        trigger_number: dr.trigger_number,
                        sequence_number: dr.sequence_number,
                        run_number: dr.run_number,
                        window_begin: dr.window_begin,
                        window_end: dr.window_end,
                        error_bits: error_bits::DATA_NOT_FOUND,
                        body: Vec::new(),
                    };
                    let _ = self.fragment_sender.send(&dr.data_destination, fragment, Duration::from_millis(10));
                }
            }
        }
    }

    /// The request-matching table from spec.md §4.5.2, must be called
    /// while holding the cleanup guard (via [`Self::with_cleanup_guard`]).
    fn categorize_and_assemble(&self, dr: &DataRequest) -> (ResultKind, u16, Vec<u8>) {
        let occupancy = self.buffer.occupancy();
        if occupancy == 0 {
            if self.conf.lock().warn_about_empty_buffer {
                ReadoutWarning::RequestOnEmptyBuffer {
                    component: self.component,
                    detail: "data not found".to_string(),
                }
                .log();
            }
            self.counters.requests_not_found.inc();
            return (ResultKind::NotFound, error_bits::DATA_NOT_FOUND, Vec::new());
        }

        let oldest = self.buffer.with_front(|front| front.first_timestamp()).unwrap();
        let newest = self.buffer.with_back(|back| back.first_timestamp()).unwrap();
        let (wb, we) = (dr.window_begin, dr.window_end);
        let allow_partial = dr.allow_partial;

        let assemble = |wb: u64, we: u64| -> PiecesResult { get_fragment_pieces::<P, L>(&*self.buffer, &self.registry, wb, we) };

        if oldest <= wb && we <= newest {
            match assemble(wb, we) {
                PiecesResult::Found(pieces) => {
                    self.counters.requests_found.inc();
                    (ResultKind::Found, 0, unsafe { fragment::copy_pieces(&pieces) })
                }
                PiecesResult::Retry => {
                    self.counters.requests_not_yet.inc();
                    (ResultKind::NotYet, 0, Vec::new())
                }
            }
        } else if allow_partial && oldest <= we && we <= newest {
            match assemble(wb, we) {
                PiecesResult::Found(pieces) => {
                    self.counters.requests_found.inc();
                    (ResultKind::Found, error_bits::INCOMPLETE, unsafe { fragment::copy_pieces(&pieces) })
                }
                PiecesResult::Retry => {
                    self.counters.requests_not_found.inc();
                    (ResultKind::NotFound, error_bits::DATA_NOT_FOUND, Vec::new())
                }
            }
        } else if !allow_partial && oldest > wb {
            self.counters.requests_not_found.inc();
            (ResultKind::NotFound, error_bits::DATA_NOT_FOUND, Vec::new())
        } else if allow_partial && oldest > we {
            self.counters.requests_bad.inc();
            (ResultKind::NotFound, error_bits::DATA_NOT_FOUND, Vec::new())
        } else if newest < we {
            if allow_partial {
                let pieces = match assemble(wb, we) {
                    PiecesResult::Found(p) => p,
                    PiecesResult::Retry => Vec::new(),
                };
                self.counters.requests_found.inc();
                (ResultKind::Found, error_bits::INCOMPLETE, unsafe { fragment::copy_pieces(&pieces) })
            } else {
                self.counters.requests_not_yet.inc();
                (ResultKind::NotYet, 0, Vec::new())
            }
        } else {
            self.counters.requests_bad.inc();
            (ResultKind::NotFound, error_bits::DATA_NOT_FOUND, Vec::new())
        }
    }

    /// Snapshots counters for `get_info` (spec.md §4.5.1).
    pub fn get_info(&self) -> RequestHandlerCountersSnapshot {
        self.counters.snapshot()
    }
}
