//! C4: raw-data processor (spec.md §4.4).
//!
//! Two pipelines share one payload type `P`: a synchronous pre-pipeline run
//! inline on the consumer thread, and a post-pipeline that fans each
//! payload out to `n` independent worker threads over bounded SPSC queues.
//! Grounded on `TaskRawDataProcessorModel`; `folly::ProducerConsumerQueue`
//! becomes a `crossbeam_channel::bounded` channel, and `ReusableThread`
//! becomes a plain `std::thread::JoinHandle`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::issues::{ComponentId, ReadoutWarning};
use crate::payload::Payload;

/// A pointer into a payload already resident in the latency buffer. Valid
/// for as long as the request handler's cleanup protocol keeps that slot
/// from being reclaimed (spec.md §9, "zero-copy fragment pieces" applies
/// equally to post-processing pointers, which are also payload-lifetime
/// bound).
struct PostPtr<P>(*const P);

// SAFETY: read-only pointer, never dereferenced after the payload's buffer
// slot could have been reclaimed under the cleanup mutex's guarantees.
unsafe impl<P> Send for PostPtr<P> {}

type PreTask<P> = Box<dyn Fn(&mut P) + Send + Sync>;
type PostTask<P> = Box<dyn Fn(&P) + Send + Sync>;

struct PendingPostWorker<P: Payload> {
    receiver: Receiver<PostPtr<P>>,
    task: PostTask<P>,
}

/// The raw-data processor for one link.
pub struct Processor<P: Payload> {
    component: ComponentId,
    pre_tasks: Mutex<Vec<PreTask<P>>>,
    pending_post: Mutex<Vec<PendingPostWorker<P>>>,
    post_senders: Mutex<Vec<Sender<PostPtr<P>>>>,
    post_handles: Mutex<Vec<JoinHandle<()>>>,
    post_queue_capacity: Mutex<usize>,
    run_marker: Arc<AtomicBool>,
    last_daq_time: AtomicU64,
}

impl<P: Payload> Processor<P> {
    pub fn new(component: ComponentId) -> Self {
        Self {
            component,
            pre_tasks: Mutex::new(Vec::new()),
            pending_post: Mutex::new(Vec::new()),
            post_senders: Mutex::new(Vec::new()),
            post_handles: Mutex::new(Vec::new()),
            post_queue_capacity: Mutex::new(64),
            run_marker: Arc::new(AtomicBool::new(false)),
            last_daq_time: AtomicU64::new(0),
        }
    }

    /// Registers a pre-pipeline task, run inline on the consumer thread in
    /// registration order before the payload is handed to the latency
    /// buffer (spec.md §4.4).
    pub fn add_preprocess_task(&self, task: impl Fn(&mut P) + Send + Sync + 'static) {
        self.pre_tasks.lock().unwrap().push(Box::new(task));
    }

    /// Registers a post-pipeline task and its worker's input queue
    /// (created lazily at `conf`, sized by `queue_capacity`).
    pub fn add_postprocess_task(&self, task: impl Fn(&P) + Send + Sync + 'static) {
        self.pending_post.lock().unwrap().push(PendingPostWorker {
            // placeholder receiver, replaced in `conf`
            receiver: bounded(1).1,
            task: Box::new(task),
        });
    }

    /// Creates one bounded channel per registered post task, each of
    /// `queue_capacity` slots (spec.md §4.4). `post_processing_delay_ticks`
    /// (spec.md §6) governs when the orchestrator calls [`Self::postprocess`]
    /// on a buffered entry, not how this queue is sized.
    pub fn conf(&self, queue_capacity: usize) {
        *self.post_queue_capacity.lock().unwrap() = queue_capacity;
        let mut pending = self.pending_post.lock().unwrap();
        let mut senders = self.post_senders.lock().unwrap();
        senders.clear();
        for worker in pending.iter_mut() {
            let (tx, rx) = bounded(queue_capacity);
            worker.receiver = rx;
            senders.push(tx);
        }
    }

    /// Spawns one worker thread per registered post task.
    pub fn start(&self) {
        self.run_marker.store(true, Ordering::SeqCst);
        let mut pending = self.pending_post.lock().unwrap();
        let mut handles = self.post_handles.lock().unwrap();
        for (index, worker) in pending.drain(..).enumerate() {
            let run_marker = Arc::clone(&self.run_marker);
            let component = self.component;
            let PendingPostWorker { receiver, task } = worker;
            handles.push(std::thread::spawn(move || {
                run_post_processing_thread(component, index, run_marker, receiver, task);
            }));
        }
    }

    /// Signals stop and joins every post-processing worker; workers drain
    /// their queues before exiting (spec.md §5).
    pub fn stop(&self) {
        self.run_marker.store(false, Ordering::SeqCst);
        let mut handles = self.post_handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn scrap(&self) {
        self.pre_tasks.lock().unwrap().clear();
        self.pending_post.lock().unwrap().clear();
        self.post_senders.lock().unwrap().clear();
    }

    /// Runs every registered pre-task, in order, on `item`.
    pub fn invoke_preprocess(&self, item: &mut P) {
        for task in self.pre_tasks.lock().unwrap().iter() {
            task(item);
        }
        self.last_daq_time.store(item.first_timestamp(), Ordering::Relaxed);
    }

    /// Pushes `item` onto every post-processing queue. A queue refusing the
    /// push emits `POSTPROCESSING_NOT_KEEPING_UP` and the pointer is
    /// dropped; the payload itself stays in the latency buffer (spec.md
    /// §4.4).
    pub fn postprocess(&self, item: &P) {
        for (index, sender) in self.post_senders.lock().unwrap().iter().enumerate() {
            if let Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) =
                sender.try_send(PostPtr(item as *const P))
            {
                ReadoutWarning::PostprocessingNotKeepingUp {
                    component: self.component,
                    task_index: index,
                }
                .log();
            }
        }
    }

    /// The `first_timestamp` of the most recent payload that cleared
    /// pre-processing, or 0 before the first payload (spec.md §4.4).
    pub fn last_daq_time(&self) -> u64 {
        self.last_daq_time.load(Ordering::Relaxed)
    }
}

fn run_post_processing_thread<P: Payload>(
    component: ComponentId,
    index: usize,
    run_marker: Arc<AtomicBool>,
    receiver: Receiver<PostPtr<P>>,
    task: PostTask<P>,
) {
    log::debug!("component[{component}] post-processing worker {index} starting");
    loop {
        match receiver.recv_timeout(Duration::from_micros(50)) {
            Ok(item) => {
                // SAFETY: the pointer was taken from a payload still live
                // in the latency buffer when `postprocess` pushed it; the
                // cleanup protocol (request_handler) does not reclaim a
                // slot while any thread may still be reading it through
                // this queue, because the orchestrator dispatches
                // post-processing before advancing the read index.
                let payload = unsafe { &*item.0 };
                task(payload);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if !run_marker.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
        if !run_marker.load(Ordering::SeqCst) && receiver.is_empty() {
            break;
        }
    }
    log::debug!("component[{component}] post-processing worker {index} stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct TestPayload {
        ts: u64,
    }

    impl Payload for TestPayload {
        const EXPECTED_TICK_DIFFERENCE: u64 = 25;
        fn first_timestamp(&self) -> u64 {
            self.ts
        }
        fn num_frames(&self) -> u16 {
            1
        }
        fn frame_size(&self) -> usize {
            16
        }
        fn begin(&self) -> *const u8 {
            std::ptr::null()
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

    #[test]
    fn preprocess_runs_tasks_in_order_and_updates_last_daq_time() {
        let proc = Processor::<TestPayload>::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        proc.add_preprocess_task(move |p: &mut TestPayload| {
            o1.lock().unwrap().push(1);
            p.ts += 1;
        });
        let o2 = Arc::clone(&order);
        proc.add_preprocess_task(move |_p: &mut TestPayload| {
            o2.lock().unwrap().push(2);
        });
        let mut p = TestPayload { ts: 100 };
        proc.invoke_preprocess(&mut p);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(p.ts, 101);
        assert_eq!(proc.last_daq_time(), 101);
    }

    #[test]
    fn postprocess_fans_out_to_all_workers() {
        let proc = Arc::new(Processor::<TestPayload>::new(1));
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            proc.add_postprocess_task(move |_p: &TestPayload| {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        proc.conf(8);
        proc.start();
        let payload = TestPayload { ts: 42 };
        proc.postprocess(&payload);
        std::thread::sleep(Duration::from_millis(50));
        proc.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
