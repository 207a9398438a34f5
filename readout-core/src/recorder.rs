//! C7 (recorder half): subscribes to a raw stream and appends every
//! payload to a buffered file writer (spec.md §4.7). Grounded on
//! `RecorderModel`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RecordingConfig;
use crate::issues::{ComponentId, ReadoutIssue, ReadoutWarning};
use crate::payload::Payload;
use crate::request_handler::recording::BufferedWriter;
use crate::transport::RawReceiver;

/// The trivial mirror of the request handler's recording path: every
/// payload received on `raw_recording` is appended, uncategorised, to one
/// output file (spec.md §4.7).
pub struct Recorder<P: Payload> {
    component: ComponentId,
    receiver: Arc<dyn RawReceiver<P>>,
    writer: parking_lot::Mutex<Option<BufferedWriter>>,
    run_marker: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    packets_processed: std::sync::atomic::AtomicU64,
}

impl<P: Payload> Recorder<P> {
    pub fn new(component: ComponentId, receiver: Arc<dyn RawReceiver<P>>) -> Self {
        Self {
            component,
            receiver,
            writer: parking_lot::Mutex::new(None),
            run_marker: Arc::new(AtomicBool::new(false)),
            handle: parking_lot::Mutex::new(None),
            packets_processed: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Removes any pre-existing output file and opens a fresh writer
    /// (spec.md §4.7).
    pub fn conf(&self, conf: &RecordingConfig) -> Result<(), ReadoutIssue> {
        let _ = std::fs::remove_file(&conf.output_file);
        let writer = BufferedWriter::open(
            self.component,
            &conf.output_file,
            conf.stream_buffer_size,
            conf.compression_algorithm,
            conf.use_o_direct,
        )?;
        *self.writer.lock() = Some(writer);
        Ok(())
    }

    pub fn start(self: &Arc<Self>) {
        self.run_marker.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        *self.handle.lock() = Some(std::thread::spawn(move || this.run_work()));
    }

    pub fn stop(&self) {
        self.run_marker.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_work(&self) {
        while self.run_marker.load(Ordering::SeqCst) {
            let Some(element) = self.receiver.try_receive(Duration::from_millis(100)) else {
                continue;
            };
            self.packets_processed.fetch_add(1, Ordering::Relaxed);
            // SAFETY: `element` owns its storage for the duration of this
            // call; the slice only borrows it to hand bytes to the writer.
            let bytes = unsafe { std::slice::from_raw_parts(element.begin(), element.payload_size()) };
            let mut writer = self.writer.lock();
            let Some(w) = writer.as_mut() else { break };
            if !w.write(bytes) {
                ReadoutWarning::CannotWriteToFile {
                    component: self.component,
                    file: "raw recording output".to_string(),
                }
                .log();
                break;
            }
        }
        if let Some(w) = self.writer.lock().as_mut() {
            w.flush();
        }
    }

    pub fn packets_processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }
}
