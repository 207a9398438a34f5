//! C6 external interfaces (spec.md §6).
//!
//! The four transport contracts are modelled as traits so a production
//! transport crate can wire them to a real DAQ IPC layer; the
//! `crossbeam_channel`-backed implementations here are what `readout-cli`
//! and the test suite use in-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::Serialize;

use crate::issues::ComponentId;
use crate::timesync::TimeSync;

/// A trigger-matching request for one link's data.
#[derive(Debug, Clone, Serialize)]
pub struct DataRequest {
    pub component: ComponentId,
    pub trigger_number: u64,
    pub sequence_number: u64,
    pub run_number: u32,
    pub window_begin: u64,
    pub window_end: u64,
    pub allow_partial: bool,
    pub data_destination: String,
}

/// Bits set on a [`Fragment`]'s `error_bits` (spec.md §4.5.2, §7).
pub mod error_bits {
    pub const DATA_NOT_FOUND: u16 = 1 << 0;
    pub const INCOMPLETE: u16 = 1 << 1;
}

/// The serialised answer to a request: header fields plus the concatenated
/// byte pieces extracted from the latency buffer (GLOSSARY "Fragment").
#[derive(Debug, Clone)]
pub struct Fragment {
    pub component: ComponentId,
    pub trigger_number: u64,
    pub sequence_number: u64,
    pub run_number: u32,
    pub window_begin: u64,
    pub window_end: u64,
    pub error_bits: u16,
    pub body: Vec<u8>,
}

impl Fragment {
    pub fn is_empty_of_data(&self) -> bool {
        self.body.is_empty()
    }
}

/// Typed channel yielding `P` with a bounded receive timeout (spec.md §6).
pub trait RawReceiver<P>: Send + Sync {
    fn try_receive(&self, timeout: Duration) -> Option<P>;
}

/// Channel of [`DataRequest`] with callback-registration semantics; at
/// most one callback may be registered at a time (spec.md §6).
pub trait DataRequestReceiver: Send + Sync {
    fn register_callback(&self, callback: Arc<dyn Fn(DataRequest) + Send + Sync>);
    fn remove_callback(&self);
}

/// Dynamically selected by a request's `data_destination` string (spec.md
/// §6); a 10 ms send timeout applies at every call site.
pub trait FragmentSender: Send + Sync {
    fn send(&self, destination: &str, fragment: Fragment, timeout: Duration) -> bool;
}

/// Typed sender of [`TimeSync`]; a 500 ms send timeout applies at every
/// call site (spec.md §6).
pub trait TimeSyncSender: Send + Sync {
    fn send(&self, sync: TimeSync, timeout: Duration) -> bool;
}

/// `RawReceiver` over a `crossbeam_channel::Receiver`.
pub struct ChannelRawReceiver<P> {
    receiver: Receiver<P>,
}

impl<P> ChannelRawReceiver<P> {
    pub fn new(receiver: Receiver<P>) -> Self {
        Self { receiver }
    }
}

impl<P: Send + Sync> RawReceiver<P> for ChannelRawReceiver<P> {
    fn try_receive(&self, timeout: Duration) -> Option<P> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// `DataRequestReceiver` backed by a `crossbeam_channel::Receiver` and a
/// dispatcher thread that pushes each request into the registered callback.
pub struct ChannelDataRequestReceiver {
    receiver: Receiver<DataRequest>,
    callback: Arc<Mutex<Option<Arc<dyn Fn(DataRequest) + Send + Sync>>>>,
    run_marker: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelDataRequestReceiver {
    pub fn new(receiver: Receiver<DataRequest>) -> Self {
        Self {
            receiver,
            callback: Arc::new(Mutex::new(None)),
            run_marker: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Starts the dispatcher thread; call once before requests can be
    /// delivered.
    pub fn start(&self) {
        self.run_marker.store(true, Ordering::SeqCst);
        let receiver = self.receiver.clone();
        let callback = Arc::clone(&self.callback);
        let run_marker = Arc::clone(&self.run_marker);
        *self.handle.lock().unwrap() = Some(std::thread::spawn(move || {
            while run_marker.load(Ordering::SeqCst) {
                match receiver.recv_timeout(Duration::from_millis(10)) {
                    Ok(request) => {
                        if let Some(cb) = callback.lock().unwrap().clone() {
                            cb(request);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        self.run_marker.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl DataRequestReceiver for ChannelDataRequestReceiver {
    fn register_callback(&self, callback: Arc<dyn Fn(DataRequest) + Send + Sync>) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn remove_callback(&self) {
        *self.callback.lock().unwrap() = None;
    }
}

/// `FragmentSender` resolving `data_destination` against a fixed map of
/// named `crossbeam_channel::Sender<Fragment>`s, registered at construction.
pub struct ChannelFragmentSender {
    destinations: HashMap<String, Sender<Fragment>>,
}

impl ChannelFragmentSender {
    pub fn new(destinations: HashMap<String, Sender<Fragment>>) -> Self {
        Self { destinations }
    }
}

impl FragmentSender for ChannelFragmentSender {
    fn send(&self, destination: &str, fragment: Fragment, timeout: Duration) -> bool {
        match self.destinations.get(destination) {
            Some(sender) => !matches!(
                sender.send_timeout(fragment, timeout),
                Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_))
            ),
            None => false,
        }
    }
}

/// `TimeSyncSender` over a single `crossbeam_channel::Sender<TimeSync>`.
pub struct ChannelTimeSyncSender {
    sender: Sender<TimeSync>,
}

impl ChannelTimeSyncSender {
    pub fn new(sender: Sender<TimeSync>) -> Self {
        Self { sender }
    }
}

impl TimeSyncSender for ChannelTimeSyncSender {
    fn send(&self, sync: TimeSync, timeout: Duration) -> bool {
        !matches!(
            self.sender.send_timeout(sync, timeout),
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_receiver_times_out_on_empty_channel() {
        let (_tx, rx) = crossbeam_channel::unbounded::<u32>();
        let receiver = ChannelRawReceiver::new(rx);
        assert!(receiver.try_receive(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn fragment_sender_resolves_by_destination_name() {
        let (tx, rx) = crossbeam_channel::unbounded::<Fragment>();
        let mut map = HashMap::new();
        map.insert("dest-a".to_string(), tx);
        let sender = ChannelFragmentSender::new(map);
        let fragment = Fragment {
            component: 1,
            trigger_number: 0,
            sequence_number: 0,
            run_number: 0,
            window_begin: 0,
            window_end: 0,
            error_bits: 0,
            body: vec![],
        };
        assert!(sender.send("dest-a", fragment, Duration::from_millis(10)));
        assert!(rx.try_recv().is_ok());
        assert!(!sender.send(
            "unknown",
            Fragment {
                component: 1,
                trigger_number: 0,
                sequence_number: 0,
                run_number: 0,
                window_begin: 0,
                window_end: 0,
                error_bits: 0,
                body: vec![],
            },
            Duration::from_millis(10)
        ));
    }
}
