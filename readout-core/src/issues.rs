//! Diagnostic taxonomy for the readout core (spec.md §7).
//!
//! Hard kinds are returned as `Err` from `init`/`conf` and propagate to the
//! caller. Warning kinds are logged at the point of occurrence via the
//! `log` crate and do not propagate; the corresponding counter is bumped by
//! the caller in the same breath.

use thiserror::Error;

/// An opaque component identifier, e.g. a link/source id. The spec leaves
/// the concrete identifier scheme (GeoID vs SourceID) to the configuration
/// layer (spec.md §9); the core only needs it to be printable.
pub type ComponentId = u32;

#[derive(Debug, Error)]
pub enum ReadoutIssue {
    #[error("component[{component}] configuration error: {reason}")]
    ConfigurationError { component: ComponentId, reason: String },

    #[error("readout initialization error: {reason}")]
    InitializationError { reason: String },

    #[error("component[{component}] missing required queue(s): {names}")]
    ResourceQueueError { component: ComponentId, names: String },

    #[error("component[{component}] latency buffer allocation failed ({requested_bytes} bytes)")]
    BadAlloc { component: ComponentId, requested_bytes: usize },

    #[error("component[{component}] command error: {reason}")]
    CommandError { component: ComponentId, reason: String },
}

/// Warning-grade diagnostics. These are never returned as an `Err`; they
/// are constructed, logged once via [`ReadoutWarning::log`], and dropped.
#[derive(Debug, Error)]
pub enum ReadoutWarning {
    #[error("component[{component}] cannot write to file {file}")]
    CannotWriteToFile { component: ComponentId, file: String },

    #[error("component[{component}] cannot write to queue {queue}: data will be lost")]
    CannotWriteToQueue { component: ComponentId, queue: String },

    #[error("component[{component}] cannot read from queue {queue}")]
    CannotReadFromQueue { component: ComponentId, queue: String },

    #[error(
        "component[{component}] request {trigger_number}.{sequence_number} (run {run_number}, window [{window_begin},{window_end})) timed out"
    )]
    VerboseRequestTimedOut {
        component: ComponentId,
        trigger_number: u64,
        sequence_number: u64,
        run_number: u32,
        window_begin: u64,
        window_end: u64,
    },

    #[error("component[{component}] request on empty buffer: {detail}")]
    RequestOnEmptyBuffer { component: ComponentId, detail: String },

    #[error("component[{component}] packet with timestamp {timestamp} arrived too late")]
    DataPacketArrivedTooLate { component: ComponentId, timestamp: u64 },

    #[error("component[{component}] postprocessing task {task_index} is not keeping up")]
    PostprocessingNotKeepingUp { component: ComponentId, task_index: usize },

    #[error("component[{component}] trigger-matching result with empty fragment: {detail}")]
    TrmWithEmptyFragment { component: ComponentId, detail: String },

    #[error("component[{component}] time-sync transmission failed for {destination}")]
    TimeSyncTransmissionFailed { component: ComponentId, destination: String },
}

impl ReadoutWarning {
    /// Log this warning at `warn!` level, as every warning-grade issue in
    /// the taxonomy is treated identically: logged and dropped.
    pub fn log(&self) {
        log::warn!("{self}");
    }
}

/// `REQUEST_SOURCE_ID_MISMATCH` is hard-dropped (not answered) rather than
/// being a warning or a propagated error; it gets its own type so call
/// sites cannot accidentally route it through the warning-and-continue
/// path used for everything else.
#[derive(Debug, Error)]
#[error("component[{component}] got request for component {requested}")]
pub struct RequestSourceIdMismatch {
    pub component: ComponentId,
    pub requested: ComponentId,
}

impl RequestSourceIdMismatch {
    pub fn log(&self) {
        log::error!("{self}");
    }
}
