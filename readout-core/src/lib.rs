//! Per-link readout core for a high-throughput DAQ pipeline.
//!
//! The crate is organised the way the system it is grounded on is: a narrow
//! [`payload`] capability trait threaded through every other component, a
//! [`latency_buffer`] (C3) written to by one consumer thread and read by
//! many request workers, a [`request_handler`] (C5) that matches trigger
//! requests against buffer contents and assembles fragments zero-copy, a
//! [`processor`] (C4) running pre/post pipelines, an [`orchestrator`] (C6)
//! tying one link's threads together, and an [`emulator`] / [`recorder`]
//! pair (C7) for bench and integration use without a real front end.

pub mod config;
pub mod counters;
pub mod emulator;
pub mod error_registry;
pub mod issues;
pub mod latency_buffer;
pub mod orchestrator;
pub mod payload;
pub mod processor;
pub mod recorder;
pub mod request_handler;
pub mod timesync;
pub mod transport;

pub use config::Config;
pub use issues::{ComponentId, ReadoutIssue, ReadoutWarning, RequestSourceIdMismatch};
pub use orchestrator::Orchestrator;
pub use payload::{FramePiece, Payload};
pub use processor::Processor;
pub use request_handler::RequestHandler;
pub use timesync::TimeSync;
