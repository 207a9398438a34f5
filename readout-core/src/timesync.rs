//! Timesync heartbeat message (spec.md §4.6, GLOSSARY "Timesync").

use serde::Serialize;

/// Emitted by the orchestrator's timesync thread whenever `daq_time`
/// changes and is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeSync {
    pub daq_time: u64,
    pub system_time: u64,
    pub run_number: u32,
    pub sequence_number: u64,
    pub source_pid: u32,
}
