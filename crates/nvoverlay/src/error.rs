//! Error types for the simulator.
//!
//! Only recoverable failures surface as [`NvError`]: bad configuration and
//! malformed trace input. Usage errors (unaligned addresses, out-of-range
//! core ids, tag-array corruption, inserts into merged epochs) indicate the
//! simulator is being fed garbage; they panic with a diagnostic rather than
//! silently corrupting statistics.

use thiserror::Error;

/// Result type for simulator operations.
pub type Result<T> = std::result::Result<T, NvError>;

/// Errors that can occur while constructing or driving the simulator.
#[derive(Error, Debug)]
pub enum NvError {
    /// A configuration knob failed validation.
    #[error("invalid configuration: {key} = {value} ({reason})")]
    Config {
        /// The offending configuration key.
        key: &'static str,
        /// The rejected value.
        value: u64,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// An I/O error while reading or writing a trace file.
    #[error("trace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A trace record carried an event type outside the known range.
    #[error("unknown trace event type {0}")]
    UnknownEventType(u8),

    /// A trace record named a core the reader was not configured for.
    #[error("trace record core id {core} out of range for {cores} cores")]
    CoreOutOfRange {
        /// Core id carried by the record.
        core: u16,
        /// Number of per-core streams the reader was opened with.
        cores: u32,
    },

    /// The trace ended mid-record.
    #[error("truncated trace: {0} trailing bytes")]
    TruncatedTrace(usize),
}
