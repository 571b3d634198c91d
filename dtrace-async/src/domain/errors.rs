//! Structured error types for dtrace-async
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::SessionStatus;
use dtrace_async_common::ActionKind;
use thiserror::Error;

/// Failure reported by a tracing engine call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    /// Engine-specific error number (0 when the engine has none)
    pub errno: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self { errno, message: message.into() }
    }
}

/// Failure to interpret a record or aggregation tuple
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported action {action} in record for {probe}")]
    UnsupportedRecord { action: ActionKind, probe: String },

    #[error("unsupported action {action} as key #{index} in aggregation \"{aggregation}\"")]
    UnsupportedKey { action: ActionKind, index: usize, aggregation: String },

    #[error("unsupported aggregating action {action} in aggregation \"{aggregation}\"")]
    UnsupportedAggregation { action: ActionKind, aggregation: String },

    #[error("aggregation \"{0}\" has no value record")]
    MissingValue(String),

    #[error("{action} record has size {actual}, expected {expected}")]
    UnexpectedSize { action: ActionKind, expected: String, actual: u32 },

    #[error("record at offset {offset} (size {size}) overruns {len}-byte buffer")]
    OutOfBounds { offset: u32, size: u32, len: usize },
}

/// Error surfaced to the host by a session operation
///
/// Control operations deliver these through their completion callback; data
/// walks and argument checks return them synchronously. A failure is never
/// reported through both paths.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("consumer is busy")]
    Busy,

    #[error("no tracing engine: {0}")]
    NoEngine(SessionStatus),

    #[error("couldn't set option '{option}': {reason}")]
    SetOption { option: String, reason: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Canonicalized message from the session's error channel
    #[error("{0}")]
    Operation(String),
}

/// Failure to load a replay capture
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid capture: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
