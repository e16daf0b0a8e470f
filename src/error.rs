//! Error types for ramlog
//!
//! Provides a unified error type for all log operations.
//!
//! Running out of segment memory is deliberately *not* an error: `Log::append`
//! reports it as `Ok(None)` so callers can apply backpressure.

use thiserror::Error;

use crate::log::{Reference, SlotId};
use crate::replication::BackupId;

/// Result type alias using LogError
pub type Result<T> = std::result::Result<T, LogError>;

/// Unified error type for ramlog operations
#[derive(Debug, Error)]
pub enum LogError {
    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid log reference: {0}")]
    InvalidReference(Reference),

    #[error("Entry of {size} bytes exceeds the maximum of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Unknown segment slot: {0}")]
    UnknownSlot(SlotId),

    #[error("Segment {0} is still open for appends")]
    SegmentNotSealed(u64),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    #[error("No segment could be allocated for a new log head")]
    SegmentsExhausted,

    // -------------------------------------------------------------------------
    // Replication Errors
    // -------------------------------------------------------------------------
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Insufficient backups: {available} available, {required} required")]
    InsufficientBackups { available: usize, required: usize },

    #[error("Backup {0} is unavailable")]
    BackupUnavailable(BackupId),

    // -------------------------------------------------------------------------
    // Cleaner Errors
    // -------------------------------------------------------------------------
    #[error("Cleaner error: {0}")]
    Cleaner(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for LogError {
    fn from(err: bincode::Error) -> Self {
        LogError::Serialization(err.to_string())
    }
}
