//! # ramlog
//!
//! A replicated, segmented, in-memory log for a key-value master server:
//! - Append-only segments with stable, opaque references
//! - Streaming replication of segment bytes to backups
//! - Cost-benefit cleaning that relocates survivors and compacts in place
//! - Owner callbacks for liveness, age and relocation
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Owner (hash table / index)                  │
//! │            implements LogEntryHandlers                       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ append / free / get_entry
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                          Log                                 │
//! │                 (head lock, rollover)                        │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//! ┌─────────────┐       ┌──────────────┐        ┌─────────────┐
//! │  Segment    │◀──────│   Cleaner    │───────▶│  Replica    │
//! │  Manager    │       │ (background) │        │  Manager    │
//! └──────┬──────┘       └──────────────┘        └──────┬──────┘
//!        │                                             │
//!        ▼                                             ▼
//! ┌─────────────┐                               ┌─────────────┐
//! │ LogSegments │                               │   Backups   │
//! └─────────────┘                               └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod log;
pub mod handlers;
pub mod segment;
pub mod replication;
pub mod cleaner;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LogError, Result};
pub use config::Config;
pub use log::{Log, LogEntry, LogEntryType, LogStats, Position, Reference};
pub use handlers::LogEntryHandlers;
pub use replication::{BackupReplicaManager, MemoryBackup, NoReplication, ReplicaManager};
pub use cleaner::CleanerStats;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of ramlog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
