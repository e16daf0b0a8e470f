//! Segment Module
//!
//! Fixed-capacity, append-only segments and the manager that owns them.
//!
//! ## Responsibilities
//! - Store entries in the order they were appended
//! - Resolve references through a slot table, never through addresses
//! - Track per-segment utilization for the cleaner
//! - Certify sealed segments for replication
//!
//! ## Entry Layout
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Entry 1                                │
//! │ ┌──────────┬──────────┬──────────────┐ │
//! │ │ Type (1) │ Len (4)  │     Data     │ │
//! │ └──────────┴──────────┴──────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Entry 2 ...                            │
//! ├────────────────────────────────────────┤
//! │ Unused capacity                        │
//! └────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//! `open` → head (appends) → sealed + retired → cleaned or compacted → freed

mod log_segment;
mod manager;

pub use log_segment::{EntryState, LogSegment, SegmentBacking, SegmentUsage};
pub use manager::SegmentManager;
