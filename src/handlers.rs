//! Entry Handlers
//!
//! Callbacks the owner of the entries supplies so the log (and its cleaner)
//! can stay ignorant of what entries mean.

use crate::log::{LogEntry, Reference};

/// Liveness, age and relocation callbacks for entries in a `Log`.
///
/// The handlers are the single source of truth for liveness: the cleaner
/// asks `check_liveness` before copying an entry, and `relocate` after the
/// copy. An owner must swing its stored reference inside `relocate` while
/// holding whatever lock guards that reference, otherwise a concurrent
/// reader may observe a reference into a reclaimed segment.
pub trait LogEntryHandlers: Send + Sync {
    /// Creation time of the entry (seconds; any monotonic clock the owner
    /// picks). Older segments are preferred for cleaning.
    fn timestamp(&self, entry: &LogEntry) -> u32;

    /// Whether the owner still refers to this copy of the entry
    fn check_liveness(&self, entry: &LogEntry) -> bool;

    /// The cleaner copied `entry` to `new_reference`.
    ///
    /// Return `true` after repointing to the new copy, or `false` if the
    /// entry died since `check_liveness`; the cleaner then discards the copy.
    fn relocate(&self, entry: &LogEntry, new_reference: Reference) -> bool;
}
