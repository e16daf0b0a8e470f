//! Log Module
//!
//! The log orchestrator that coordinates segments, replication and cleaning.
//!
//! ## Responsibilities
//! - Append immutable entries to the head segment
//! - Roll the head when it fills, sealing and replicating the old one
//! - Resolve references for reads and frees
//! - Expose the head position and head-rollover barrier to higher layers
//! - Own the background cleaner
//!
//! ## Append Path
//! ```text
//! append ──▶ head lock ──▶ fits? ──yes──▶ write ──▶ enqueue replication
//!                            │
//!                            no
//!                            ▼
//!                 open new segment ──fail──▶ Ok(None), head unchanged
//!                            │
//!                 seal old head ──▶ close replica ──▶ retire ──▶ write
//! ```

mod entry;
mod reference;

pub use entry::{LogEntry, LogEntryType, ENTRY_HEADER_SIZE};
pub(crate) use entry::{encode_entry, entry_footprint};
pub use reference::{Position, Reference, SlotId};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cleaner::{CleanerStats, LogCleaner};
use crate::config::Config;
use crate::error::{LogError, Result};
use crate::handlers::LogEntryHandlers;
use crate::replication::ReplicaManager;
use crate::segment::{LogSegment, SegmentManager};

/// Point-in-time summary of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// Resident segments, head included
    pub segment_count: usize,

    /// Bytes charged against `max_log_bytes`
    pub resident_bytes: u64,

    /// `resident_bytes` as a percentage of `max_log_bytes`
    pub memory_utilization_pct: u64,

    /// Current append position
    pub head_position: Position,
}

/// The replicated, cleaned, in-memory log
///
/// ## Concurrency Model
///
/// - **Appends**: serialized by the head lock, held for the copy into the
///   head and for rollover decisions
/// - **Reads / frees**: resolve the slot through the segment manager and
///   touch only the target segment's lock
/// - **Cleaner**: reads sealed segments; takes the head lock only while
///   appending a survivor, and the slot-table lock while swapping backings
pub struct Log {
    core: Arc<LogCore>,
    cleaner: LogCleaner,
}

/// State shared between the `Log` handle and its cleaner
pub(crate) struct LogCore {
    pub(crate) config: Config,
    pub(crate) handlers: Arc<dyn LogEntryHandlers>,
    pub(crate) segments: SegmentManager,
    pub(crate) replicas: Arc<dyn ReplicaManager>,
    /// Current head. Never empty: the log always has a segment to append to.
    head: Mutex<Arc<LogSegment>>,
}

impl Log {
    /// Create a log and allocate its first head segment (id 0)
    ///
    /// Starts the background cleaner unless `config.disable_cleaner` is set.
    pub fn new(
        config: Config,
        handlers: Arc<dyn LogEntryHandlers>,
        replicas: Arc<dyn ReplicaManager>,
    ) -> Result<Self> {
        config.validate()?;

        let segments = SegmentManager::new(&config);
        let head = segments.open().ok_or(LogError::SegmentsExhausted)?;
        let run_cleaner = !config.disable_cleaner;

        tracing::info!(
            "Log created: segment_size={}, max_log_bytes={}, cleaner={}",
            config.segment_size,
            config.max_log_bytes,
            run_cleaner
        );

        let core = Arc::new(LogCore {
            config,
            handlers,
            segments,
            replicas,
            head: Mutex::new(head),
        });
        let cleaner = LogCleaner::new(Arc::clone(&core), run_cleaner)?;

        Ok(Self { core, cleaner })
    }

    /// Append an entry
    ///
    /// Returns:
    /// - `Ok(Some(reference))`: entry written (and durable if `sync`)
    /// - `Ok(None)`: no segment could be allocated; nothing was written
    /// - `Err(EntryTooLarge)`: the entry can never fit in a segment
    /// - `Err(..)`: replication failed
    pub fn append(
        &self,
        entry_type: LogEntryType,
        data: &[u8],
        sync: bool,
    ) -> Result<Option<Reference>> {
        self.core.append(entry_type, data, sync)
    }

    /// Mark an entry dead. Space is reclaimed later by the cleaner.
    pub fn free(&self, reference: Reference) -> Result<()> {
        self.core.free(reference)
    }

    /// Copy an entry's payload into `out` and return its type
    pub fn get_entry(&self, reference: Reference, out: &mut Vec<u8>) -> Result<LogEntryType> {
        let segment = self.core.segment_for(reference)?;
        segment
            .read_into(reference.offset(), out)
            .ok_or(LogError::InvalidReference(reference))
    }

    /// Block until every append issued so far is durably replicated
    pub fn sync(&self) -> Result<()> {
        self.core.replicas.sync()
    }

    /// Current append position
    pub fn head_position(&self) -> Position {
        let head = self.core.head.lock();
        Position::new(head.id(), head.write_offset())
    }

    /// Id of the segment `reference` points into
    pub fn segment_id(&self, reference: Reference) -> Result<u64> {
        Ok(self.core.segment_for(reference)?.id())
    }

    /// Roll the head only if it is still `segment_id` (`None`: always roll)
    ///
    /// Returns `Ok(false)` if the head had already moved on.
    pub fn allocate_head_if_still_on(&self, segment_id: Option<u64>) -> Result<bool> {
        let mut head = self.core.head.lock();
        if segment_id.is_some_and(|id| id != head.id()) {
            return Ok(false);
        }

        if self.core.roll_head(&mut head)? {
            Ok(true)
        } else {
            Err(LogError::SegmentsExhausted)
        }
    }

    /// Whether segment `segment_id` is still resident
    pub fn contains_segment(&self, segment_id: u64) -> bool {
        self.core.segments.contains_segment(segment_id)
    }

    /// Run one cleaning pass now, regardless of utilization
    pub fn clean(&self) -> Result<CleanerStats> {
        self.cleaner.clean()
    }

    /// Largest payload a single entry may carry
    pub fn max_entry_size(&self) -> usize {
        self.core.max_entry_size()
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            segment_count: self.core.segments.segment_count(),
            resident_bytes: self.core.segments.resident_bytes(),
            memory_utilization_pct: self.core.segments.memory_utilization(),
            head_position: self.head_position(),
        }
    }
}

impl LogCore {
    fn max_entry_size(&self) -> usize {
        self.config.segment_size as usize - ENTRY_HEADER_SIZE
    }

    fn segment_for(&self, reference: Reference) -> Result<Arc<LogSegment>> {
        self.segments
            .get_segment(reference.slot())
            .ok_or(LogError::InvalidReference(reference))
    }

    /// Append path shared by external writers and the cleaner
    pub(crate) fn append(
        &self,
        entry_type: LogEntryType,
        data: &[u8],
        sync: bool,
    ) -> Result<Option<Reference>> {
        let max = self.max_entry_size();
        if data.len() > max {
            return Err(LogError::EntryTooLarge {
                size: data.len(),
                max,
            });
        }

        let reference = {
            let mut head = self.head.lock();

            let (segment, (offset, encoded)) = match head.append(entry_type, data) {
                Some(written) => (Arc::clone(&head), written),
                None => {
                    if !self.roll_head(&mut head)? {
                        return Ok(None);
                    }
                    let written = head.append(entry_type, data).ok_or_else(|| {
                        LogError::Config(format!(
                            "entry of {} bytes rejected by an empty segment",
                            data.len()
                        ))
                    })?;
                    (Arc::clone(&head), written)
                }
            };

            // Enqueued under the head lock so a segment's writes always
            // precede its close.
            self.replicas.enqueue(segment.id(), offset, encoded)?;
            Reference::new(segment.slot(), offset)
        };

        if sync {
            self.replicas.sync()?;
        }

        Ok(Some(reference))
    }

    pub(crate) fn free(&self, reference: Reference) -> Result<()> {
        let segment = self.segment_for(reference)?;
        if segment.free(reference.offset()) {
            Ok(())
        } else {
            Err(LogError::InvalidReference(reference))
        }
    }

    /// Replace the head with a fresh segment (caller holds the head lock)
    ///
    /// Returns `Ok(false)` without touching the head if no segment can be
    /// allocated.
    fn roll_head(&self, head: &mut Arc<LogSegment>) -> Result<bool> {
        let Some(new_head) = self.segments.open() else {
            return Ok(false);
        };

        let certificate = head.seal();
        if let Err(e) = self.replicas.close(head.id(), certificate) {
            tracing::error!("Failed to replicate seal of segment {}: {}", head.id(), e);
            self.segments.free(new_head.slot())?;
            return Err(e);
        }
        self.segments.retire(head)?;

        tracing::debug!(
            "Rolled log head: segment {} sealed at {} bytes, segment {} is head",
            head.id(),
            certificate.segment_length,
            new_head.id()
        );

        *head = new_head;
        Ok(true)
    }
}
