//! Cleaner Module
//!
//! Reclaims the space held by freed and dead entries.
//!
//! ## Responsibilities
//! - Rank sealed segments by cost-benefit
//! - Relocate surviving entries to the log head and free drained segments
//! - Compact highly utilized segments in place
//! - Run in the background whenever memory utilization is high
//!
//! ## Cleaning Pass
//! ```text
//! rank ──▶ select ──┬──▶ relocate: survivors ──▶ head ──▶ sync ──▶ free segment
//!                   │
//!                   └──▶ compact:  live entries ──▶ new backing ──▶ swap
//! ```
//!
//! Owners are told about every move through `LogEntryHandlers::relocate`; a
//! refused move discards the new copy and drops the old one.

mod select;

pub use select::cost_benefit;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::{LogError, Result};
use crate::log::{entry_footprint, LogCore};
use crate::segment::LogSegment;

/// What one cleaning pass accomplished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanerStats {
    /// Segments emptied and returned to the allocator
    pub segments_cleaned: usize,

    /// Segments compacted in place
    pub segments_compacted: usize,

    /// Entries copied to the head and accepted by their owner
    pub entries_relocated: usize,

    /// Entries the owner reported dead
    pub entries_dead: usize,

    /// Relocations the owner refused
    pub relocations_refused: usize,

    pub bytes_relocated: u64,

    /// Memory budget returned by freeing and compacting
    pub bytes_reclaimed: u64,
}

impl CleanerStats {
    /// Whether the pass gave any memory back
    pub fn made_progress(&self) -> bool {
        self.segments_cleaned > 0 || self.segments_compacted > 0
    }
}

/// Clears the cleaning flag of every claimed segment when dropped
struct CleaningClaim {
    segments: Vec<Arc<LogSegment>>,
}

impl CleaningClaim {
    fn claim(candidates: Vec<Arc<LogSegment>>) -> Self {
        let segments = candidates
            .into_iter()
            .filter(|segment| segment.try_begin_cleaning())
            .collect();
        Self { segments }
    }
}

impl Drop for CleaningClaim {
    fn drop(&mut self) {
        for segment in &self.segments {
            segment.finish_cleaning();
        }
    }
}

/// Log cleaner
///
/// ## Concurrency:
/// - Passes are serialized by `pass_lock`, whether run by the background
///   thread or through `Log::clean`
/// - The background thread stops when the cleaner is dropped
pub(crate) struct LogCleaner {
    core: Arc<LogCore>,
    pass_lock: Arc<Mutex<()>>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LogCleaner {
    /// Create the cleaner, starting its thread if `background` is set
    pub(crate) fn new(core: Arc<LogCore>, background: bool) -> Result<Self> {
        let pass_lock = Arc::new(Mutex::new(()));
        let mut cleaner = Self {
            core,
            pass_lock,
            shutdown: None,
            thread: None,
        };

        if background {
            let (tx, rx) = channel::bounded(1);
            let core = Arc::clone(&cleaner.core);
            let pass_lock = Arc::clone(&cleaner.pass_lock);
            let thread = thread::Builder::new()
                .name("ramlog-cleaner".to_string())
                .spawn(move || run(core, pass_lock, rx))
                .map_err(|e| LogError::Cleaner(format!("failed to start thread: {}", e)))?;

            cleaner.shutdown = Some(tx);
            cleaner.thread = Some(thread);
        }

        Ok(cleaner)
    }

    /// Run one pass on the caller's thread
    pub(crate) fn clean(&self) -> Result<CleanerStats> {
        let _pass = self.pass_lock.lock();
        clean_pass(&self.core)
    }
}

impl Drop for LogCleaner {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Log cleaner thread panicked");
            }
        }
    }
}

/// Background loop: clean while utilization is at or above the low-water
/// mark, otherwise sleep for `cleaner_poll_ms`
fn run(core: Arc<LogCore>, pass_lock: Arc<Mutex<()>>, shutdown: Receiver<()>) {
    let poll = Duration::from_millis(core.config.cleaner_poll_ms);
    let low_water = u64::from(core.config.cleaner_low_water_pct);
    tracing::info!("Log cleaner started");

    'outer: loop {
        match shutdown.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        while core.segments.memory_utilization() >= low_water {
            let result = {
                let _pass = pass_lock.lock();
                clean_pass(&core)
            };

            match result {
                Ok(stats) if stats.made_progress() => {}
                Ok(_) => break,
                Err(e) => {
                    tracing::error!("Cleaning pass failed: {}", e);
                    break;
                }
            }

            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break 'outer;
            }
        }
    }

    tracing::info!("Log cleaner stopped");
}

/// One full cleaning pass over the current candidates
pub(crate) fn clean_pass(core: &LogCore) -> Result<CleanerStats> {
    let mut stats = CleanerStats::default();

    let candidates = select::rank(core, select::unix_now());
    let selection = select::select(candidates, &core.config);

    relocate_segments(core, selection.relocate, &mut stats)?;

    for segment in selection.compact {
        if !segment.try_begin_cleaning() {
            continue;
        }
        let result = compact_segment(core, &segment, &mut stats);
        segment.finish_cleaning();
        result?;
    }

    if stats.made_progress() {
        tracing::info!(
            "Cleaning pass: {} segments freed, {} compacted, {} entries relocated, {} bytes reclaimed",
            stats.segments_cleaned,
            stats.segments_compacted,
            stats.entries_relocated,
            stats.bytes_reclaimed
        );
    }

    Ok(stats)
}

// =============================================================================
// Relocation
// =============================================================================

fn relocate_segments(
    core: &LogCore,
    candidates: Vec<Arc<LogSegment>>,
    stats: &mut CleanerStats,
) -> Result<()> {
    let claim = CleaningClaim::claim(candidates);
    let mut drained = Vec::new();

    for segment in &claim.segments {
        if relocate_survivors(core, segment, stats)? {
            drained.push(Arc::clone(segment));
        } else {
            tracing::warn!(
                "No room for survivors of segment {}; stopping relocation",
                segment.id()
            );
            break;
        }
    }

    // Survivors must be durable before the only other copy goes away.
    if stats.entries_relocated > 0 {
        core.replicas.sync()?;
    }

    for segment in drained {
        if segment.live_entry_count() > 0 {
            continue;
        }
        let freed = core.segments.free(segment.slot())?;
        core.replicas.free(freed.id());
        stats.segments_cleaned += 1;
        stats.bytes_reclaimed += u64::from(freed.resident_bytes());
    }

    Ok(())
}

/// Move every live entry of `segment` to the head
///
/// Returns false if the head ran out of room part way through.
fn relocate_survivors(
    core: &LogCore,
    segment: &LogSegment,
    stats: &mut CleanerStats,
) -> Result<bool> {
    for entry in segment.live_entries() {
        let offset = entry.reference.offset();

        if !core.handlers.check_liveness(&entry) {
            if segment.drop_entry(offset) {
                stats.entries_dead += 1;
            }
            continue;
        }

        let Some(new_reference) = core.append(entry.entry_type, &entry.data, false)? else {
            return Ok(false);
        };

        if core.handlers.relocate(&entry, new_reference) {
            stats.entries_relocated += 1;
            stats.bytes_relocated += entry_footprint(entry.data.len()) as u64;
        } else {
            core.free(new_reference)?;
            stats.relocations_refused += 1;
        }
        segment.drop_entry(offset);
    }

    Ok(true)
}

// =============================================================================
// Compaction
// =============================================================================

fn compact_segment(core: &LogCore, segment: &LogSegment, stats: &mut CleanerStats) -> Result<()> {
    for entry in segment.live_entries() {
        if !core.handlers.check_liveness(&entry) && segment.drop_entry(entry.reference.offset()) {
            stats.entries_dead += 1;
        }
    }

    let backing = segment.compacted_backing();
    let released = core.segments.replace_backing(segment.slot(), backing)?;
    core.replicas.compacted(segment.id(), segment.resident_frames())?;

    stats.segments_compacted += 1;
    stats.bytes_reclaimed += released;
    Ok(())
}
