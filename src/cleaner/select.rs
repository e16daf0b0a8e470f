//! Candidate Selection
//!
//! Ranks sealed segments by cost-benefit and splits them into segments to
//! relocate and segments to compact in place.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::log::LogCore;
use crate::segment::{LogSegment, SegmentUsage};

/// A ranked cleaning candidate
pub(crate) struct Candidate {
    pub(crate) segment: Arc<LogSegment>,
    pub(crate) usage: SegmentUsage,
    pub(crate) score: f64,
}

/// Segments picked for one pass, best first
#[derive(Default)]
pub(crate) struct Selection {
    pub(crate) relocate: Vec<Arc<LogSegment>>,
    pub(crate) compact: Vec<Arc<LogSegment>>,
}

/// Cost-benefit score of cleaning a segment
///
/// `freeable × age / live`, where `freeable` is the capacity not held by
/// live entries. An empty segment scores infinity; a segment with nothing
/// to free scores zero.
pub fn cost_benefit(usage: &SegmentUsage, age_secs: u32) -> f64 {
    let freeable = usage.capacity.saturating_sub(usage.live_bytes);
    if freeable == 0 {
        return 0.0;
    }
    if usage.live_bytes == 0 {
        return f64::INFINITY;
    }

    let age = f64::from(age_secs.max(1));
    f64::from(freeable) * age / f64::from(usage.live_bytes)
}

/// Seconds since the unix epoch, saturated to `u32`
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Mean timestamp of a segment's live entries, cached on first use
fn segment_timestamp(core: &LogCore, segment: &LogSegment) -> u32 {
    if let Some(timestamp) = segment.cached_timestamp() {
        return timestamp;
    }

    let entries = segment.live_entries();
    let timestamp = if entries.is_empty() {
        0
    } else {
        let total: u64 = entries
            .iter()
            .map(|entry| u64::from(core.handlers.timestamp(entry)))
            .sum();
        (total / entries.len() as u64) as u32
    };

    segment.cache_timestamp(timestamp);
    timestamp
}

/// Every cleanable segment, highest score first
pub(crate) fn rank(core: &LogCore, now: u32) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = core
        .segments
        .utilizations()
        .into_iter()
        .map(|(segment, usage)| {
            let age = now.saturating_sub(segment_timestamp(core, &segment));
            Candidate {
                score: cost_benefit(&usage, age),
                usage,
                segment,
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates
}

/// Whether relocating the segment would free anything at all
fn has_dead_entries(usage: &SegmentUsage) -> bool {
    usage.live_bytes == 0 || usage.live_bytes < usage.write_offset
}

fn dead_pct(usage: &SegmentUsage) -> u64 {
    u64::from(usage.dead_bytes()) * 100 / u64::from(usage.resident_bytes.max(1))
}

/// Split ranked candidates into relocation and compaction work
///
/// Segments above `max_clean_utilization_pct` are too expensive to copy and
/// are only ever compacted, as are segments whose only waste is unused tail
/// capacity.
pub(crate) fn select(candidates: Vec<Candidate>, config: &Config) -> Selection {
    let mut selection = Selection::default();
    let max_live = u64::from(config.max_clean_utilization_pct);
    let min_dead = u64::from(config.compaction_dead_pct);

    for candidate in candidates {
        let usage = &candidate.usage;
        let relocatable = has_dead_entries(usage) && usage.live_pct() <= max_live;

        if relocatable && selection.relocate.len() < config.max_segments_per_pass {
            tracing::trace!(
                "Segment {} selected for relocation: score {}, {}% live",
                usage.segment_id,
                candidate.score,
                usage.live_pct()
            );
            selection.relocate.push(candidate.segment);
        } else if !relocatable
            && selection.compact.len() < config.max_segments_per_pass
            && usage.dead_bytes() > 0
            && dead_pct(usage) >= min_dead
        {
            tracing::trace!(
                "Segment {} selected for compaction: {} dead bytes",
                usage.segment_id,
                usage.dead_bytes()
            );
            selection.compact.push(candidate.segment);
        }
    }

    selection
}
