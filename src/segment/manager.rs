//! Segment Manager
//!
//! Owns every resident segment and the slot table that references resolve
//! through.
//!
//! ## Responsibilities
//! - Allocate new head segments within the memory budget
//! - Map stable slot ids to the segment currently backing them
//! - Track the pool of sealed segments available to the cleaner
//! - Swap a slot's backing store during compaction
//! - Reclaim segments once the cleaner has emptied them

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::{LogError, Result};
use crate::log::SlotId;

use super::{LogSegment, SegmentBacking, SegmentUsage};

/// Everything guarded by the slot-table lock
struct SlotTable {
    /// Slot → segment currently backing it
    slots: HashMap<SlotId, Arc<LogSegment>>,
    /// Segment id → slot, for membership queries
    ids: HashMap<u64, SlotId>,
    /// Sealed segments handed over for cleaning
    cleanable: BTreeSet<SlotId>,
    /// Next slot id; slots are never reused
    next_slot: Option<SlotId>,
    /// Next segment id
    next_segment_id: u64,
    /// Bytes charged against `max_log_bytes`
    resident_bytes: u64,
}

/// Manages the set of resident segments
///
/// ## Concurrency:
/// - `table`: Protected by RwLock (lookups share, allocation/swap/free exclusive)
/// - All methods use `&self` (no exclusive access needed)
pub struct SegmentManager {
    segment_size: u32,
    max_log_bytes: u64,
    table: RwLock<SlotTable>,
}

impl SegmentManager {
    /// Create an empty manager sized from the config
    pub fn new(config: &Config) -> Self {
        Self {
            segment_size: config.segment_size,
            max_log_bytes: config.max_log_bytes,
            table: RwLock::new(SlotTable {
                slots: HashMap::new(),
                ids: HashMap::new(),
                cleanable: BTreeSet::new(),
                next_slot: Some(0),
                next_segment_id: 0,
                resident_bytes: 0,
            }),
        }
    }

    /// Allocate a fresh, empty segment to become the log head
    ///
    /// Returns `None` when the memory budget or the slot space is exhausted.
    pub fn open(&self) -> Option<Arc<LogSegment>> {
        let mut table = self.table.write();

        let charge = u64::from(self.segment_size);
        if table.resident_bytes + charge > self.max_log_bytes {
            tracing::warn!(
                "Segment allocation refused: {} of {} bytes resident",
                table.resident_bytes,
                self.max_log_bytes
            );
            return None;
        }

        let Some(slot) = table.next_slot else {
            tracing::warn!("Segment allocation refused: slot space exhausted");
            return None;
        };
        table.next_slot = slot.checked_add(1);

        let id = table.next_segment_id;
        table.next_segment_id += 1;

        let segment = Arc::new(LogSegment::new(id, slot, self.segment_size));
        table.slots.insert(slot, Arc::clone(&segment));
        table.ids.insert(id, slot);
        table.resident_bytes += charge;

        tracing::debug!("Opened segment {} in slot {}", id, slot);
        Some(segment)
    }

    /// Segment currently backing `slot`
    pub fn get_segment(&self, slot: SlotId) -> Option<Arc<LogSegment>> {
        self.table.read().slots.get(&slot).cloned()
    }

    /// Hand a sealed segment over to the cleaning pool
    pub fn retire(&self, segment: &Arc<LogSegment>) -> Result<()> {
        if !segment.is_sealed() {
            return Err(LogError::SegmentNotSealed(segment.id()));
        }

        let mut table = self.table.write();
        if !table.slots.contains_key(&segment.slot()) {
            return Err(LogError::UnknownSlot(segment.slot()));
        }
        table.cleanable.insert(segment.slot());
        Ok(())
    }

    /// Sealed segments that are not currently being cleaned
    pub fn cleanable_segments(&self) -> Vec<Arc<LogSegment>> {
        let table = self.table.read();
        table
            .cleanable
            .iter()
            .filter_map(|slot| table.slots.get(slot))
            .filter(|segment| !segment.is_cleaning())
            .cloned()
            .collect()
    }

    /// Utilization of every cleanable segment, for candidate scoring
    pub fn utilizations(&self) -> Vec<(Arc<LogSegment>, SegmentUsage)> {
        self.cleanable_segments()
            .into_iter()
            .map(|segment| {
                let usage = segment.usage();
                (segment, usage)
            })
            .collect()
    }

    /// Atomically swap the storage behind `slot`; the slot id is unchanged.
    ///
    /// Returns the number of budget bytes released.
    pub fn replace_backing(&self, slot: SlotId, backing: SegmentBacking) -> Result<u64> {
        let mut table = self.table.write();
        let segment = table
            .slots
            .get(&slot)
            .cloned()
            .ok_or(LogError::UnknownSlot(slot))?;

        if !segment.is_sealed() {
            return Err(LogError::SegmentNotSealed(segment.id()));
        }

        let released = u64::from(segment.swap_backing(backing));
        table.resident_bytes -= released;

        tracing::debug!(
            "Replaced backing of segment {} in slot {}: {} bytes released",
            segment.id(),
            slot,
            released
        );
        Ok(released)
    }

    /// Remove an emptied segment from the slot table
    ///
    /// The cleaner calls this only once the segment holds no live entries.
    /// Any reference into the slot is invalid from here on.
    pub fn free(&self, slot: SlotId) -> Result<Arc<LogSegment>> {
        let mut table = self.table.write();
        let segment = table.slots.remove(&slot).ok_or(LogError::UnknownSlot(slot))?;

        table.ids.remove(&segment.id());
        table.cleanable.remove(&slot);
        table.resident_bytes -= u64::from(segment.resident_bytes());

        tracing::debug!("Freed segment {} from slot {}", segment.id(), slot);
        Ok(segment)
    }

    /// Whether segment `segment_id` is still resident
    pub fn contains_segment(&self, segment_id: u64) -> bool {
        self.table.read().ids.contains_key(&segment_id)
    }

    /// Number of resident segments, head included
    pub fn segment_count(&self) -> usize {
        self.table.read().slots.len()
    }

    /// Bytes charged against the memory budget
    pub fn resident_bytes(&self) -> u64 {
        self.table.read().resident_bytes
    }

    /// Resident bytes as a percentage of the memory budget
    pub fn memory_utilization(&self) -> u64 {
        self.resident_bytes() * 100 / self.max_log_bytes.max(1)
    }
}
