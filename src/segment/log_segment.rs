//! Log Segment
//!
//! A fixed-capacity, append-only region of the log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::log::{encode_entry, entry_footprint, LogEntry, LogEntryType, Reference, SlotId};
use crate::log::ENTRY_HEADER_SIZE;
use crate::replication::SegmentCertificate;

/// Marker for "no timestamp computed yet"
const NO_TIMESTAMP: u64 = u64::MAX;

/// Lifecycle of one entry inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Referenced by its owner
    Live,

    /// Released through `Log::free`
    Freed,

    /// Found dead, or relocated, by the cleaner
    Dropped,
}

/// An entry's place in a backing
#[derive(Debug, Clone)]
struct EntryLocation {
    entry_type: LogEntryType,
    /// Payload length
    length: u32,
    state: EntryState,
    /// Encoded frame (`[header][data]`), shared with the replication layer.
    /// `None` once compaction has discarded a dropped entry's bytes.
    frame: Option<Bytes>,
}

impl EntryLocation {
    fn footprint(&self) -> u32 {
        ENTRY_HEADER_SIZE as u32 + self.length
    }

    fn payload(&self) -> Option<Bytes> {
        self.frame.as_ref().map(|frame| frame.slice(ENTRY_HEADER_SIZE..))
    }
}

/// The storage behind a segment.
///
/// Entries are indexed by their logical offset, which is what references
/// carry. Each entry keeps the frame it was appended with, so a compacted
/// backing reuses the surviving frames without copying them. Dropped
/// entries survive compaction only as tombstones.
pub struct SegmentBacking {
    entries: BTreeMap<u32, EntryLocation>,
    /// Bytes charged against the memory budget
    reserved: u32,
}

impl SegmentBacking {
    fn fresh(capacity: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            reserved: capacity,
        }
    }

    /// Bytes charged against the memory budget
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Number of entries this backing indexes, tombstones included
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Mutable state of a segment, guarded by one lock
struct SegmentState {
    backing: SegmentBacking,
    /// Logical append cursor; only ever grows
    write_offset: u32,
    /// Footprint of entries still `Live`
    live_bytes: u32,
    /// Running checksum over every appended byte
    checksum: crc32fast::Hasher,
    certificate: Option<SegmentCertificate>,
}

/// Point-in-time utilization of a segment, used to rank cleaning candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentUsage {
    pub segment_id: u64,
    pub slot: SlotId,
    pub capacity: u32,
    pub write_offset: u32,
    pub live_bytes: u32,
    pub resident_bytes: u32,
}

impl SegmentUsage {
    /// Live bytes as a percentage of capacity
    pub fn live_pct(&self) -> u64 {
        u64::from(self.live_bytes) * 100 / u64::from(self.capacity.max(1))
    }

    /// Resident bytes that no live entry needs
    pub fn dead_bytes(&self) -> u32 {
        self.resident_bytes.saturating_sub(self.live_bytes)
    }
}

/// A fixed-capacity append-only segment.
///
/// ## Concurrency:
/// - Appends come only from the log head holder, one at a time
/// - Readers, `free` and the cleaner share `state` through an RwLock
/// - `sealed` and `cleaning` are flags readable without the lock
pub struct LogSegment {
    id: u64,
    slot: SlotId,
    capacity: u32,
    state: RwLock<SegmentState>,
    sealed: AtomicBool,
    /// Set while the cleaner is draining or compacting this segment
    cleaning: AtomicBool,
    /// Mean entry timestamp, computed lazily by the cleaner
    timestamp: AtomicU64,
}

impl LogSegment {
    pub fn new(id: u64, slot: SlotId, capacity: u32) -> Self {
        Self {
            id,
            slot,
            capacity,
            state: RwLock::new(SegmentState {
                backing: SegmentBacking::fresh(capacity),
                write_offset: 0,
                live_bytes: 0,
                checksum: crc32fast::Hasher::new(),
                certificate: None,
            }),
            sealed: AtomicBool::new(false),
            cleaning: AtomicBool::new(false),
            timestamp: AtomicU64::new(NO_TIMESTAMP),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Current logical append cursor
    pub fn write_offset(&self) -> u32 {
        self.state.read().write_offset
    }

    /// Append an entry.
    ///
    /// Returns the entry's offset and its encoded bytes (for replication),
    /// or `None` if the segment is sealed or lacks room.
    pub fn append(&self, entry_type: LogEntryType, data: &[u8]) -> Option<(u32, Bytes)> {
        let footprint = entry_footprint(data.len());
        let mut state = self.state.write();

        if self.is_sealed() {
            return None;
        }
        if state.write_offset as usize + footprint > self.capacity as usize {
            return None;
        }

        let offset = state.write_offset;
        let encoded = encode_entry(entry_type, data);

        state.backing.entries.insert(
            offset,
            EntryLocation {
                entry_type,
                length: data.len() as u32,
                state: EntryState::Live,
                frame: Some(encoded.clone()),
            },
        );
        state.checksum.update(&encoded);
        state.write_offset += footprint as u32;
        state.live_bytes += footprint as u32;

        Some((offset, encoded))
    }

    /// Copy an entry's payload into `out`.
    ///
    /// Fails for unknown offsets, freed entries and dropped entries whose
    /// bytes were compacted away.
    pub fn read_into(&self, offset: u32, out: &mut Vec<u8>) -> Option<LogEntryType> {
        let state = self.state.read();
        let loc = state.backing.entries.get(&offset)?;
        if loc.state == EntryState::Freed {
            return None;
        }
        let frame = loc.frame.as_ref()?;

        out.clear();
        out.extend_from_slice(&frame[ENTRY_HEADER_SIZE..]);
        Some(loc.entry_type)
    }

    /// State of the entry at `offset`, if the backing still holds it
    pub fn entry_state(&self, offset: u32) -> Option<EntryState> {
        self.state.read().backing.entries.get(&offset).map(|loc| loc.state)
    }

    /// Mark an entry freed by its owner.
    ///
    /// Returns false for unknown or already-freed entries.
    pub fn free(&self, offset: u32) -> bool {
        let mut state = self.state.write();
        let Some(loc) = state.backing.entries.get_mut(&offset) else {
            return false;
        };

        match loc.state {
            EntryState::Freed => false,
            EntryState::Dropped => {
                loc.state = EntryState::Freed;
                true
            }
            EntryState::Live => {
                loc.state = EntryState::Freed;
                let footprint = loc.footprint();
                state.live_bytes -= footprint;
                true
            }
        }
    }

    /// Mark a live entry dead on the cleaner's behalf.
    ///
    /// Returns true if the entry was live.
    pub fn drop_entry(&self, offset: u32) -> bool {
        let mut state = self.state.write();
        let Some(loc) = state.backing.entries.get_mut(&offset) else {
            return false;
        };
        if loc.state != EntryState::Live {
            return false;
        }

        loc.state = EntryState::Dropped;
        let footprint = loc.footprint();
        state.live_bytes -= footprint;
        true
    }

    /// Copies of all entries that are still live, in offset order
    pub fn live_entries(&self) -> Vec<LogEntry> {
        let state = self.state.read();
        state
            .backing
            .entries
            .iter()
            .filter(|(_, loc)| loc.state == EntryState::Live)
            .filter_map(|(&offset, loc)| {
                Some(LogEntry {
                    entry_type: loc.entry_type,
                    reference: Reference::new(self.slot, offset),
                    data: loc.payload()?,
                })
            })
            .collect()
    }

    /// Frames still held by the backing, by logical offset
    pub fn resident_frames(&self) -> Vec<(u32, Bytes)> {
        let state = self.state.read();
        state
            .backing
            .entries
            .iter()
            .filter_map(|(&offset, loc)| Some((offset, loc.frame.clone()?)))
            .collect()
    }

    /// Number of entries still live
    pub fn live_entry_count(&self) -> usize {
        self.state
            .read()
            .backing
            .entries
            .values()
            .filter(|loc| loc.state == EntryState::Live)
            .count()
    }

    /// Close the segment to further appends and certify its contents.
    ///
    /// Sealing twice returns the original certificate.
    pub fn seal(&self) -> SegmentCertificate {
        let mut state = self.state.write();
        if let Some(certificate) = state.certificate {
            return certificate;
        }

        let certificate = SegmentCertificate {
            segment_length: state.write_offset,
            checksum: state.checksum.clone().finalize(),
        };
        state.certificate = Some(certificate);
        self.sealed.store(true, Ordering::Release);
        certificate
    }

    /// Certificate issued at seal time
    pub fn certificate(&self) -> Option<SegmentCertificate> {
        self.state.read().certificate
    }

    /// Snapshot of this segment's utilization
    pub fn usage(&self) -> SegmentUsage {
        let state = self.state.read();
        SegmentUsage {
            segment_id: self.id,
            slot: self.slot,
            capacity: self.capacity,
            write_offset: state.write_offset,
            live_bytes: state.live_bytes,
            resident_bytes: state.backing.reserved,
        }
    }

    /// Bytes charged against the memory budget
    pub fn resident_bytes(&self) -> u32 {
        self.state.read().backing.reserved
    }

    // =========================================================================
    // Cleaner Support
    // =========================================================================

    /// Claim the segment for a cleaning operation; false if already claimed
    pub(crate) fn try_begin_cleaning(&self) -> bool {
        self.cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_cleaning(&self) {
        self.cleaning.store(false, Ordering::Release);
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::Acquire)
    }

    pub(crate) fn cached_timestamp(&self) -> Option<u32> {
        match self.timestamp.load(Ordering::Relaxed) {
            NO_TIMESTAMP => None,
            ts => Some(ts as u32),
        }
    }

    pub(crate) fn cache_timestamp(&self, timestamp: u32) {
        self.timestamp.store(u64::from(timestamp), Ordering::Relaxed);
    }

    /// Build a backing holding only the live entries, at their original
    /// logical offsets.
    ///
    /// Live frames are shared, not copied. Dropped entries become tombstones
    /// so a late `free` from their owner still succeeds; freed entries are
    /// left out.
    pub fn compacted_backing(&self) -> SegmentBacking {
        let state = self.state.read();
        let mut entries = BTreeMap::new();
        let mut reserved = 0u32;

        for (&offset, loc) in &state.backing.entries {
            match loc.state {
                EntryState::Live => {
                    reserved += loc.footprint();
                    entries.insert(offset, loc.clone());
                }
                EntryState::Dropped => {
                    entries.insert(
                        offset,
                        EntryLocation {
                            frame: None,
                            ..loc.clone()
                        },
                    );
                }
                EntryState::Freed => {}
            }
        }

        SegmentBacking { entries, reserved }
    }

    /// Swap in a new backing, keeping frees that landed after it was built.
    ///
    /// Returns the number of budget bytes released.
    pub(crate) fn swap_backing(&self, mut backing: SegmentBacking) -> u32 {
        let mut state = self.state.write();

        for (offset, loc) in backing.entries.iter_mut() {
            if let Some(current) = state.backing.entries.get(offset) {
                if current.state != EntryState::Live {
                    loc.state = current.state;
                }
            }
        }

        state.live_bytes = backing
            .entries
            .values()
            .filter(|loc| loc.state == EntryState::Live)
            .map(|loc| loc.footprint())
            .sum();

        let released = state.backing.reserved.saturating_sub(backing.reserved);
        state.backing = backing;
        released
    }
}
