//! Log addressing
//!
//! `Reference` is the only handle the rest of the server may keep long-term.
//! `Position` is the logical append clock.

use std::fmt;

/// Stable identifier of a segment's slot in the segment table
pub type SlotId = u32;

/// Opaque handle to one log entry: `slot` in the high 32 bits, `offset`
/// in the low 32 bits.
///
/// A slot names a segment indirectly, so the segment's storage can be
/// replaced without invalidating references. References are only meaningful
/// inside the process that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference(u64);

impl Reference {
    const OFFSET_BITS: u32 = 32;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// Pack a slot and an in-segment offset
    pub fn new(slot: SlotId, offset: u32) -> Self {
        Self((u64::from(slot) << Self::OFFSET_BITS) | u64::from(offset))
    }

    /// Slot component
    pub fn slot(self) -> SlotId {
        (self.0 >> Self::OFFSET_BITS) as SlotId
    }

    /// Offset component
    pub fn offset(self) -> u32 {
        (self.0 & Self::OFFSET_MASK) as u32
    }

    /// Raw value, for storage in an in-memory index
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a reference from `as_u64`
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot(), self.offset())
    }
}

/// A `(segment id, segment offset)` point in the log.
///
/// Ordered by segment id, then offset. The default position is the very
/// beginning of the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    segment_id: u64,
    segment_offset: u32,
}

impl Position {
    pub fn new(segment_id: u64, segment_offset: u32) -> Self {
        Self {
            segment_id,
            segment_offset,
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn segment_offset(&self) -> u32 {
        self.segment_offset
    }
}
