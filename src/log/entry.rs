//! Log entry definitions
//!
//! Defines the structure of individual entries as stored in a segment.

use bytes::{BufMut, Bytes, BytesMut};

use super::Reference;

/// Bytes of framing in front of every entry: type (1) + length (4)
pub const ENTRY_HEADER_SIZE: usize = 5;

/// Type tag of an entry.
///
/// The log only stores it; what a type means belongs to the owner of the
/// entries (see `LogEntryHandlers`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogEntryType(pub u8);

impl LogEntryType {
    /// A stored object
    pub const OBJECT: LogEntryType = LogEntryType(1);

    /// A deletion marker for an object
    pub const TOMBSTONE: LogEntryType = LogEntryType(2);

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// An entry read back out of the log, as handed to `LogEntryHandlers`
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// The entry's type tag
    pub entry_type: LogEntryType,

    /// Where the entry currently lives
    pub reference: Reference,

    /// Payload (without the header)
    pub data: Bytes,
}

/// Serialize an entry into its in-segment form: `[type][len LE][data]`
pub(crate) fn encode_entry(entry_type: LogEntryType, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + data.len());
    buf.put_u8(entry_type.as_u8());
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Space an entry with `len` payload bytes occupies in a segment
pub(crate) fn entry_footprint(len: usize) -> usize {
    ENTRY_HEADER_SIZE + len
}
