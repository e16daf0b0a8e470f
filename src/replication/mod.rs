//! Replication Module
//!
//! Makes segment bytes durable on backup nodes.
//!
//! ## Responsibilities
//! - Stream newly appended bytes to `replication_factor` backups per segment
//! - Ship a certificate when a segment is sealed
//! - Block `sync` callers until every enqueued write is acknowledged
//! - Re-replicate to a substitute when a backup fails
//!
//! ## Write Path
//! ```text
//!  Log (head lock)          worker thread                 backups
//!  ───────────────          ─────────────                 ───────
//!  enqueue(seg, off, b) ──▶ [job queue] ──▶ write ──▶ B1, B2, B3
//!  close(seg, cert)     ──▶ [job queue] ──▶ close ──▶ B1, B2, B3
//!  sync() ◀── wait until acknowledged >= enqueued
//! ```
//!
//! The bytes kept for re-replication are the segment's own frames, not a
//! copy. Once a segment is compacted, a substitute replica receives the
//! compacted image under a certificate of its own.

mod backup;
mod manager;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use backup::{Backup, MemoryBackup};
pub use manager::BackupReplicaManager;

/// Identifier of a backup node
pub type BackupId = u32;

/// Length and checksum of a sealed segment.
///
/// Backups store it next to the replica so a recovered copy can be checked
/// for completeness and corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCertificate {
    /// Bytes appended to the segment
    pub segment_length: u32,

    /// CRC32 of those bytes in append order
    pub checksum: u32,
}

impl SegmentCertificate {
    /// Serialize for transfer to a backup
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a certificate received from the log
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Certificate for a segment image made of `frames` laid end to end
    pub fn for_frames<'a, I>(frames: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = crc32fast::Hasher::new();
        let mut segment_length = 0u32;
        for frame in frames {
            hasher.update(frame);
            segment_length += frame.len() as u32;
        }
        Self {
            segment_length,
            checksum: hasher.finalize(),
        }
    }

    /// Whether `data` is exactly the certified segment contents
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() == self.segment_length as usize && crc32fast::hash(data) == self.checksum
    }
}

/// Durability of segment bytes across backup replicas
pub trait ReplicaManager: Send + Sync {
    /// Queue `data`, written at `offset` of segment `segment_id`, for
    /// replication. Must not wait for backups.
    fn enqueue(&self, segment_id: u64, offset: u32, data: Bytes) -> Result<()>;

    /// Queue the final certificate of a sealed segment
    fn close(&self, segment_id: u64, certificate: SegmentCertificate) -> Result<()>;

    /// A sealed segment was compacted in place and now holds only `frames`
    /// (logical offset, encoded entry). Bytes retained for re-replication
    /// may shrink to these.
    fn compacted(&self, segment_id: u64, frames: Vec<(u32, Bytes)>) -> Result<()>;

    /// Release the replicas of a reclaimed segment
    fn free(&self, segment_id: u64);

    /// Block until everything enqueued so far is acknowledged by the
    /// configured number of replicas
    fn sync(&self) -> Result<()>;
}

/// Replica manager for a log without backups: everything is durable as soon
/// as it is written locally
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplication;

impl ReplicaManager for NoReplication {
    fn enqueue(&self, _segment_id: u64, _offset: u32, _data: Bytes) -> Result<()> {
        Ok(())
    }

    fn close(&self, _segment_id: u64, _certificate: SegmentCertificate) -> Result<()> {
        Ok(())
    }

    fn compacted(&self, _segment_id: u64, _frames: Vec<(u32, Bytes)>) -> Result<()> {
        Ok(())
    }

    fn free(&self, _segment_id: u64) {}

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
