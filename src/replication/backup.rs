//! Backups
//!
//! The storage end of replication, plus an in-memory backup for tests and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{LogError, Result};

use super::{BackupId, SegmentCertificate};

/// A node that stores replicas of segments
///
/// Calls block until the backup has acknowledged the operation.
pub trait Backup: Send + Sync {
    fn id(&self) -> BackupId;

    /// Store `data` at `offset` of this backup's replica of `segment_id`
    fn write(&self, segment_id: u64, offset: u32, data: &[u8]) -> Result<()>;

    /// Store the encoded certificate of a sealed segment
    fn close(&self, segment_id: u64, certificate: &[u8]) -> Result<()>;

    /// Drop the replica of `segment_id`
    fn free(&self, segment_id: u64);
}

#[derive(Debug, Default)]
struct Replica {
    data: Vec<u8>,
    certificate: Option<Vec<u8>>,
}

/// Backup that keeps replicas in memory.
///
/// Acknowledgements can be delayed with `set_latency`, and `fail` makes
/// every later operation return `BackupUnavailable`.
pub struct MemoryBackup {
    id: BackupId,
    replicas: Mutex<HashMap<u64, Replica>>,
    latency: Mutex<Duration>,
    failed: AtomicBool,
}

impl MemoryBackup {
    pub fn new(id: BackupId) -> Self {
        Self {
            id,
            replicas: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            failed: AtomicBool::new(false),
        }
    }

    /// Delay every acknowledgement by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Crash the backup
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Bytes held for `segment_id`
    pub fn replica(&self, segment_id: u64) -> Option<Vec<u8>> {
        self.replicas.lock().get(&segment_id).map(|r| r.data.clone())
    }

    /// Segments this backup holds a replica of
    pub fn segment_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.replicas.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a certificate was received for `segment_id`
    pub fn is_closed(&self, segment_id: u64) -> bool {
        self.replicas
            .lock()
            .get(&segment_id)
            .is_some_and(|r| r.certificate.is_some())
    }

    /// Check a closed replica against its certificate
    ///
    /// Returns `Ok(false)` for open, missing or corrupt replicas.
    pub fn verify(&self, segment_id: u64) -> Result<bool> {
        let replicas = self.replicas.lock();
        let Some(replica) = replicas.get(&segment_id) else {
            return Ok(false);
        };
        let Some(encoded) = &replica.certificate else {
            return Ok(false);
        };

        let certificate = SegmentCertificate::decode(encoded)?;
        Ok(certificate.matches(&replica.data))
    }

    fn acknowledge(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.is_failed() {
            return Err(LogError::BackupUnavailable(self.id));
        }
        Ok(())
    }
}

impl Backup for MemoryBackup {
    fn id(&self) -> BackupId {
        self.id
    }

    fn write(&self, segment_id: u64, offset: u32, data: &[u8]) -> Result<()> {
        self.acknowledge()?;

        let mut replicas = self.replicas.lock();
        let replica = replicas.entry(segment_id).or_default();
        let offset = offset as usize;

        // Re-replication replays a segment from its start; anything past the
        // replayed offset is superseded.
        if offset > replica.data.len() {
            return Err(LogError::Replication(format!(
                "gap in replica of segment {}: write at {} but only {} bytes held",
                segment_id,
                offset,
                replica.data.len()
            )));
        }
        replica.data.truncate(offset);
        replica.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&self, segment_id: u64, certificate: &[u8]) -> Result<()> {
        self.acknowledge()?;

        let mut replicas = self.replicas.lock();
        replicas.entry(segment_id).or_default().certificate = Some(certificate.to_vec());
        Ok(())
    }

    fn free(&self, segment_id: u64) {
        self.replicas.lock().remove(&segment_id);
    }
}
