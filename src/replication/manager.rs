//! Backup Replica Manager
//!
//! Replicates segments to a set of `Backup`s from a single worker thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::{LogError, Result};

use super::{Backup, BackupId, ReplicaManager, SegmentCertificate};

/// Work handed to the replication worker, in enqueue order
enum Job {
    Write {
        seq: u64,
        segment_id: u64,
        offset: u32,
        data: Bytes,
    },
    Close {
        seq: u64,
        segment_id: u64,
        certificate: Bytes,
    },
    Free {
        segment_id: u64,
    },
    BackupFailed {
        backup: BackupId,
    },
    Shutdown,
}

struct BackupSlot {
    backup: Arc<dyn Backup>,
    healthy: bool,
    /// Segments currently replicated here
    load: usize,
}

/// Replication bookkeeping for one segment
#[derive(Default)]
struct ReplicatedSegment {
    /// Frames kept for re-replication; the same allocations the segment
    /// holds, not copies
    chunks: Vec<(u32, Bytes)>,
    certificate: Option<Bytes>,
    /// Certificate of the compacted image, once the segment was compacted
    compacted_certificate: Option<Bytes>,
    /// Bytes already delivered to the current replicas
    replicated_len: u32,
    /// Certificate already delivered to the current replicas
    closed: bool,
    /// Indexes into `ReplicationState::backups`
    replicas: Vec<usize>,
    /// Replicas rebuilt from the compacted image. They already hold their
    /// final contents and take no further writes or closes.
    self_certified: Vec<usize>,
}

struct ReplicationState {
    enqueued: u64,
    acknowledged: u64,
    /// Healthy backups left when replication became impossible
    failure: Option<usize>,
    backups: Vec<BackupSlot>,
    segments: HashMap<u64, ReplicatedSegment>,
}

/// Catch-up work for a backup that just became a replica of a segment
struct Replay {
    backup_idx: usize,
    backup: Arc<dyn Backup>,
    segment_id: u64,
    /// Frames at the offset they take in the replica
    writes: Vec<(u32, Bytes)>,
    certificate: Option<Bytes>,
}

struct Shared {
    replication_factor: usize,
    state: Mutex<ReplicationState>,
    acked: Condvar,
}

/// `ReplicaManager` backed by a fixed set of backups.
///
/// ## Concurrency:
/// - `enqueue`/`close` take the state lock briefly and queue a job
/// - One worker thread performs all backup I/O without holding the lock
/// - `sync` waits on a condvar for the worker's acknowledgements
pub struct BackupReplicaManager {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackupReplicaManager {
    /// Start replicating to `backups` with the config's replication factor
    pub fn from_config(backups: Vec<Arc<dyn Backup>>, config: &Config) -> Result<Self> {
        Self::new(backups, config.replication_factor)
    }

    /// Start replicating to `backups`, `replication_factor` copies per segment
    pub fn new(backups: Vec<Arc<dyn Backup>>, replication_factor: usize) -> Result<Self> {
        if replication_factor == 0 {
            return Err(LogError::Config(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if backups.len() < replication_factor {
            return Err(LogError::InsufficientBackups {
                available: backups.len(),
                required: replication_factor,
            });
        }

        let shared = Arc::new(Shared {
            replication_factor,
            state: Mutex::new(ReplicationState {
                enqueued: 0,
                acknowledged: 0,
                failure: None,
                backups: backups
                    .into_iter()
                    .map(|backup| BackupSlot {
                        backup,
                        healthy: true,
                        load: 0,
                    })
                    .collect(),
                segments: HashMap::new(),
            }),
            acked: Condvar::new(),
        });

        let (tx, rx) = channel::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("ramlog-replication".to_string())
            .spawn(move || worker_shared.run(rx))
            .map_err(|e| LogError::Replication(format!("failed to start worker: {}", e)))?;

        Ok(Self {
            shared,
            jobs: tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Report a backup as crashed; its segments are re-replicated elsewhere
    pub fn handle_backup_failure(&self, backup: BackupId) -> Result<()> {
        self.jobs
            .send(Job::BackupFailed { backup })
            .map_err(|_| worker_stopped())
    }

    /// Backups currently holding a replica of `segment_id`
    pub fn replicas_of(&self, segment_id: u64) -> Vec<BackupId> {
        let state = self.shared.state.lock();
        state
            .segments
            .get(&segment_id)
            .map(|seg| seg.replicas.iter().map(|&i| state.backups[i].backup.id()).collect())
            .unwrap_or_default()
    }

    /// Number of backups not known to have failed
    pub fn healthy_backups(&self) -> usize {
        self.shared.state.lock().backups.iter().filter(|b| b.healthy).count()
    }

    pub fn replication_factor(&self) -> usize {
        self.shared.replication_factor
    }
}

impl ReplicaManager for BackupReplicaManager {
    fn enqueue(&self, segment_id: u64, offset: u32, data: Bytes) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.check_healthy(&state)?;

        state.enqueued += 1;
        let seq = state.enqueued;
        state
            .segments
            .entry(segment_id)
            .or_default()
            .chunks
            .push((offset, data.clone()));

        // Sent under the lock so jobs reach the worker in sequence order.
        self.jobs
            .send(Job::Write {
                seq,
                segment_id,
                offset,
                data,
            })
            .map_err(|_| worker_stopped())
    }

    fn close(&self, segment_id: u64, certificate: SegmentCertificate) -> Result<()> {
        let certificate = Bytes::from(certificate.encode()?);

        let mut state = self.shared.state.lock();
        self.shared.check_healthy(&state)?;

        state.enqueued += 1;
        let seq = state.enqueued;
        state.segments.entry(segment_id).or_default().certificate = Some(certificate.clone());

        self.jobs
            .send(Job::Close {
                seq,
                segment_id,
                certificate,
            })
            .map_err(|_| worker_stopped())
    }

    fn compacted(&self, segment_id: u64, frames: Vec<(u32, Bytes)>) -> Result<()> {
        let certificate =
            SegmentCertificate::for_frames(frames.iter().map(|(_, frame)| &frame[..]));
        let certificate = Bytes::from(certificate.encode()?);

        let mut state = self.shared.state.lock();
        if let Some(seg) = state.segments.get_mut(&segment_id) {
            tracing::debug!(
                "Segment {} compacted; retaining {} of {} frames",
                segment_id,
                frames.len(),
                seg.chunks.len()
            );
            seg.chunks = frames;
            seg.compacted_certificate = Some(certificate);
        }
        Ok(())
    }

    fn free(&self, segment_id: u64) {
        if self.jobs.send(Job::Free { segment_id }).is_err() {
            tracing::warn!("Replication worker stopped; replicas of segment {} kept", segment_id);
        }
    }

    fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let target = state.enqueued;

        loop {
            self.shared.check_healthy(&state)?;
            if state.acknowledged >= target {
                return Ok(());
            }
            self.shared.acked.wait(&mut state);
        }
    }
}

impl Drop for BackupReplicaManager {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Replication worker panicked");
            }
        }
    }
}

impl Shared {
    fn check_healthy(&self, state: &ReplicationState) -> Result<()> {
        match state.failure {
            Some(available) => Err(LogError::InsufficientBackups {
                available,
                required: self.replication_factor,
            }),
            None => Ok(()),
        }
    }

    /// Worker loop: drain jobs until shutdown
    fn run(&self, jobs: Receiver<Job>) {
        tracing::debug!("Replication worker started");

        while let Ok(job) = jobs.recv() {
            match job {
                Job::Write {
                    seq,
                    segment_id,
                    offset,
                    data,
                } => {
                    if self.replicate(segment_id, |b| b.write(segment_id, offset, &data)) {
                        let mut state = self.state.lock();
                        if let Some(seg) = state.segments.get_mut(&segment_id) {
                            let end = offset + data.len() as u32;
                            seg.replicated_len = seg.replicated_len.max(end);
                        }
                    }
                    self.acknowledge(seq);
                }
                Job::Close {
                    seq,
                    segment_id,
                    certificate,
                } => {
                    if self.replicate(segment_id, |b| b.close(segment_id, &certificate)) {
                        let mut state = self.state.lock();
                        if let Some(seg) = state.segments.get_mut(&segment_id) {
                            seg.closed = true;
                        }
                    }
                    self.acknowledge(seq);
                }
                Job::Free { segment_id } => self.release(segment_id),
                Job::BackupFailed { backup } => {
                    let idx = self
                        .state
                        .lock()
                        .backups
                        .iter()
                        .position(|slot| slot.backup.id() == backup);
                    match idx {
                        Some(idx) => self.handle_failure(idx),
                        None => tracing::warn!("Failure reported for unknown backup {}", backup),
                    }
                }
                Job::Shutdown => break,
            }
        }

        tracing::debug!("Replication worker stopped");
    }

    fn acknowledge(&self, seq: u64) {
        let mut state = self.state.lock();
        state.acknowledged = state.acknowledged.max(seq);
        self.acked.notify_all();
    }

    /// Apply `op` to every replica of `segment_id`, replacing replicas that
    /// fail along the way.
    ///
    /// Returns false if the segment is gone or replication has failed.
    fn replicate<F>(&self, segment_id: u64, op: F) -> bool
    where
        F: Fn(&dyn Backup) -> Result<()>,
    {
        let mut done: HashSet<usize> = HashSet::new();

        loop {
            let (targets, replays) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.failure.is_some() || !state.segments.contains_key(&segment_id) {
                    return false;
                }

                let Some(replays) = self.fill_replicas(state, segment_id) else {
                    return false;
                };

                let targets: Vec<(usize, Arc<dyn Backup>)> = state
                    .segments
                    .get(&segment_id)
                    .map(|seg| {
                        seg.replicas
                            .iter()
                            .filter(|idx| {
                                !done.contains(*idx) && !seg.self_certified.contains(*idx)
                            })
                            .map(|&idx| (idx, Arc::clone(&state.backups[idx].backup)))
                            .collect()
                    })
                    .unwrap_or_default();
                (targets, replays)
            };

            self.run_replays(replays);

            if targets.is_empty() {
                return true;
            }

            for (idx, backup) in targets {
                match op(backup.as_ref()) {
                    Ok(()) => {
                        done.insert(idx);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Replication of segment {} to backup {} failed: {}",
                            segment_id,
                            backup.id(),
                            e
                        );
                        self.handle_failure(idx);
                    }
                }
            }
        }
    }

    /// Top `segment_id` up to the replication factor.
    ///
    /// Returns the catch-up work for newly chosen replicas, or `None` (and
    /// enters the failed state) when too few healthy backups remain.
    fn fill_replicas(&self, state: &mut ReplicationState, segment_id: u64) -> Option<Vec<Replay>> {
        let mut work = Vec::new();

        loop {
            let Some(seg) = state.segments.get(&segment_id) else {
                return Some(work);
            };
            if seg.replicas.len() >= self.replication_factor {
                return Some(work);
            }

            // Least-loaded healthy backup not already holding this segment
            let candidate = state
                .backups
                .iter()
                .enumerate()
                .filter(|(idx, slot)| slot.healthy && !seg.replicas.contains(idx))
                .min_by_key(|(_, slot)| slot.load)
                .map(|(idx, _)| idx);

            let Some(idx) = candidate else {
                let available = state.backups.iter().filter(|b| b.healthy).count();
                tracing::error!(
                    "Cannot keep {} replicas of segment {}: {} healthy backups left",
                    self.replication_factor,
                    segment_id,
                    available
                );
                state.failure = Some(available);
                self.acked.notify_all();
                return None;
            };

            state.backups[idx].load += 1;
            let backup = Arc::clone(&state.backups[idx].backup);

            if let Some(seg) = state.segments.get_mut(&segment_id) {
                seg.replicas.push(idx);

                let (writes, certificate) = match seg.compacted_certificate.clone() {
                    Some(certificate) => {
                        seg.self_certified.push(idx);
                        (packed(&seg.chunks), Some(certificate))
                    }
                    None => {
                        let writes: Vec<(u32, Bytes)> = seg
                            .chunks
                            .iter()
                            .filter(|(offset, _)| *offset < seg.replicated_len)
                            .cloned()
                            .collect();
                        let certificate = if seg.closed { seg.certificate.clone() } else { None };
                        (writes, certificate)
                    }
                };

                if !writes.is_empty() || certificate.is_some() {
                    work.push(Replay {
                        backup_idx: idx,
                        backup,
                        segment_id,
                        writes,
                        certificate,
                    });
                }
            }
        }
    }

    /// Bring new replicas up to date with what their peers already hold
    fn run_replays(&self, work: Vec<Replay>) {
        for replay in work {
            tracing::debug!(
                "Re-replicating segment {} to backup {}",
                replay.segment_id,
                replay.backup.id()
            );

            let result = replay
                .writes
                .iter()
                .try_for_each(|(offset, data)| replay.backup.write(replay.segment_id, *offset, data))
                .and_then(|()| match &replay.certificate {
                    Some(certificate) => replay.backup.close(replay.segment_id, certificate),
                    None => Ok(()),
                });

            if let Err(e) = result {
                tracing::warn!(
                    "Re-replication of segment {} to backup {} failed: {}",
                    replay.segment_id,
                    replay.backup.id(),
                    e
                );
                self.handle_failure(replay.backup_idx);
            }
        }
    }

    /// Take a backup out of service and re-replicate everything it held
    fn handle_failure(&self, failed: usize) {
        let work = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.backups[failed].healthy {
                return;
            }

            state.backups[failed].healthy = false;
            state.backups[failed].load = 0;
            tracing::warn!(
                "Backup {} failed; re-replicating its segments",
                state.backups[failed].backup.id()
            );

            let mut affected = Vec::new();
            for (&segment_id, seg) in state.segments.iter_mut() {
                if let Some(pos) = seg.replicas.iter().position(|&idx| idx == failed) {
                    seg.replicas.remove(pos);
                    seg.self_certified.retain(|&idx| idx != failed);
                    affected.push(segment_id);
                }
            }
            affected.sort_unstable();

            let mut work = Vec::new();
            for segment_id in affected {
                match self.fill_replicas(state, segment_id) {
                    Some(replays) => work.extend(replays),
                    None => break,
                }
            }
            work
        };

        self.run_replays(work);
    }

    /// Forget a reclaimed segment and drop its replicas
    fn release(&self, segment_id: u64) {
        let backups: Vec<Arc<dyn Backup>> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(seg) = state.segments.remove(&segment_id) else {
                return;
            };
            seg.replicas
                .iter()
                .map(|&idx| {
                    let slot = &mut state.backups[idx];
                    slot.load = slot.load.saturating_sub(1);
                    Arc::clone(&slot.backup)
                })
                .collect()
        };

        for backup in backups {
            backup.free(segment_id);
        }
    }
}

/// Lay compacted frames end to end from offset 0
fn packed(frames: &[(u32, Bytes)]) -> Vec<(u32, Bytes)> {
    let mut offset = 0u32;
    frames
        .iter()
        .map(|(_, frame)| {
            let at = offset;
            offset += frame.len() as u32;
            (at, frame.clone())
        })
        .collect()
}

fn worker_stopped() -> LogError {
    LogError::Replication("replication worker stopped".to_string())
}
