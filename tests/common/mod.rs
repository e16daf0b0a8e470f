//! Shared helpers for ramlog tests
//!
//! `TestIndex` plays the role of the server's hash table: it maps keys to
//! references and implements `LogEntryHandlers` on top of that map.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ramlog::{
    Config, Log, LogEntry, LogEntryHandlers, LogEntryType, NoReplication, Reference,
    ReplicaManager,
};

// =============================================================================
// Tracing
// =============================================================================

/// Route log output to the test harness (`RUST_LOG=ramlog=debug`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Test Index
// =============================================================================

/// Key → reference map that owns the entries of a test log.
///
/// Payloads start with their key as 8 little-endian bytes.
#[derive(Default)]
pub struct TestIndex {
    entries: Mutex<HashMap<u64, Reference>>,
    timestamps: Mutex<HashMap<u64, u32>>,
    relocations: AtomicUsize,
    refuse_relocation: AtomicBool,
}

impl TestIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, key: u64, reference: Reference) -> Option<Reference> {
        self.entries.lock().insert(key, reference)
    }

    pub fn get(&self, key: u64) -> Option<Reference> {
        self.entries.lock().get(&key).copied()
    }

    pub fn remove(&self, key: u64) -> Option<Reference> {
        self.entries.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.entries.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Point `key` at `reference`, freeing the entry it replaces.
    ///
    /// The free happens under the index lock so the cleaner cannot move or
    /// reclaim the old entry in between.
    pub fn replace(&self, log: &Log, key: u64, reference: Reference) {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.insert(key, reference) {
            log.free(old).unwrap();
        }
    }

    /// Drop `key` and free its entry, under the index lock
    pub fn delete(&self, log: &Log, key: u64) {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.remove(&key) {
            log.free(old).unwrap();
        }
    }

    /// Read `key` while holding the index lock, as a server read would
    pub fn read(&self, log: &Log, key: u64) -> Option<Vec<u8>> {
        let entries = self.entries.lock();
        let reference = *entries.get(&key)?;
        let mut out = Vec::new();
        log.get_entry(reference, &mut out).ok()?;
        Some(out)
    }

    pub fn set_timestamp(&self, key: u64, timestamp: u32) {
        self.timestamps.lock().insert(key, timestamp);
    }

    /// Accepted relocations so far
    pub fn relocations(&self) -> usize {
        self.relocations.load(Ordering::SeqCst)
    }

    /// Make `relocate` report every entry as having died
    pub fn set_refuse_relocation(&self, refuse: bool) {
        self.refuse_relocation.store(refuse, Ordering::SeqCst);
    }
}

pub fn key_of(entry: &LogEntry) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&entry.data[..8]);
    u64::from_le_bytes(raw)
}

impl LogEntryHandlers for TestIndex {
    fn timestamp(&self, entry: &LogEntry) -> u32 {
        self.timestamps
            .lock()
            .get(&key_of(entry))
            .copied()
            .unwrap_or(0)
    }

    fn check_liveness(&self, entry: &LogEntry) -> bool {
        self.get(key_of(entry)) == Some(entry.reference)
    }

    fn relocate(&self, entry: &LogEntry, new_reference: Reference) -> bool {
        if self.refuse_relocation.load(Ordering::SeqCst) {
            return false;
        }

        let mut entries = self.entries.lock();
        match entries.get_mut(&key_of(entry)) {
            Some(current) if *current == entry.reference => {
                *current = new_reference;
                self.relocations.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `len`-byte payload (at least 8) tagged with `key`
pub fn payload(key: u64, len: usize) -> Vec<u8> {
    let mut data = key.to_le_bytes().to_vec();
    data.extend((0..len.saturating_sub(8)).map(|i| (key as usize + i) as u8));
    data
}

// =============================================================================
// Log Setup
// =============================================================================

/// 1 KB segments, 64 KB budget, cleaner off
pub fn small_config() -> Config {
    Config::builder()
        .segment_size(1024)
        .max_log_bytes(64 * 1024)
        .disable_cleaner(true)
        .build()
}

pub fn open_log(config: Config) -> (Log, Arc<TestIndex>) {
    open_log_with(config, Arc::new(NoReplication))
}

pub fn open_log_with(config: Config, replicas: Arc<dyn ReplicaManager>) -> (Log, Arc<TestIndex>) {
    init_tracing();
    let index = TestIndex::new();
    let log = Log::new(config, index.clone(), replicas).unwrap();
    (log, index)
}

/// Append an object for `key` and record it in the index
pub fn put(log: &Log, index: &TestIndex, key: u64, len: usize) -> Reference {
    let reference = log
        .append(LogEntryType::OBJECT, &payload(key, len), false)
        .unwrap()
        .expect("log out of space");
    index.replace(log, key, reference);
    reference
}

/// Remove `key` from the index and free its entry
pub fn delete(log: &Log, index: &TestIndex, key: u64) {
    index.delete(log, key);
}
