//! Tests for the log cleaner
//!
//! These tests verify:
//! - Cost-benefit scoring
//! - Relocation of survivors and reclamation of emptied segments
//! - Dead-entry detection and refused relocations
//! - In-place compaction of highly utilized segments
//! - Replication bookkeeping around cleaning
//! - The background cleaner under sustained overwrite load

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{delete, open_log, open_log_with, payload, put, small_config};
use ramlog::cleaner::cost_benefit;
use ramlog::error::LogError;
use ramlog::replication::Backup;
use ramlog::segment::SegmentUsage;
use ramlog::{BackupReplicaManager, Config, LogEntryType, MemoryBackup};

// =============================================================================
// Helper Functions
// =============================================================================

fn usage(capacity: u32, live_bytes: u32) -> SegmentUsage {
    SegmentUsage {
        segment_id: 0,
        slot: 0,
        capacity,
        write_offset: capacity,
        live_bytes,
        resident_bytes: capacity,
    }
}

/// Fill segments 0..count with 10 entries each (keys 10*s .. 10*s+9), then
/// roll so all of them are sealed
fn fill_segments(log: &ramlog::Log, index: &common::TestIndex, count: u64) {
    for key in 0..count * 10 {
        put(log, index, key, 95);
    }
    log.allocate_head_if_still_on(None).unwrap();
}

fn assert_invalid(log: &ramlog::Log, reference: ramlog::Reference) {
    let mut out = Vec::new();
    assert!(matches!(
        log.get_entry(reference, &mut out),
        Err(LogError::InvalidReference(_))
    ));
}

// =============================================================================
// Scoring Tests
// =============================================================================

#[test]
fn test_cost_benefit_prefers_empty_segments() {
    assert_eq!(cost_benefit(&usage(1024, 0), 1), f64::INFINITY);
    assert_eq!(cost_benefit(&usage(1024, 1024), 1_000), 0.0);
}

#[test]
fn test_cost_benefit_prefers_emptier_and_older() {
    let sparse = cost_benefit(&usage(1024, 100), 10);
    let dense = cost_benefit(&usage(1024, 800), 10);
    let old_dense = cost_benefit(&usage(1024, 800), 1_000);

    assert!(sparse > dense);
    assert!(old_dense > dense);
}

#[test]
fn test_cost_benefit_age_floor() {
    assert_eq!(
        cost_benefit(&usage(1024, 512), 0),
        cost_benefit(&usage(1024, 512), 1)
    );
}

// =============================================================================
// Relocation Tests
// =============================================================================

#[test]
fn test_clean_relocates_survivors_and_frees_segments() {
    let (log, index) = open_log(small_config());
    fill_segments(&log, &index, 2);
    let old_survivors = [index.get(3).unwrap(), index.get(17).unwrap()];
    for key in 0..20u64 {
        if key != 3 && key != 17 {
            delete(&log, &index, key);
        }
    }

    let stats = log.clean().unwrap();

    assert_eq!(stats.segments_cleaned, 2);
    assert_eq!(stats.entries_relocated, 2);
    assert_eq!(stats.relocations_refused, 0);
    assert_eq!(stats.bytes_relocated, 200);
    assert_eq!(stats.bytes_reclaimed, 2 * 1024);
    assert_eq!(index.relocations(), 2);
    assert!(!log.contains_segment(0));
    assert!(!log.contains_segment(1));

    for key in [3u64, 17] {
        assert_eq!(index.read(&log, key).unwrap(), payload(key, 95));
        assert_eq!(log.segment_id(index.get(key).unwrap()).unwrap(), 2);
    }
    for reference in old_survivors {
        assert_invalid(&log, reference);
    }
}

#[test]
fn test_clean_never_frees_segment_with_live_entries() {
    let (log, index) = open_log(small_config());
    fill_segments(&log, &index, 3);
    // Only segment 1 has garbage
    delete(&log, &index, 12);

    let stats = log.clean().unwrap();

    // Segments 0 and 2 have nothing dead and are left alone
    assert!(log.contains_segment(0));
    assert!(log.contains_segment(2));
    assert_eq!(stats.segments_cleaned, 1);
    assert_eq!(stats.entries_relocated, 9);
    for key in 0..30u64 {
        if key == 12 {
            assert!(index.read(&log, key).is_none());
        } else {
            assert_eq!(index.read(&log, key).unwrap(), payload(key, 95));
        }
    }
}

#[test]
fn test_clean_drops_dead_entries() {
    let (log, index) = open_log(small_config());
    // Entries the index never learns about are dead to the cleaner
    let references: Vec<_> = (0..10u64)
        .map(|key| {
            log.append(LogEntryType::OBJECT, &payload(key, 95), false)
                .unwrap()
                .unwrap()
        })
        .collect();
    log.allocate_head_if_still_on(Some(0)).unwrap();
    log.free(references[0]).unwrap();
    log.free(references[1]).unwrap();

    let stats = log.clean().unwrap();

    assert_eq!(stats.entries_dead, 8);
    assert_eq!(stats.entries_relocated, 0);
    assert_eq!(stats.segments_cleaned, 1);
    assert_eq!(index.relocations(), 0);
    assert!(!log.contains_segment(0));
}

#[test]
fn test_clean_discards_refused_relocations() {
    let (log, index) = open_log(small_config());
    fill_segments(&log, &index, 1);
    for key in 0..8u64 {
        delete(&log, &index, key);
    }
    let head_before = log.head_position();
    index.set_refuse_relocation(true);

    let stats = log.clean().unwrap();

    assert_eq!(stats.relocations_refused, 2);
    assert_eq!(stats.entries_relocated, 0);
    assert_eq!(stats.segments_cleaned, 1);
    assert!(!log.contains_segment(0));

    // The discarded copies were written and then freed
    assert!(log.head_position() > head_before);
    assert!(index.read(&log, 8).is_none());
}

#[test]
fn test_clean_owner_frees_relocated_entry() {
    let (log, index) = open_log(small_config());
    fill_segments(&log, &index, 1);
    for key in 1..10u64 {
        delete(&log, &index, key);
    }

    log.clean().unwrap();

    // The owner now holds the new reference and frees it normally
    let moved = index.get(0).unwrap();
    delete(&log, &index, 0);
    assert_invalid(&log, moved);
}

#[test]
fn test_clean_with_nothing_to_do() {
    let (log, index) = open_log(small_config());
    fill_segments(&log, &index, 2);

    let stats = log.clean().unwrap();

    assert!(!stats.made_progress());
    assert_eq!(stats, ramlog::CleanerStats::default());
}

#[test]
fn test_clean_respects_segments_per_pass() {
    let config = Config::builder()
        .segment_size(1024)
        .max_log_bytes(64 * 1024)
        .disable_cleaner(true)
        .max_segments_per_pass(2)
        .build();
    let (log, index) = open_log(config);
    fill_segments(&log, &index, 4);
    for key in 0..40u64 {
        delete(&log, &index, key);
    }

    assert_eq!(log.clean().unwrap().segments_cleaned, 2);
    assert_eq!(log.clean().unwrap().segments_cleaned, 2);
    assert_eq!(log.clean().unwrap().segments_cleaned, 0);
    for segment_id in 0..4 {
        assert!(!log.contains_segment(segment_id));
    }
}

#[test]
fn test_clean_prefers_older_segments() {
    let config = Config::builder()
        .segment_size(1024)
        .max_log_bytes(64 * 1024)
        .disable_cleaner(true)
        .max_segments_per_pass(1)
        .build();
    let (log, index) = open_log(config);
    for key in 0..20u64 {
        // Segment 0 holds ancient entries, segment 1 recent ones
        let timestamp = if key < 10 { 1 } else { u32::MAX - 10 };
        index.set_timestamp(key, timestamp);
    }
    fill_segments(&log, &index, 2);
    for key in [0u64, 1, 10, 11] {
        delete(&log, &index, key);
    }

    let stats = log.clean().unwrap();

    assert_eq!(stats.segments_cleaned, 1);
    assert!(!log.contains_segment(0));
    assert!(log.contains_segment(1));
}

// =============================================================================
// Compaction Tests
// =============================================================================

fn compaction_config() -> Config {
    Config::builder()
        .segment_size(1024)
        .max_log_bytes(64 * 1024)
        .disable_cleaner(true)
        .max_clean_utilization_pct(50)
        .compaction_dead_pct(20)
        .build()
}

#[test]
fn test_clean_compacts_dense_segments_in_place() {
    let (log, index) = open_log(compaction_config());
    fill_segments(&log, &index, 1);
    for key in [2u64, 5, 7] {
        delete(&log, &index, key);
    }
    let references: Vec<_> = index.keys().iter().map(|&k| index.get(k).unwrap()).collect();
    let resident_before = log.stats().resident_bytes;

    let stats = log.clean().unwrap();

    assert_eq!(stats.segments_compacted, 1);
    assert_eq!(stats.segments_cleaned, 0);
    assert_eq!(stats.entries_relocated, 0);
    assert_eq!(stats.bytes_reclaimed, 1024 - 700);
    assert_eq!(log.stats().resident_bytes, resident_before - 324);
    assert!(log.contains_segment(0));
    assert_eq!(index.relocations(), 0);

    // References did not move
    let after: Vec<_> = index.keys().iter().map(|&k| index.get(k).unwrap()).collect();
    assert_eq!(references, after);
    for key in index.keys() {
        assert_eq!(index.read(&log, key).unwrap(), payload(key, 95));
    }
}

#[test]
fn test_compacted_segment_is_not_compacted_again() {
    let (log, index) = open_log(compaction_config());
    fill_segments(&log, &index, 1);
    for key in [2u64, 5, 7] {
        delete(&log, &index, key);
    }
    log.clean().unwrap();

    let stats = log.clean().unwrap();

    assert!(!stats.made_progress());
}

#[test]
fn test_frees_after_compaction_still_work() {
    let (log, index) = open_log(compaction_config());
    fill_segments(&log, &index, 1);
    for key in [2u64, 5, 7] {
        delete(&log, &index, key);
    }
    log.clean().unwrap();

    let reference = index.get(4).unwrap();
    delete(&log, &index, 4);

    assert_invalid(&log, reference);
    assert!(matches!(
        log.free(reference),
        Err(LogError::InvalidReference(_))
    ));
}

#[test]
fn test_owner_can_free_entry_dropped_by_compaction() {
    let (log, index) = open_log(small_config());
    for key in 0..5u64 {
        put(&log, &index, key, 95);
    }
    log.allocate_head_if_still_on(Some(0)).unwrap();

    // Unlinked by its owner, not yet freed
    let reference = index.remove(3).unwrap();

    let stats = log.clean().unwrap();
    assert_eq!(stats.segments_compacted, 1);
    assert_eq!(stats.entries_dead, 1);
    assert_eq!(stats.bytes_reclaimed, 1024 - 400);
    assert!(log.contains_segment(0));

    assert_invalid(&log, reference);
    log.free(reference).unwrap();
    assert!(matches!(
        log.free(reference),
        Err(LogError::InvalidReference(_))
    ));
    for key in [0u64, 1, 2, 4] {
        assert_eq!(index.read(&log, key).unwrap(), payload(key, 95));
    }
}

#[test]
fn test_dense_segment_below_threshold_is_untouched() {
    let (log, index) = open_log(compaction_config());
    fill_segments(&log, &index, 1);
    delete(&log, &index, 2);

    // 124 dead bytes of 1024 is under 20%
    let stats = log.clean().unwrap();

    assert!(!stats.made_progress());
    assert_eq!(log.stats().resident_bytes, 2 * 1024);
}

// =============================================================================
// Replication Interaction Tests
// =============================================================================

#[test]
fn test_clean_releases_replicas_and_replicates_survivors() {
    let nodes: Vec<Arc<MemoryBackup>> = (0..3).map(|id| Arc::new(MemoryBackup::new(id))).collect();
    for node in &nodes {
        node.set_latency(Duration::from_millis(1));
    }
    let backups: Vec<Arc<dyn Backup>> = nodes
        .iter()
        .map(|n| Arc::clone(n) as Arc<dyn Backup>)
        .collect();
    let manager = Arc::new(BackupReplicaManager::new(backups, 3).unwrap());
    let config = Config::builder()
        .segment_size(1024)
        .max_log_bytes(64 * 1024)
        .disable_cleaner(true)
        .build();
    let (log, index) = open_log_with(config, manager.clone());

    fill_segments(&log, &index, 1);
    for key in 1..10u64 {
        delete(&log, &index, key);
    }
    log.sync().unwrap();
    assert!(nodes[0].segment_ids().contains(&0));

    let stats = log.clean().unwrap();
    assert_eq!(stats.segments_cleaned, 1);

    // Barrier: the free job is ordered before this write
    log.append(LogEntryType::OBJECT, &payload(99, 16), true)
        .unwrap()
        .unwrap();

    let survivor_segment = log.segment_id(index.get(0).unwrap()).unwrap();
    for node in &nodes {
        let held = node.segment_ids();
        assert!(!held.contains(&0));
        assert!(held.contains(&survivor_segment));
    }
    assert!(manager.replicas_of(0).is_empty());
}

// =============================================================================
// Background Cleaner Tests
// =============================================================================

#[test]
fn test_background_cleaner_keeps_up_with_overwrites() {
    let config = Config::builder()
        .segment_size(1024)
        .max_log_bytes(16 * 1024)
        .cleaner_low_water_pct(50)
        .cleaner_poll_ms(1)
        .build();
    let (log, index) = open_log(config);
    let deadline = Instant::now() + Duration::from_secs(30);

    // 2000 writes over 20 keys: far more than the 16 KB budget holds
    for i in 0..2000u64 {
        let key = i % 20;
        let data = payload(i, 95);
        let reference = loop {
            match log.append(LogEntryType::OBJECT, &data, false).unwrap() {
                Some(reference) => break reference,
                None => {
                    assert!(Instant::now() < deadline, "cleaner made no room");
                    thread::sleep(Duration::from_millis(1));
                }
            }
        };
        index.replace(&log, key, reference);
    }

    assert!(log.stats().resident_bytes <= 16 * 1024);
    for key in 0..20u64 {
        let expected = payload(1980 + key, 95);
        assert_eq!(index.read(&log, key).unwrap(), expected);
    }
}

#[test]
fn test_log_drop_stops_background_cleaner() {
    let config = Config::builder()
        .segment_size(1024)
        .max_log_bytes(16 * 1024)
        .cleaner_low_water_pct(0)
        .cleaner_poll_ms(1)
        .build();
    let (log, index) = open_log(config);
    put(&log, &index, 1, 64);

    let start = Instant::now();
    drop(log);

    assert!(start.elapsed() < Duration::from_secs(5));
}
