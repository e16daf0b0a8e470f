//! Configuration for ramlog
//!
//! Centralized configuration with sensible defaults.

use crate::error::{LogError, Result};
use crate::log::ENTRY_HEADER_SIZE;

/// Main configuration for a `Log` instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Segment Configuration
    // -------------------------------------------------------------------------
    /// Capacity of every segment in bytes (entry headers included)
    pub segment_size: u32,

    /// Memory budget for resident segments. When opening another head would
    /// exceed it, appends report backpressure instead of allocating.
    pub max_log_bytes: u64,

    // -------------------------------------------------------------------------
    // Replication Configuration
    // -------------------------------------------------------------------------
    /// Number of backup replicas each segment must reach before it counts
    /// as durable
    pub replication_factor: usize,

    // -------------------------------------------------------------------------
    // Cleaner Configuration
    // -------------------------------------------------------------------------
    /// Do not start the background cleaner (`Log::clean` still works)
    pub disable_cleaner: bool,

    /// Memory utilization (percent of `max_log_bytes`) at which the
    /// background cleaner starts working
    pub cleaner_low_water_pct: u8,

    /// Segments whose live utilization is above this percentage are never
    /// relocated, only compacted
    pub max_clean_utilization_pct: u8,

    /// Minimum dead share (percent of resident bytes) before a segment is
    /// compacted in memory
    pub compaction_dead_pct: u8,

    /// Upper bound on segments relocated or compacted per cleaning pass
    pub max_segments_per_pass: usize,

    /// How long the idle cleaner sleeps between utilization checks
    pub cleaner_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: 8 * 1024 * 1024,    // 8 MB
            max_log_bytes: 1024 * 1024 * 1024, // 1 GB
            replication_factor: 3,
            disable_cleaner: false,
            cleaner_low_water_pct: 75,
            max_clean_utilization_pct: 90,
            compaction_dead_pct: 20,
            max_segments_per_pass: 4,
            cleaner_poll_ms: 10,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the configuration for values the log cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.segment_size as usize <= ENTRY_HEADER_SIZE {
            return Err(LogError::Config(format!(
                "segment_size must exceed the {}-byte entry header",
                ENTRY_HEADER_SIZE
            )));
        }

        if u64::from(self.segment_size) * 2 > self.max_log_bytes {
            return Err(LogError::Config(
                "max_log_bytes must hold at least two segments".to_string(),
            ));
        }

        for (name, pct) in [
            ("cleaner_low_water_pct", self.cleaner_low_water_pct),
            ("max_clean_utilization_pct", self.max_clean_utilization_pct),
            ("compaction_dead_pct", self.compaction_dead_pct),
        ] {
            if pct > 100 {
                return Err(LogError::Config(format!("{} must be <= 100", name)));
            }
        }

        if self.max_segments_per_pass == 0 {
            return Err(LogError::Config(
                "max_segments_per_pass must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the segment capacity (in bytes)
    pub fn segment_size(mut self, size: u32) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Set the memory budget for resident segments (in bytes)
    pub fn max_log_bytes(mut self, bytes: u64) -> Self {
        self.config.max_log_bytes = bytes;
        self
    }

    /// Set the number of backup replicas per segment
    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    /// Disable the background cleaner thread
    pub fn disable_cleaner(mut self, disable: bool) -> Self {
        self.config.disable_cleaner = disable;
        self
    }

    /// Set the memory utilization that wakes the cleaner (percent)
    pub fn cleaner_low_water_pct(mut self, pct: u8) -> Self {
        self.config.cleaner_low_water_pct = pct;
        self
    }

    /// Set the live utilization above which segments are not relocated (percent)
    pub fn max_clean_utilization_pct(mut self, pct: u8) -> Self {
        self.config.max_clean_utilization_pct = pct;
        self
    }

    /// Set the dead share that triggers in-memory compaction (percent)
    pub fn compaction_dead_pct(mut self, pct: u8) -> Self {
        self.config.compaction_dead_pct = pct;
        self
    }

    /// Set the maximum number of segments handled per cleaning pass
    pub fn max_segments_per_pass(mut self, count: usize) -> Self {
        self.config.max_segments_per_pass = count;
        self
    }

    /// Set the idle cleaner poll interval (in milliseconds)
    pub fn cleaner_poll_ms(mut self, ms: u64) -> Self {
        self.config.cleaner_poll_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
