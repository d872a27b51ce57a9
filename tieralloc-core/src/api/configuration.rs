//! The configuration of the allocator.
//!
//! A Configuration is consumed when constructing a `MemoryManager`, and is not re-validated per call. Only the
//! security mode may be adjusted afterwards.

use std::time::Duration;

use super::{ConfigError, PowerOf2, SecurityMode, SLAB_MAX_OBJECT_SIZE};

/// Configuration
///
/// The Configuration instance allows adjusting block sizes, thresholds, and the optimizations in use.
#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    /// Default size of an arena block.
    pub default_block_size: usize,
    /// Whether to attempt backing large enough mappings with huge pages.
    pub huge_pages: bool,
    /// Whether to bind mappings to the NUMA node of the requesting thread.
    pub numa_aware: bool,
    /// Whether to serve small requests from the slabs.
    pub slab_enabled: bool,
    /// Requests of at least this size are served by the large-object allocator.
    pub large_object_threshold: usize,
    /// Initial security mode.
    pub security_mode: SecurityMode,
    /// Memory usage, in bytes, above which the allocator is under pressure.
    pub pressure_threshold: usize,
    /// Minimum interval between two evaluations of the memory pressure.
    pub pressure_check_interval: Duration,
    /// Minimum interval between two automatic compactions.
    pub compaction_interval: Duration,
    /// Fragmentation ratio above which an automatic compaction is run.
    pub compaction_threshold: f64,
    /// Whether to issue write-prefetch hints on fresh allocations.
    pub prefetch: bool,
}

impl Configuration {
    /// Minimum block size.
    pub const MINIMUM_BLOCK_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(4096) };

    /// Sets `default_block_size`.
    pub fn with_default_block_size(mut self, size: usize) -> Self {
        self.default_block_size = size;
        self
    }

    /// Sets `huge_pages`.
    pub fn with_huge_pages(mut self, enabled: bool) -> Self {
        self.huge_pages = enabled;
        self
    }

    /// Sets `numa_aware`.
    pub fn with_numa_aware(mut self, enabled: bool) -> Self {
        self.numa_aware = enabled;
        self
    }

    /// Sets `slab_enabled`.
    pub fn with_slab(mut self, enabled: bool) -> Self {
        self.slab_enabled = enabled;
        self
    }

    /// Sets `large_object_threshold`.
    pub fn with_large_object_threshold(mut self, threshold: usize) -> Self {
        self.large_object_threshold = threshold;
        self
    }

    /// Sets `security_mode`.
    pub fn with_security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    /// Sets `pressure_threshold`.
    pub fn with_pressure_threshold(mut self, threshold: usize) -> Self {
        self.pressure_threshold = threshold;
        self
    }

    /// Sets `pressure_check_interval`.
    pub fn with_pressure_check_interval(mut self, interval: Duration) -> Self {
        self.pressure_check_interval = interval;
        self
    }

    /// Sets `compaction_interval`.
    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Sets `compaction_threshold`.
    pub fn with_compaction_threshold(mut self, threshold: f64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Sets `prefetch`.
    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    /// Returns the default block size, as a power of 2, if valid.
    pub fn block_size(&self) -> Result<PowerOf2, ConfigError> {
        PowerOf2::new(self.default_block_size)
            .filter(|size| *size >= Self::MINIMUM_BLOCK_SIZE)
            .ok_or(ConfigError::BlockSize(self.default_block_size))
    }

    /// Returns the exclusive minimum of the large object threshold.
    pub fn minimum_large_object_threshold(&self) -> usize {
        if self.slab_enabled { SLAB_MAX_OBJECT_SIZE } else { 0 }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.block_size()?;

        let minimum = self.minimum_large_object_threshold();

        if self.large_object_threshold <= minimum {
            return Err(ConfigError::LargeObjectThreshold { threshold: self.large_object_threshold, minimum });
        }

        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(ConfigError::CompactionThreshold(self.compaction_threshold));
        }

        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            default_block_size: 2 * 1024 * 1024,
            huge_pages: true,
            numa_aware: true,
            slab_enabled: true,
            large_object_threshold: 512 * 1024,
            security_mode: SecurityMode::Enhanced,
            pressure_threshold: 1024 * 1024 * 1024,
            pressure_check_interval: Duration::from_millis(100),
            compaction_interval: Duration::from_secs(30),
            compaction_threshold: 0.25,
            prefetch: true,
        }
    }
}
