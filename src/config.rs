//! Configuration for CellarDB
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CellarError, Result};

/// Main configuration for a CellarDB store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── catalog.bin                  (table schema catalog)
    ///     └── tables/{name}/
    ///           ├── wal/                   (rotating log files)
    ///           └── segments/              (MANIFEST + segment files)
    pub data_dir: PathBuf,

    /// Target size of a segment data block (in bytes)
    pub block_size: usize,

    /// Bloom filter bits per distinct row key
    pub bloom_bits_per_key: usize,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync WAL
    pub wal_sync_strategy: WalSyncStrategy,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Max payload size of a memtable before flush (in bytes)
    pub memtable_size_limit: usize,

    // -------------------------------------------------------------------------
    // Background Maintenance
    // -------------------------------------------------------------------------
    /// Run flushes and compactions on a background thread.
    /// When false, flushes run inline on the writing thread and compaction
    /// only runs when requested explicitly.
    pub background_maintenance: bool,

    /// Compaction policy
    pub compaction: CompactionConfig,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },

    /// fsync once the oldest unsynced entry is `interval` old
    EveryInterval { interval: Duration },
}

impl WalSyncStrategy {
    /// Longest time an appended entry may stay unsynced
    ///
    /// The maintenance worker syncs pending entries at least this often.
    pub fn max_unsynced_age(&self) -> Duration {
        match self {
            WalSyncStrategy::EveryWrite => Duration::ZERO,
            WalSyncStrategy::EveryNEntries { .. } => Self::DEFAULT_INTERVAL * 5,
            WalSyncStrategy::EveryInterval { interval } => *interval,
        }
    }

    const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
}

/// Size-tiered compaction settings
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Live segment count at which a background compaction is scheduled
    pub trigger: usize,

    /// Max number of segments merged by one minor compaction
    pub max_inputs: usize,

    /// Output segments are split once they reach this size (in bytes)
    pub max_segment_size: u64,

    /// Versions per column always retained by compaction
    pub max_versions: usize,

    /// Shadowed versions survive while their shadowing write is younger than this
    pub version_retention: Duration,

    /// Tombstones younger than this survive major compaction
    pub tombstone_grace: Duration,

    /// First retry delay after a failed background compaction
    pub retry_base: Duration,

    /// Upper bound on the retry delay
    pub retry_max: Duration,

    /// Attempts before a failed compaction is given up until the next trigger
    pub max_retries: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger: 4,
            max_inputs: 8,
            max_segment_size: 64 * 1024 * 1024, // 64 MB
            max_versions: 1,
            version_retention: Duration::ZERO,
            tombstone_grace: Duration::from_secs(60),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cellar_data"),
            block_size: 4 * 1024,
            bloom_bits_per_key: 10,
            wal_sync_strategy: WalSyncStrategy::EveryInterval {
                interval: WalSyncStrategy::DEFAULT_INTERVAL,
            },
            memtable_size_limit: 64 * 1024 * 1024, // 64 MB
            background_maintenance: true,
            compaction: CompactionConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memtable_size_limit == 0 {
            return Err(CellarError::Config("memtable_size_limit must be > 0".into()));
        }
        if self.block_size == 0 {
            return Err(CellarError::Config("block_size must be > 0".into()));
        }
        match self.wal_sync_strategy {
            WalSyncStrategy::EveryNEntries { count: 0 } => {
                return Err(CellarError::Config("WAL sync count must be > 0".into()));
            }
            WalSyncStrategy::EveryInterval { interval } if interval.is_zero() => {
                return Err(CellarError::Config("WAL sync interval must be > 0".into()));
            }
            _ => {}
        }
        if self.compaction.trigger < 2 {
            return Err(CellarError::Config("compaction trigger must be >= 2".into()));
        }
        if self.compaction.max_inputs < 2 {
            return Err(CellarError::Config("compaction max_inputs must be >= 2".into()));
        }
        if self.compaction.max_versions == 0 {
            return Err(CellarError::Config("max_versions must be >= 1".into()));
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
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn memtable_size_limit(mut self, size: usize) -> Self {
        self.config.memtable_size_limit = size;
        self
    }

    /// Set the segment block size (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the Bloom filter density
    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.config.bloom_bits_per_key = bits;
        self
    }

    /// Enable or disable the background maintenance thread
    pub fn background_maintenance(mut self, enabled: bool) -> Self {
        self.config.background_maintenance = enabled;
        self
    }

    /// Segment count that schedules a compaction
    pub fn compaction_trigger(mut self, count: usize) -> Self {
        self.config.compaction.trigger = count;
        self
    }

    /// Max segments merged by one minor compaction
    pub fn compaction_max_inputs(mut self, count: usize) -> Self {
        self.config.compaction.max_inputs = count;
        self
    }

    /// Split compaction output at this size (in bytes)
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.config.compaction.max_segment_size = size;
        self
    }

    /// Versions per column kept by compaction
    pub fn max_versions(mut self, versions: usize) -> Self {
        self.config.compaction.max_versions = versions;
        self
    }

    /// Retention window for shadowed versions
    pub fn version_retention(mut self, retention: Duration) -> Self {
        self.config.compaction.version_retention = retention;
        self
    }

    /// Grace period before major compaction may drop a tombstone
    pub fn tombstone_grace(mut self, grace: Duration) -> Self {
        self.config.compaction.tombstone_grace = grace;
        self
    }

    /// Backoff schedule for failed background compactions
    pub fn compaction_retry(mut self, base: Duration, max: Duration, attempts: u32) -> Self {
        self.config.compaction.retry_base = base;
        self.config.compaction.retry_max = max;
        self.config.compaction.max_retries = attempts;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
