//! Storage-group configuration.

use serde::{Deserialize, Serialize};

/// Merge candidate selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Bound the selection by number of files.
    MaxFileNum,
    /// Bound the selection by number of distinct devices.
    MaxSeriesNum,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::MaxFileNum
    }
}

/// Configuration for one storage group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageGroupConfig {
    /// Cap on writable buffers per kind (sequential / unsequential).
    /// When an insert would exceed it, the oldest partition is closed first.
    pub concurrent_writing_partitions: usize,

    /// Width of one time partition in milliseconds.
    /// Default: 604_800_000 (7 days)
    pub partition_interval_ms: i64,

    /// Data time-to-live in milliseconds. `None` keeps data forever.
    #[serde(default)]
    pub data_ttl_ms: Option<i64>,

    /// Row count at which a writable buffer reports `should_flush`.
    pub flush_threshold_rows: usize,

    /// Memory budget handed to the merge selector, in bytes.
    pub merge_memory_budget: u64,

    /// Merge candidate selection strategy.
    #[serde(default)]
    pub merge_strategy: MergeStrategy,

    /// Rewrite every selected sequential file even when it received no
    /// unsequential rows.
    pub force_full_merge: bool,

    /// Resume an interrupted merge found at startup instead of discarding
    /// its modification file.
    pub continue_merge_after_reboot: bool,

    /// Mirror deletions into the write-ahead log of every writable buffer.
    pub enable_wal: bool,

    /// Discard a loaded file whose historical versions are already covered
    /// by a present file.
    pub reduce_duplicate_loads: bool,

    /// Worker threads driving asynchronous flush, close and merge.
    pub background_workers: usize,
}

impl Default for StorageGroupConfig {
    fn default() -> Self {
        Self {
            concurrent_writing_partitions: 10,
            partition_interval_ms: 604_800_000,
            data_ttl_ms: None,
            flush_threshold_rows: 100_000,
            merge_memory_budget: 256 * 1024 * 1024,
            merge_strategy: MergeStrategy::default(),
            force_full_merge: false,
            continue_merge_after_reboot: false,
            enable_wal: false,
            reduce_duplicate_loads: true,
            background_workers: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StorageGroupConfig::default();
        assert_eq!(config.concurrent_writing_partitions, 10);
        assert_eq!(config.partition_interval_ms, 604_800_000);
        assert_eq!(config.data_ttl_ms, None);
        assert_eq!(config.merge_strategy, MergeStrategy::MaxFileNum);
    }

    #[test]
    fn test_config_serialization() {
        let config = StorageGroupConfig {
            data_ttl_ms: Some(1000),
            merge_strategy: MergeStrategy::MaxSeriesNum,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StorageGroupConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data_ttl_ms, Some(1000));
        assert_eq!(back.merge_strategy, MergeStrategy::MaxSeriesNum);
    }
}
