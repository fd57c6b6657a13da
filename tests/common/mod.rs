use std::path::PathBuf;
use std::sync::Arc;

use strata::{
    Clock, DirectFlushPolicy, FileVersionController, GroupOptions, ManualClock, NoopWal,
    NullMetadata, RoundRobinDirs, StorageGroup, StorageGroupConfig,
};
use tempfile::TempDir;

pub const GROUP: &str = "sg1";

#[allow(dead_code)]
pub fn open_group(
    dir: &TempDir,
    config: StorageGroupConfig,
    now: i64,
) -> (Arc<ManualClock>, Arc<StorageGroup>) {
    let sys = dir.path().join("system");
    let data = dir.path().join("data");
    let clock = Arc::new(ManualClock::new(now));
    let options = GroupOptions {
        config,
        clock: Arc::clone(&clock) as Arc<dyn Clock>,
        dirs: Arc::new(RoundRobinDirs::new([data]).expect("data roots")),
        versions: Arc::new(FileVersionController::new(sys.join(GROUP)).expect("version dir")),
        metadata: Arc::new(NullMetadata),
        wal: Arc::new(NoopWal),
        flush_policy: Arc::new(DirectFlushPolicy),
    };
    let group = StorageGroup::open_with(GROUP, &sys, options).expect("open group");
    (clock, group)
}

#[allow(dead_code)]
pub fn sequence_dir(dir: &TempDir, partition: i64) -> PathBuf {
    dir.path()
        .join("data")
        .join("sequence")
        .join(GROUP)
        .join(partition.to_string())
}

#[allow(dead_code)]
pub fn unsequence_dir(dir: &TempDir, partition: i64) -> PathBuf {
    dir.path()
        .join("data")
        .join("unsequence")
        .join(GROUP)
        .join(partition.to_string())
}

#[allow(dead_code)]
pub fn sys_group_dir(dir: &TempDir) -> PathBuf {
    dir.path().join("system").join(GROUP)
}
