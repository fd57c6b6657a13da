mod common;

use common::{open_group, sequence_dir, sys_group_dir};
use strata::{NoopFileManager, Record, StorageGroupConfig, Value};
use tempfile::TempDir;

#[test]
fn reopened_group_restores_index_and_watermarks() {
    let dir = TempDir::new().unwrap();
    {
        let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);
        group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
        group.insert(Record::point("d1", "m1", 20, 2i64)).unwrap();
        group.sync_close_all();
    }

    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 2_000_000);
    assert_eq!(group.file_counts(), (1, 0));

    // The recovered watermark still routes history to the unsequential
    // side and fresh rows to the sequential side.
    group.insert(Record::point("d1", "m1", 15, 3i64)).unwrap();
    assert_eq!(group.working_counts(), (0, 1));
    group.insert(Record::point("d1", "m1", 30, 4i64)).unwrap();
    assert_eq!(group.working_counts(), (1, 1));
    group.sync_close_all();

    let source = group
        .query("d1", "m1", None, 1, &NoopFileManager)
        .unwrap();
    let points = source.read_all().unwrap();
    assert_eq!(
        points,
        vec![
            (10, Value::I64(1)),
            (15, Value::I64(3)),
            (20, Value::I64(2)),
            (30, Value::I64(4)),
        ]
    );
}

#[test]
fn unsealed_file_is_reopened_writable() {
    let dir = TempDir::new().unwrap();
    {
        let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);
        group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
        // No close: the newest file stays unsealed on disk.
    }

    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 2_000_000);
    assert_eq!(group.file_counts(), (1, 0));
    assert_eq!(group.working_counts(), (1, 0));
}

#[test]
fn new_version_numbers_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);
        group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
        group.sync_close_all();
        group.insert(Record::point("d1", "m1", 20, 2i64)).unwrap();
        group.sync_close_all();
    }

    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 2_000_000);
    group.insert(Record::point("d1", "m1", 30, 3i64)).unwrap();
    group.sync_close_all();

    let mut versions: Vec<u64> = std::fs::read_dir(sequence_dir(&dir, 0))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("seg"))
        .map(|p| strata::layout::FileName::parse_path(&p).unwrap().version)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[test]
fn interrupted_merge_state_is_discarded_by_default() {
    let dir = TempDir::new().unwrap();
    {
        let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);
        group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
        group.sync_close_all();
    }
    std::fs::write(sys_group_dir(&dir).join("merge.mods"), b"").unwrap();
    std::fs::write(sys_group_dir(&dir).join("merge.log"), b"{}").unwrap();

    let (_clock, _group) = open_group(&dir, StorageGroupConfig::default(), 2_000_000);
    assert!(!sys_group_dir(&dir).join("merge.mods").exists());
    assert!(!sys_group_dir(&dir).join("merge.log").exists());
}

#[test]
fn orphan_merge_log_is_removed() {
    let dir = TempDir::new().unwrap();
    {
        let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);
        group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
        group.sync_close_all();
    }
    std::fs::write(sys_group_dir(&dir).join("merge.log"), b"{}").unwrap();

    let (_clock, _group) = open_group(&dir, StorageGroupConfig::default(), 2_000_000);
    assert!(!sys_group_dir(&dir).join("merge.log").exists());
}

#[test]
fn non_numeric_directories_are_skipped() {
    let dir = TempDir::new().unwrap();
    {
        let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);
        group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
        group.sync_close_all();
    }
    let stray = dir
        .path()
        .join("data")
        .join("sequence")
        .join(common::GROUP)
        .join("upgrade");
    std::fs::create_dir_all(&stray).unwrap();
    std::fs::write(stray.join("junk.seg"), b"junk").unwrap();

    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 2_000_000);
    assert_eq!(group.file_counts(), (1, 0));
}
