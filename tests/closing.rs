mod common;

use std::time::Instant;

use common::open_group;
use strata::{Record, StorageGroupConfig};
use tempfile::TempDir;

#[test]
fn close_all_with_empty_working_sets_returns_immediately() {
    let dir = TempDir::new().unwrap();
    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);

    let started = Instant::now();
    group.sync_close_all();
    assert!(started.elapsed().as_secs() < 1);
}

#[test]
fn sealing_promotes_flushed_watermarks() {
    let dir = TempDir::new().unwrap();
    let config = StorageGroupConfig {
        partition_interval_ms: 100,
        ..Default::default()
    };
    let (_clock, group) = open_group(&dir, config, 1_000_000);

    group.insert(Record::point("d1", "m1", 30, 1i64)).unwrap();
    group.insert(Record::point("d1", "m1", 130, 2i64)).unwrap();
    group.sync_close_all();

    // The watermark of each partition now rejects its own history.
    group.insert(Record::point("d1", "m1", 30, 9i64)).unwrap();
    group.insert(Record::point("d1", "m1", 130, 9i64)).unwrap();
    assert_eq!(group.working_counts(), (0, 2));

    // Newer rows still go sequential in both partitions.
    group.insert(Record::point("d1", "m1", 31, 9i64)).unwrap();
    group.insert(Record::point("d1", "m1", 131, 9i64)).unwrap();
    assert_eq!(group.working_counts(), (2, 2));
}

#[test]
fn sealed_files_carry_frozen_end_times() {
    let dir = TempDir::new().unwrap();
    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);

    group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
    group.insert(Record::point("d1", "m1", 25, 2i64)).unwrap();
    group.insert(Record::point("d2", "m1", 40, 3i64)).unwrap();
    group.sync_close_all();

    let seq_dir = common::sequence_dir(&dir, 0);
    let mut files: Vec<_> = std::fs::read_dir(&seq_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("seg"))
        .collect();
    assert_eq!(files.len(), 1);
    let resource = strata::FileResource::load(&files.remove(0)).unwrap();
    assert!(resource.is_closed());
    assert_eq!(resource.start_time("d1"), Some(10));
    assert_eq!(resource.end_time("d1"), Some(25));
    assert_eq!(resource.end_time("d2"), Some(40));
}
