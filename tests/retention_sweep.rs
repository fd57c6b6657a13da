mod common;

use common::{open_group, sequence_dir};
use strata::{Record, StorageGroupConfig};
use tempfile::TempDir;

#[test]
fn sweep_without_a_ttl_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let (_clock, group) = open_group(&dir, StorageGroupConfig::default(), 1_000_000);

    group.insert(Record::point("d1", "m1", 10, 1i64)).unwrap();
    group.sync_close_all();
    group.check_files_ttl();
    assert_eq!(group.file_counts(), (1, 0));
}

#[test]
fn sweep_evicts_fully_expired_sealed_files() {
    let dir = TempDir::new().unwrap();
    let config = StorageGroupConfig {
        data_ttl_ms: Some(1000),
        ..Default::default()
    };
    let (clock, group) = open_group(&dir, config, 10_000);

    group.insert(Record::point("d1", "m1", 9_500, 1i64)).unwrap();
    group.sync_close_all();
    assert_eq!(group.file_counts(), (1, 0));

    // Still inside the ttl window.
    group.check_files_ttl();
    assert_eq!(group.file_counts(), (1, 0));

    clock.set(20_000);
    group.check_files_ttl();
    assert_eq!(group.file_counts(), (0, 0));

    let leftovers: Vec<_> = std::fs::read_dir(sequence_dir(&dir, 0))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn sweep_spares_unsealed_files() {
    let dir = TempDir::new().unwrap();
    let config = StorageGroupConfig {
        data_ttl_ms: Some(1000),
        ..Default::default()
    };
    let (clock, group) = open_group(&dir, config, 10_000);

    group.insert(Record::point("d1", "m1", 9_500, 1i64)).unwrap();
    clock.set(20_000);
    group.check_files_ttl();
    assert_eq!(group.file_counts(), (1, 0));
    assert_eq!(group.working_counts(), (1, 0));
}
