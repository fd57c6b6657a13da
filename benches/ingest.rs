use criterion::{criterion_group, criterion_main, Criterion};
use strata::{Record, StorageGroup, StorageGroupConfig};
use tempfile::TempDir;

fn bench_insert(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let config = StorageGroupConfig {
        flush_threshold_rows: usize::MAX,
        ..Default::default()
    };
    let group = StorageGroup::open(
        "bench",
        dir.path().join("system"),
        [dir.path().join("data")],
        config,
    )
    .unwrap();

    let mut t = 0i64;
    c.bench_function("insert_point", |b| {
        b.iter(|| {
            t += 1;
            group.insert(Record::point("d1", "m1", t, t)).unwrap();
        })
    });
    group.sync_close_all();
}

criterion_group!(benches, bench_insert);
criterion_main!(benches);
