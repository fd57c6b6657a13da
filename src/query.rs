//! Query snapshot types and the read-side collaborator interfaces.

use std::sync::Arc;

use crate::memtable::Value;
use crate::resource::FileResource;

/// Time predicate supplied by the query engine.
pub trait TimeFilter: Send + Sync {
    /// May any point in `[start, end]` satisfy the filter?
    fn satisfy_start_end_time(&self, start: i64, end: i64) -> bool;
}

/// Closed interval filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl TimeFilter for TimeRange {
    fn satisfy_start_end_time(&self, start: i64, end: i64) -> bool {
        start <= self.max && end >= self.min
    }
}

/// One readable source in a snapshot: either a sealed file, or an unsealed
/// file paired with the in-memory points of its writable buffer at capture
/// time.
pub enum ReadSource {
    Sealed(Arc<FileResource>),
    Unsealed {
        resource: Arc<FileResource>,
        rows: Vec<(i64, Value)>,
    },
}

impl ReadSource {
    pub fn resource(&self) -> &Arc<FileResource> {
        match self {
            ReadSource::Sealed(resource) => resource,
            ReadSource::Unsealed { resource, .. } => resource,
        }
    }

    /// Points of the captured series, disk rows first, then any in-memory
    /// rows. Tombstones are applied to the disk side. The per-file lock is
    /// held so the file cannot be removed or moved mid-read.
    pub fn read(&self, device: &str, measurement: &str) -> crate::Result<Vec<(i64, Value)>> {
        let _guard = self.resource().write_query_lock().read();
        match self {
            ReadSource::Sealed(resource) => resource.read_series(device, measurement),
            ReadSource::Unsealed { resource, rows } => {
                let mut points = resource.read_series(device, measurement)?;
                points.extend(rows.iter().cloned());
                points.sort_by_key(|(t, _)| *t);
                points.dedup_by_key(|(t, _)| *t);
                Ok(points)
            }
        }
    }
}

/// Consistent snapshot of the resources a single-series query may read.
/// The lists are detached from subsequent index mutations.
pub struct QueryDataSource {
    pub device: String,
    pub measurement: String,
    pub seq: Vec<ReadSource>,
    pub unseq: Vec<ReadSource>,
}

impl QueryDataSource {
    /// Flatten the snapshot into sorted deduplicated points, unsequential
    /// sources overriding sequential ones at equal timestamps.
    pub fn read_all(&self) -> crate::Result<Vec<(i64, Value)>> {
        let mut merged: std::collections::BTreeMap<i64, Value> = std::collections::BTreeMap::new();
        for source in self.seq.iter().chain(self.unseq.iter()) {
            for (t, v) in source.read(&self.device, &self.measurement)? {
                merged.insert(t, v);
            }
        }
        Ok(merged.into_iter().collect())
    }
}

/// Registers the files a running query holds so that background work does
/// not remove them mid-read.
pub trait QueryFileManager: Send + Sync {
    fn add_used_files(&self, query_id: u64, source: &QueryDataSource);
}

/// Default manager for callers without a query registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFileManager;

impl QueryFileManager for NoopFileManager {
    fn add_used_files(&self, _query_id: u64, _source: &QueryDataSource) {}
}
