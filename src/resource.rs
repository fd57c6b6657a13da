//! One data file and its sidecar state.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::layout::{self, FileName};
use crate::memtable::Value;
use crate::mods::{Deletion, ModificationFile};
use crate::query::TimeFilter;
use crate::{Error, Result};

/// One persisted point, as laid down by the buffer flush walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub device: String,
    pub measurement: String,
    pub t: i64,
    pub v: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResourceMeta {
    start: HashMap<String, i64>,
    end: HashMap<String, i64>,
    versions: Vec<u64>,
    closed: bool,
}

#[derive(Debug, Default)]
struct DeviceTimes {
    start: HashMap<String, i64>,
    end: HashMap<String, i64>,
}

/// A data file under coordinator control.
///
/// The `closed`/`deleted`/`merging` flags and the time maps are written
/// under the coordinator's writer lock; the per-resource lock only guards
/// physical removal and moves against in-flight reads.
pub struct FileResource {
    path: RwLock<PathBuf>,
    partition: i64,
    times: RwLock<DeviceTimes>,
    versions: RwLock<BTreeSet<u64>>,
    closed: AtomicBool,
    deleted: AtomicBool,
    merging: AtomicBool,
    write_query_lock: RwLock<()>,
    mods: Mutex<ModificationFile>,
}

impl std::fmt::Debug for FileResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileResource")
            .field("path", &*self.path.read())
            .field("partition", &self.partition)
            .field("closed", &self.is_closed())
            .field("deleted", &self.is_deleted())
            .field("merging", &self.is_merging())
            .finish()
    }
}

impl FileResource {
    pub fn new(
        path: impl Into<PathBuf>,
        partition: i64,
        versions: impl IntoIterator<Item = u64>,
    ) -> Self {
        let path = path.into();
        let mods = ModificationFile::new(layout::mods_path(&path));
        Self {
            path: RwLock::new(path),
            partition,
            times: RwLock::new(DeviceTimes::default()),
            versions: RwLock::new(versions.into_iter().collect()),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            write_query_lock: RwLock::new(()),
            mods: Mutex::new(mods),
        }
    }

    /// Recover a resource from its sidecar. The partition id is encoded as
    /// the immediate parent directory name.
    pub fn load(data_path: &Path) -> Result<Self> {
        let partition = partition_from_path(data_path)?;
        let meta_path = layout::resource_path(data_path);
        let bytes = std::fs::read(&meta_path)?;
        let meta: ResourceMeta = serde_json::from_slice(&bytes)?;
        let resource = Self::new(data_path, partition, meta.versions.clone());
        {
            let mut times = resource.times.write();
            times.start = meta.start;
            times.end = meta.end;
        }
        resource.closed.store(meta.closed, Ordering::Release);
        Ok(resource)
    }

    /// Rebuild sidecar state by scanning the data file, for recovery when
    /// the sidecar is missing or unreadable. The file is left unsealed.
    pub fn rebuild(data_path: &Path) -> Result<Self> {
        let partition = partition_from_path(data_path)?;
        let name = FileName::parse_path(data_path)?;
        let resource = Self::new(data_path, partition, [name.version]);
        for record in read_records(data_path)? {
            resource.update_start_time(&record.device, record.t);
            resource.update_end_time(&record.device, record.t);
        }
        Ok(resource)
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn set_path(&self, path: PathBuf) {
        *self.mods.lock() = ModificationFile::new(layout::mods_path(&path));
        *self.path.write() = path;
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }

    pub fn file_name(&self) -> Result<FileName> {
        FileName::parse_path(&self.path())
    }

    pub fn historical_versions(&self) -> BTreeSet<u64> {
        self.versions.read().clone()
    }

    pub fn add_historical_versions(&self, versions: impl IntoIterator<Item = u64>) {
        self.versions.write().extend(versions);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Release);
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    /// Lock guarding physical removal or relocation against readers.
    pub fn write_query_lock(&self) -> &RwLock<()> {
        &self.write_query_lock
    }

    pub fn start_time(&self, device: &str) -> Option<i64> {
        self.times.read().start.get(device).copied()
    }

    pub fn end_time(&self, device: &str) -> Option<i64> {
        self.times.read().end.get(device).copied()
    }

    pub fn devices(&self) -> Vec<String> {
        self.times.read().start.keys().cloned().collect()
    }

    pub fn update_start_time(&self, device: &str, timestamp: i64) {
        let mut times = self.times.write();
        let entry = times
            .start
            .entry(device.to_string())
            .or_insert(timestamp);
        if timestamp < *entry {
            *entry = timestamp;
        }
    }

    pub fn update_end_time(&self, device: &str, timestamp: i64) {
        let mut times = self.times.write();
        let entry = times.end.entry(device.to_string()).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Replace both time maps wholesale, used when a merge rewrite
    /// publishes new per-device ranges.
    pub fn replace_times(&self, start: HashMap<String, i64>, end: HashMap<String, i64>) {
        let mut times = self.times.write();
        times.start = start;
        times.end = end;
    }

    /// Overwrite the end time, used when sealing freezes sequential end
    /// times from the RAM table.
    pub fn set_end_time(&self, device: &str, timestamp: i64) {
        self.times
            .write()
            .end
            .insert(device.to_string(), timestamp);
    }

    /// Query admission test: the resource must list the device, must not be
    /// entirely past the ttl cutoff, and must intersect the time filter.
    pub fn is_satisfied(
        &self,
        device: &str,
        filter: Option<&dyn TimeFilter>,
        ttl_ms: Option<i64>,
        now: i64,
    ) -> bool {
        let times = self.times.read();
        let Some(start) = times.start.get(device).copied() else {
            return false;
        };
        let end = times.end.get(device).copied().unwrap_or(i64::MAX);
        if let Some(ttl) = ttl_ms {
            if end < now - ttl {
                return false;
            }
        }
        match filter {
            Some(filter) => filter.satisfy_start_end_time(start, end),
            None => true,
        }
    }

    /// True while any device still has data at or after the cutoff. Files
    /// without end times are treated as alive.
    pub fn still_lives(&self, cutoff: i64) -> bool {
        let times = self.times.read();
        if times.end.is_empty() {
            return true;
        }
        times.end.values().any(|end| *end >= cutoff)
    }

    /// Persist the sidecar, temp-file-then-rename.
    pub fn save_meta(&self) -> Result<()> {
        let times = self.times.read();
        let meta = ResourceMeta {
            start: times.start.clone(),
            end: times.end.clone(),
            versions: self.versions.read().iter().copied().collect(),
            closed: self.is_closed(),
        };
        drop(times);
        let data = serde_json::to_vec(&meta)?;
        let path = layout::resource_path(&self.path());
        let tmp = layout::temp_path(&path);
        std::fs::write(&tmp, &data)?;
        File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn append_mod(&self, deletion: &Deletion) -> Result<u64> {
        self.mods.lock().append(deletion)
    }

    pub fn truncate_mods(&self, len: u64) -> Result<()> {
        self.mods.lock().truncate_to(len)
    }

    pub fn close_mods(&self) {
        self.mods.lock().close();
    }

    pub fn remove_mods(&self) -> Result<()> {
        self.mods.lock().remove()
    }

    pub fn mods_records(&self) -> Result<Vec<Deletion>> {
        self.mods.lock().read_all()
    }

    /// Read the series from disk with tombstones applied.
    pub fn read_series(&self, device: &str, measurement: &str) -> Result<Vec<(i64, Value)>> {
        let tombstones = self.mods_records()?;
        let mut points: Vec<(i64, Value)> = read_records(&self.path())?
            .into_iter()
            .filter(|r| r.device == device && r.measurement == measurement)
            .filter(|r| {
                !tombstones
                    .iter()
                    .any(|d| d.matches(device, measurement) && r.t <= d.upper_bound)
            })
            .map(|r| (r.t, r.v))
            .collect();
        points.sort_by_key(|(t, _)| *t);
        Ok(points)
    }

    pub fn read_records(&self) -> Result<Vec<DataRecord>> {
        read_records(&self.path())
    }

    /// Delete the data file and both sidecars.
    pub fn remove_files(&self) -> Result<()> {
        let path = self.path();
        remove_if_present(&path)?;
        remove_if_present(&layout::resource_path(&path))?;
        self.mods.lock().remove()?;
        Ok(())
    }
}

fn partition_from_path(data_path: &Path) -> Result<i64> {
    data_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(layout::parse_partition_dir)
        .ok_or(Error::Corrupt("data file not under a partition directory"))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub fn read_records(path: &Path) -> Result<Vec<DataRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<DataRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                log::warn!("skipping torn record in {}: {err}", path.display());
            }
        }
    }
    Ok(records)
}
