//! The storage-group coordinator.
//!
//! One `StorageGroup` owns the on-disk and in-memory state of a single
//! logical storage group: its time-partitioned data files, their sidecars,
//! the writable buffers feeding them, and the watermark tables that route
//! every row to the sequential or unsequential side.
//!
//! Lock order is `state` (the insert lock), then `merge_state`, then
//! `close_query_lock`, then any per-file lock; release in reverse.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffer::WorkBuffer;
use crate::clock::{Clock, SystemClock};
use crate::config::StorageGroupConfig;
use crate::dirs::{DirectoryRotator, RoundRobinDirs};
use crate::flush::FlushExecutor;
use crate::layout::{self, FileName};
use crate::memtable::Value;
use crate::merge::MergeState;
use crate::meta::{MetadataProvider, NullMetadata};
use crate::mods::Deletion;
use crate::query::{QueryDataSource, QueryFileManager, ReadSource, TimeFilter};
use crate::resource::FileResource;
use crate::tracker::{LatestTimeTracker, NO_TIMESTAMP};
use crate::version::{FileVersionController, PartitionVersionCatalog, VersionController};
use crate::wal::{NoopWal, WalSink};
use crate::{Error, Result};

/// One timestamped write for a single device.
#[derive(Debug, Clone)]
pub struct Record {
    pub device: String,
    pub timestamp: i64,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn point(
        device: impl Into<String>,
        measurement: impl Into<String>,
        timestamp: i64,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            device: device.into(),
            timestamp,
            fields: vec![(measurement.into(), value.into())],
        }
    }
}

/// Column-major batch of rows for a single device, timestamps sorted
/// ascending.
#[derive(Debug, Clone)]
pub struct Tablet {
    pub device: String,
    pub measurements: Vec<String>,
    pub timestamps: Vec<i64>,
    pub columns: Vec<Vec<Value>>,
}

/// Per-row outcome of a tablet insert, index-aligned with the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Ok,
    OutOfTtl,
    InternalError,
}

/// Decides when a writable buffer is handed to the flush pipeline.
pub trait FlushPolicy: Send + Sync {
    fn should_close(&self, buffer: &WorkBuffer) -> bool;
}

/// Default policy: close as soon as the buffer reports it should flush.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFlushPolicy;

impl FlushPolicy for DirectFlushPolicy {
    fn should_close(&self, buffer: &WorkBuffer) -> bool {
        buffer.should_flush()
    }
}

/// Everything guarded by the coordinator's writer lock.
#[derive(Default)]
pub(crate) struct GroupState {
    pub(crate) working_seq: BTreeMap<i64, Arc<WorkBuffer>>,
    pub(crate) working_unseq: BTreeMap<i64, Arc<WorkBuffer>>,
    pub(crate) seq_files: Vec<Arc<FileResource>>,
    pub(crate) unseq_files: Vec<Arc<FileResource>>,
    pub(crate) tracker: LatestTimeTracker,
    pub(crate) catalog: PartitionVersionCatalog,
}

pub(crate) fn resource_key(resource: &FileResource) -> (i64, u64, u32) {
    let name = resource
        .file_name()
        .unwrap_or(FileName::new(0, 0, 0));
    (resource.partition(), name.version, name.merge_cnt)
}

/// Insert a freshly created file at its ordered slot. Externally loaded
/// files use positional insertion instead (their kept names may not sort).
pub(crate) fn register_resource(
    state: &mut GroupState,
    sequential: bool,
    resource: Arc<FileResource>,
) {
    if sequential {
        let key = resource_key(&resource);
        let pos = state
            .seq_files
            .iter()
            .position(|r| resource_key(r) > key)
            .unwrap_or(state.seq_files.len());
        state.seq_files.insert(pos, resource);
    } else {
        state.unseq_files.push(resource);
    }
}

/// Buffers handed to the flush pipeline but not yet fully closed.
pub(crate) struct ClosingSets {
    inner: Mutex<ClosingInner>,
    cond: Condvar,
}

#[derive(Default)]
struct ClosingInner {
    seq: Vec<Arc<WorkBuffer>>,
    unseq: Vec<Arc<WorkBuffer>>,
}

impl ClosingSets {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ClosingInner::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn add(&self, sequential: bool, buffer: Arc<WorkBuffer>) {
        let mut inner = self.inner.lock();
        if sequential {
            inner.seq.push(buffer);
        } else {
            inner.unseq.push(buffer);
        }
    }

    pub(crate) fn remove(&self, buffer: &Arc<WorkBuffer>) {
        let mut inner = self.inner.lock();
        inner.seq.retain(|b| !Arc::ptr_eq(b, buffer));
        inner.unseq.retain(|b| !Arc::ptr_eq(b, buffer));
        self.cond.notify_all();
    }

    pub(crate) fn find(
        &self,
        sequential: bool,
        resource: &Arc<FileResource>,
    ) -> Option<Arc<WorkBuffer>> {
        let inner = self.inner.lock();
        let list = if sequential { &inner.seq } else { &inner.unseq };
        list.iter()
            .find(|b| Arc::ptr_eq(b.resource(), resource))
            .cloned()
    }

    pub(crate) fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.seq.len(), inner.unseq.len())
    }

    pub(crate) fn wait_until_empty(&self, group: &str) {
        let mut inner = self.inner.lock();
        while !inner.seq.is_empty() || !inner.unseq.is_empty() {
            let timed_out = self
                .cond
                .wait_for(&mut inner, Duration::from_secs(60))
                .timed_out();
            if timed_out {
                log::warn!(
                    "storage group {group}: still waiting for {} closing buffers",
                    inner.seq.len() + inner.unseq.len()
                );
            }
        }
    }
}

/// Injectable collaborators for [`StorageGroup::open_with`].
pub struct GroupOptions {
    pub config: StorageGroupConfig,
    pub clock: Arc<dyn Clock>,
    pub dirs: Arc<dyn DirectoryRotator>,
    pub versions: Arc<dyn VersionController>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub wal: Arc<dyn WalSink>,
    pub flush_policy: Arc<dyn FlushPolicy>,
}

pub struct StorageGroup {
    pub(crate) name: String,
    pub(crate) sys_dir: PathBuf,
    pub(crate) config: StorageGroupConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dirs: Arc<dyn DirectoryRotator>,
    pub(crate) versions: Arc<dyn VersionController>,
    metadata: Arc<dyn MetadataProvider>,
    wal: Arc<dyn WalSink>,
    flush_policy: Arc<dyn FlushPolicy>,
    pub(crate) state: RwLock<GroupState>,
    pub(crate) merge_state: RwLock<MergeState>,
    pub(crate) close_query_lock: RwLock<()>,
    pub(crate) closing: ClosingSets,
    pub(crate) sweep_lock: Mutex<()>,
    read_only: AtomicBool,
    pub(crate) executor: FlushExecutor,
}

impl StorageGroup {
    /// Open a storage group with default collaborators: round-robin data
    /// directories, durable version counters in the system directory, the
    /// system clock, and no metadata tree or write-ahead log attached.
    pub fn open(
        name: impl Into<String>,
        sys_root: impl AsRef<Path>,
        data_roots: impl IntoIterator<Item = PathBuf>,
        config: StorageGroupConfig,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let sys_dir = sys_root.as_ref().join(&name);
        std::fs::create_dir_all(&sys_dir)?;
        let options = GroupOptions {
            config,
            clock: Arc::new(SystemClock),
            dirs: Arc::new(RoundRobinDirs::new(data_roots)?),
            versions: Arc::new(FileVersionController::new(&sys_dir)?),
            metadata: Arc::new(NullMetadata),
            wal: Arc::new(NoopWal),
            flush_policy: Arc::new(DirectFlushPolicy),
        };
        Self::open_with(name, sys_root, options)
    }

    pub fn open_with(
        name: impl Into<String>,
        sys_root: impl AsRef<Path>,
        options: GroupOptions,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let sys_dir = sys_root.as_ref().join(&name);
        std::fs::create_dir_all(&sys_dir)?;

        let state = crate::recover::recover_group(&name, &options.config, options.dirs.as_ref())?;
        let (seq, unseq) = (state.seq_files.len(), state.unseq_files.len());

        let group = Arc::new(Self {
            executor: FlushExecutor::new(options.config.background_workers, &name),
            name,
            sys_dir,
            config: options.config,
            clock: options.clock,
            dirs: options.dirs,
            versions: options.versions,
            metadata: options.metadata,
            wal: options.wal,
            flush_policy: options.flush_policy,
            state: RwLock::new(state),
            merge_state: RwLock::new(MergeState::default()),
            close_query_lock: RwLock::new(()),
            closing: ClosingSets::new(),
            sweep_lock: Mutex::new(()),
            read_only: AtomicBool::new(false),
        });
        group.recover_merge_state()?;
        log::info!(
            "storage group {} recovered: {seq} sequential and {unseq} unsequential files",
            group.name
        );
        Ok(group)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn mark_read_only(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            log::error!("storage group {}: entering read-only mode", self.name);
        }
    }

    /// (sequential, unsequential) writable buffer counts.
    pub fn working_counts(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.working_seq.len(), state.working_unseq.len())
    }

    /// (sequential, unsequential) file index sizes.
    pub fn file_counts(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.seq_files.len(), state.unseq_files.len())
    }

    /// (sequential, unsequential) buffers handed to the flush pipeline but
    /// not yet fully closed.
    pub fn closing_counts(&self) -> (usize, usize) {
        self.closing.counts()
    }

    fn check_ttl(&self, timestamp: i64) -> Result<()> {
        if let Some(ttl) = self.config.data_ttl_ms {
            let now = self.clock.now_millis();
            if now - timestamp > ttl {
                return Err(Error::OutOfTtl {
                    timestamp,
                    bound: now - ttl,
                });
            }
        }
        Ok(())
    }

    pub fn insert(self: &Arc<Self>, record: Record) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::WriteProcess(
                "storage group is read-only".to_string(),
            ));
        }
        self.check_ttl(record.timestamp)?;
        let partition =
            layout::partition_of(record.timestamp, self.config.partition_interval_ms);

        let mut state = self.state.write();
        state.tracker.ensure_partition(partition);
        let sequential =
            state
                .tracker
                .is_sequential(partition, &record.device, record.timestamp);
        let buffer = match self.buffer_for(&mut state, partition, sequential) {
            Ok(buffer) => buffer,
            Err(err) => {
                if matches!(err, Error::DiskSpaceInsufficient(_)) {
                    self.mark_read_only();
                }
                return Err(err);
            }
        };
        buffer
            .insert(&record.device, record.timestamp, &record.fields)
            .map_err(|err| Error::WriteProcess(err.to_string()))?;
        state
            .tracker
            .observe(partition, &record.device, record.timestamp);

        let latest_flushed = state.tracker.global_flushed_time(&record.device);
        for (measurement, value) in &record.fields {
            self.metadata.update_last_cache(
                &record.device,
                measurement,
                record.timestamp,
                value,
                latest_flushed,
            )?;
        }

        if self.flush_policy.should_close(&buffer) {
            self.async_close_locked(&mut state, sequential, partition);
        }
        Ok(())
    }

    /// Batch insert. Rows are scanned in order and grouped into runs by
    /// (partition, kind); each run lands in one buffer. The result array is
    /// index-aligned with the input rows.
    pub fn insert_tablet(self: &Arc<Self>, tablet: &Tablet) -> Result<Vec<RowStatus>> {
        let rows = tablet.timestamps.len();
        if tablet.columns.len() != tablet.measurements.len()
            || tablet.columns.iter().any(|c| c.len() != rows)
        {
            return Err(Error::WriteProcess("malformed tablet shape".to_string()));
        }
        if self.is_read_only() {
            return Err(Error::WriteProcess(
                "storage group is read-only".to_string(),
            ));
        }

        let mut statuses = vec![RowStatus::Ok; rows];
        let mut first_valid = 0;
        if let Some(ttl) = self.config.data_ttl_ms {
            let now = self.clock.now_millis();
            while first_valid < rows && now - tablet.timestamps[first_valid] > ttl {
                statuses[first_valid] = RowStatus::OutOfTtl;
                first_valid += 1;
            }
        }
        if first_valid == rows {
            return Ok(statuses);
        }

        let interval = self.config.partition_interval_ms;
        let mut state = self.state.write();
        let mut start = first_valid;
        let mut partition = layout::partition_of(tablet.timestamps[start], interval);
        state.tracker.ensure_partition(partition);
        let mut sequential = false;

        for row in first_valid..rows {
            let row_partition = layout::partition_of(tablet.timestamps[row], interval);
            if row_partition != partition {
                if !self.write_run(&mut state, tablet, start, row, partition, sequential, &mut statuses)
                {
                    return Ok(statuses);
                }
                start = row;
                partition = row_partition;
                sequential = false;
                state.tracker.ensure_partition(partition);
            }
            if !sequential
                && tablet.timestamps[row] > state.tracker.flushed_time(partition, &tablet.device)
            {
                if row > start
                    && !self.write_run(&mut state, tablet, start, row, partition, false, &mut statuses)
                {
                    return Ok(statuses);
                }
                start = row;
                sequential = true;
            }
        }
        self.write_run(&mut state, tablet, start, rows, partition, sequential, &mut statuses);
        Ok(statuses)
    }

    /// Write one run of tablet rows. Returns false when the remaining rows
    /// were marked failed and the scan must stop.
    #[allow(clippy::too_many_arguments)]
    fn write_run(
        self: &Arc<Self>,
        state: &mut GroupState,
        tablet: &Tablet,
        start: usize,
        end: usize,
        partition: i64,
        sequential: bool,
        statuses: &mut [RowStatus],
    ) -> bool {
        if start >= end {
            return true;
        }
        let buffer = match self.buffer_for(state, partition, sequential) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!(
                    "storage group {}: no buffer for partition {partition}: {err}",
                    self.name
                );
                if matches!(err, Error::DiskSpaceInsufficient(_)) {
                    self.mark_read_only();
                }
                for status in statuses[start..].iter_mut() {
                    *status = RowStatus::InternalError;
                }
                return false;
            }
        };
        if let Err(err) = buffer.write_run(
            &tablet.device,
            &tablet.measurements,
            &tablet.timestamps,
            &tablet.columns,
            start,
            end,
        ) {
            log::error!("storage group {}: run write failed: {err}", self.name);
            for status in statuses[start..end].iter_mut() {
                *status = RowStatus::InternalError;
            }
            return true;
        }
        let last = tablet.timestamps[end - 1];
        state.tracker.observe(partition, &tablet.device, last);
        let latest_flushed = state.tracker.global_flushed_time(&tablet.device);
        for (measurement, column) in tablet.measurements.iter().zip(tablet.columns.iter()) {
            let _ = self.metadata.update_last_cache(
                &tablet.device,
                measurement,
                last,
                &column[end - 1],
                latest_flushed,
            );
        }
        if self.flush_policy.should_close(&buffer) {
            self.async_close_locked(state, sequential, partition);
        }
        true
    }

    /// Writable buffer for `(partition, kind)`, creating one if absent and
    /// closing the oldest partition of the kind when the cap is reached.
    fn buffer_for(
        self: &Arc<Self>,
        state: &mut GroupState,
        partition: i64,
        sequential: bool,
    ) -> Result<Arc<WorkBuffer>> {
        let map = if sequential {
            &state.working_seq
        } else {
            &state.working_unseq
        };
        if let Some(buffer) = map.get(&partition) {
            return Ok(Arc::clone(buffer));
        }
        if map.len() >= self.config.concurrent_writing_partitions {
            let oldest = *map.keys().next().expect("map at capacity is non-empty");
            log::info!(
                "storage group {}: closing {} partition {oldest} to admit partition {partition}",
                self.name,
                kind_name(sequential)
            );
            self.async_close_locked(state, sequential, oldest);
        }

        let root = if sequential {
            self.dirs.next_sequential_root()?
        } else {
            self.dirs.next_unsequential_root()?
        };
        let dir = layout::partition_dir(&root, &self.name, partition);
        std::fs::create_dir_all(&dir)?;
        let version = self.versions.next_version(partition)?;
        let file_name = FileName::new(self.clock.now_millis(), version, 0);
        let path = dir.join(file_name.to_string());
        std::fs::File::create(&path)?;

        let resource = Arc::new(FileResource::new(&path, partition, [version]));
        let buffer = Arc::new(WorkBuffer::new(
            partition,
            sequential,
            Arc::clone(&resource),
            version,
            self.config.flush_threshold_rows,
        ));
        state.catalog.record(partition, [version]);
        register_resource(state, sequential, resource);
        let map = if sequential {
            &mut state.working_seq
        } else {
            &mut state.working_unseq
        };
        map.insert(partition, Arc::clone(&buffer));
        log::debug!(
            "storage group {}: opened {} buffer {}",
            self.name,
            kind_name(sequential),
            path.display()
        );
        Ok(buffer)
    }

    /// Move the buffer out of the working map and hand it to the flush
    /// pipeline. Sequential end times are frozen from the RAM table here.
    pub(crate) fn async_close_locked(
        self: &Arc<Self>,
        state: &mut GroupState,
        sequential: bool,
        partition: i64,
    ) {
        let map = if sequential {
            &mut state.working_seq
        } else {
            &mut state.working_unseq
        };
        let Some(buffer) = map.remove(&partition) else {
            return;
        };
        if sequential {
            for device in buffer.resource().devices() {
                let latest = state.tracker.latest_time(partition, &device);
                if latest != NO_TIMESTAMP {
                    buffer.resource().set_end_time(&device, latest);
                }
            }
        }
        if !state.working_seq.contains_key(&partition)
            && !state.working_unseq.contains_key(&partition)
        {
            self.versions.retire(partition);
        }
        self.closing.add(sequential, Arc::clone(&buffer));
        let group = Arc::downgrade(self);
        self.executor.submit(move || {
            if let Some(group) = group.upgrade() {
                group.close_task(buffer);
            }
        });
    }

    fn close_task(self: Arc<Self>, buffer: Arc<WorkBuffer>) {
        let sequential = buffer.is_sequential();
        match buffer.flush_to_disk() {
            Ok(()) => {
                if sequential {
                    self.update_latest_flush_time_callback(&buffer);
                } else {
                    self.unsequence_flush_callback(&buffer);
                }
                if let Err(err) = self.close_unsealed_callback(&buffer) {
                    log::error!(
                        "storage group {}: close failed for {}: {err}",
                        self.name,
                        buffer.resource().path().display()
                    );
                    self.closing.remove(&buffer);
                }
            }
            Err(err) => {
                log::error!(
                    "storage group {}: flush failed for {}: {err}",
                    self.name,
                    buffer.resource().path().display()
                );
                self.closing.remove(&buffer);
            }
        }
    }

    /// Promote the partition's RAM watermarks into the flushed table after
    /// a sequential flush. Returns false iff the partition held no devices.
    pub fn update_latest_flush_time_callback(&self, buffer: &WorkBuffer) -> bool {
        let mut state = self.state.write();
        let promoted = state.tracker.promote_flushed(buffer.partition());
        if !promoted {
            log::debug!(
                "storage group {}: partition {} flushed with no devices",
                self.name,
                buffer.partition()
            );
        }
        promoted
    }

    pub fn unsequence_flush_callback(&self, _buffer: &WorkBuffer) -> bool {
        true
    }

    /// Seal the buffer's file and drop it from the closing set.
    pub fn close_unsealed_callback(&self, buffer: &Arc<WorkBuffer>) -> Result<()> {
        {
            let _guard = self.close_query_lock.write();
            buffer.resource().set_closed(true);
            buffer
                .resource()
                .save_meta()
                .map_err(|err| Error::Processor(err.to_string()))?;
        }
        self.closing.remove(buffer);
        log::info!(
            "storage group {}: sealed {}",
            self.name,
            buffer.resource().path().display()
        );
        Ok(())
    }

    /// Close every writable buffer and wait for the closing sets to drain.
    /// Waits forever, logging progress every 60 seconds.
    pub fn sync_close_all(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            let seq: Vec<i64> = state.working_seq.keys().copied().collect();
            for partition in seq {
                self.async_close_locked(&mut state, true, partition);
            }
            let unseq: Vec<i64> = state.working_unseq.keys().copied().collect();
            for partition in unseq {
                self.async_close_locked(&mut state, false, partition);
            }
        }
        self.closing.wait_until_empty(&self.name);
    }

    /// Range delete: tombstone `device.measurement` up to and including
    /// `upper_bound`, in every affected file and writable buffer.
    pub fn delete(&self, device: &str, measurement: &str, upper_bound: i64) -> Result<()> {
        let state = self.state.write();
        let mut merge = self.merge_state.write();

        if state.tracker.last_update_time(device).is_none() {
            return Ok(());
        }
        let partition = layout::partition_of(upper_bound, self.config.partition_interval_ms);

        if self.config.enable_wal {
            let record = Deletion::new(device, measurement, 0, upper_bound);
            for (p, buffer) in state
                .working_seq
                .iter()
                .chain(state.working_unseq.iter())
            {
                if *p <= partition {
                    self.wal
                        .append_deletion(*p, buffer.is_sequential(), &record)?;
                }
            }
        }

        let version = self.versions.next_version(partition)?;
        let deletion = Deletion::new(device, measurement, version, upper_bound);

        let mut written: Vec<(Arc<FileResource>, u64)> = Vec::new();
        let outcome = self.apply_deletion(&state, &mut merge, &deletion, &mut written);
        if let Err(err) = outcome {
            for (resource, len) in &written {
                if let Err(undo) = resource.truncate_mods(*len) {
                    log::error!(
                        "failed rolling back tombstone in {}: {undo}",
                        resource.path().display()
                    );
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn apply_deletion(
        &self,
        state: &GroupState,
        merge: &mut MergeState,
        deletion: &Deletion,
        written: &mut Vec<(Arc<FileResource>, u64)>,
    ) -> Result<()> {
        if let Some(mods) = merge.merging_mods.as_mut() {
            mods.append(deletion)?;
        }
        let files = state
            .seq_files
            .iter()
            .map(|r| (true, r))
            .chain(state.unseq_files.iter().map(|r| (false, r)));
        for (sequential, resource) in files {
            let Some(start) = resource.start_time(&deletion.device) else {
                continue;
            };
            if start > deletion.upper_bound {
                continue;
            }
            // Each file gets the deletion stamped with a fresh version of
            // its own partition.
            let version = self.versions.next_version(resource.partition())?;
            let stamped = Deletion {
                version,
                ..deletion.clone()
            };
            let previous = resource.append_mod(&stamped)?;
            resource.close_mods();
            written.push((Arc::clone(resource), previous));
            if !resource.is_closed() {
                if let Some(buffer) = self.attached_buffer(state, sequential, resource) {
                    buffer.delete_in_mem(
                        &deletion.device,
                        &deletion.measurement,
                        deletion.upper_bound,
                    );
                }
            }
        }
        Ok(())
    }

    fn attached_buffer(
        &self,
        state: &GroupState,
        sequential: bool,
        resource: &Arc<FileResource>,
    ) -> Option<Arc<WorkBuffer>> {
        let map = if sequential {
            &state.working_seq
        } else {
            &state.working_unseq
        };
        if let Some(buffer) = map.get(&resource.partition()) {
            if Arc::ptr_eq(buffer.resource(), resource) {
                return Some(Arc::clone(buffer));
            }
        }
        self.closing.find(sequential, resource)
    }

    /// Build a consistent snapshot of the resources a single-series query
    /// may read. The lists are detached from later index mutations; the
    /// caller registers them with the file-paths manager so a concurrent
    /// merge cannot remove a file still being read.
    pub fn query(
        &self,
        device: &str,
        measurement: &str,
        filter: Option<&dyn TimeFilter>,
        query_id: u64,
        manager: &dyn QueryFileManager,
    ) -> Result<QueryDataSource> {
        let state = self.state.read();
        let _merge = self.merge_state.read();
        let now = self.clock.now_millis();
        let ttl = self.config.data_ttl_ms;

        let seq = self.capture_sources(&state, &state.seq_files, true, device, measurement, filter, ttl, now);
        let unseq =
            self.capture_sources(&state, &state.unseq_files, false, device, measurement, filter, ttl, now);

        let source = QueryDataSource {
            device: device.to_string(),
            measurement: measurement.to_string(),
            seq,
            unseq,
        };
        manager.add_used_files(query_id, &source);
        Ok(source)
    }

    #[allow(clippy::too_many_arguments)]
    fn capture_sources(
        &self,
        state: &GroupState,
        files: &[Arc<FileResource>],
        sequential: bool,
        device: &str,
        measurement: &str,
        filter: Option<&dyn TimeFilter>,
        ttl: Option<i64>,
        now: i64,
    ) -> Vec<ReadSource> {
        let mut sources = Vec::new();
        for resource in files {
            if resource.is_deleted() {
                continue;
            }
            if !resource.is_satisfied(device, filter, ttl, now) {
                continue;
            }
            let _guard = self.close_query_lock.read();
            if resource.is_closed() {
                sources.push(ReadSource::Sealed(Arc::clone(resource)));
            } else {
                let rows = self
                    .attached_buffer(state, sequential, resource)
                    .map(|buffer| buffer.snapshot(device, measurement))
                    .unwrap_or_default();
                sources.push(ReadSource::Unsealed {
                    resource: Arc::clone(resource),
                    rows,
                });
            }
        }
        sources
    }

    /// Remove one sealed, non-merging data file from the index and disk.
    /// Returns false when the file is absent, unsealed or merging.
    pub fn delete_file(&self, path: &Path) -> Result<bool> {
        let resource = {
            let mut state = self.state.write();
            let _merge = self.merge_state.write();
            let Some((sequential, pos)) = locate(&state, path) else {
                return Ok(false);
            };
            let list = if sequential {
                &mut state.seq_files
            } else {
                &mut state.unseq_files
            };
            let resource = Arc::clone(&list[pos]);
            if !resource.is_closed() || resource.is_merging() {
                return Ok(false);
            }
            resource.set_deleted(true);
            list.remove(pos);
            resource
        };
        let _guard = resource.write_query_lock().write();
        resource.remove_files()?;
        log::info!("storage group {}: deleted file {}", self.name, path.display());
        Ok(true)
    }

    /// Relocate one sealed, non-merging data file (and sidecars) out of the
    /// group into `target_dir`. Returns false when not movable.
    pub fn move_file(&self, path: &Path, target_dir: &Path) -> Result<bool> {
        let resource = {
            let mut state = self.state.write();
            let _merge = self.merge_state.write();
            let Some((sequential, pos)) = locate(&state, path) else {
                return Ok(false);
            };
            let list = if sequential {
                &mut state.seq_files
            } else {
                &mut state.unseq_files
            };
            let resource = Arc::clone(&list[pos]);
            if !resource.is_closed() || resource.is_merging() {
                return Ok(false);
            }
            list.remove(pos);
            resource
        };
        let _guard = resource.write_query_lock().write();
        std::fs::create_dir_all(target_dir)?;
        let source = resource.path();
        let file_name = source
            .file_name()
            .ok_or(Error::Corrupt("data file path has no name"))?;
        std::fs::rename(&source, target_dir.join(file_name))?;
        let meta = layout::resource_path(&source);
        if meta.exists() {
            std::fs::rename(&meta, target_dir.join(meta.file_name().expect("sidecar name")))?;
        }
        let mods = layout::mods_path(&source);
        if mods.exists() {
            std::fs::rename(&mods, target_dir.join(mods.file_name().expect("sidecar name")))?;
        }
        log::info!(
            "storage group {}: moved file {} to {}",
            self.name,
            source.display(),
            target_dir.display()
        );
        Ok(true)
    }

    /// Group teardown: drop every resource and delete the on-disk files.
    pub fn remove_all_files(self: &Arc<Self>) -> Result<()> {
        self.sync_close_all();
        let (seq, unseq) = {
            let mut state = self.state.write();
            let _merge = self.merge_state.write();
            (
                std::mem::take(&mut state.seq_files),
                std::mem::take(&mut state.unseq_files),
            )
        };
        for resource in seq.into_iter().chain(unseq) {
            let _guard = resource.write_query_lock().write();
            resource.set_deleted(true);
            resource.remove_files()?;
        }
        Ok(())
    }
}

fn locate(state: &GroupState, path: &Path) -> Option<(bool, usize)> {
    if let Some(pos) = state.seq_files.iter().position(|r| r.path() == path) {
        return Some((true, pos));
    }
    state
        .unseq_files
        .iter()
        .position(|r| r.path() == path)
        .map(|pos| (false, pos))
}

pub(crate) fn kind_name(sequential: bool) -> &'static str {
    if sequential {
        "sequential"
    } else {
        "unsequential"
    }
}
