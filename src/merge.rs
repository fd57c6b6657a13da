//! Background merge of unsequential files into sequential ones.
//!
//! A merge window opens under the writer lock, is marked by the shared
//! `merge.mods` file in the system directory, and closes in the end action
//! that swaps rewritten files in and replays the window's tombstones into
//! fresh sidecars. Deletions arriving mid-window are mirrored into
//! `merge.mods` so the swap cannot lose them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MergeStrategy;
use crate::group::StorageGroup;
use crate::layout::{self, MERGE_LOG_NAME, MERGING_MODS_NAME};
use crate::memtable::Value;
use crate::mods::ModificationFile;
use crate::resource::{DataRecord, FileResource};
use crate::{Error, Result};

/// Merge-side state guarded by the coordinator's merge lock.
#[derive(Default)]
pub(crate) struct MergeState {
    pub(crate) merging: bool,
    pub(crate) merging_mods: Option<ModificationFile>,
}

/// Snapshot of the file index handed to a selector, with the ttl lower
/// bound of the window.
pub struct MergeResource {
    pub seq: Vec<Arc<FileResource>>,
    pub unseq: Vec<Arc<FileResource>>,
    pub time_lower_bound: i64,
}

#[derive(Clone)]
pub struct MergeSelection {
    pub seq: Vec<Arc<FileResource>>,
    pub unseq: Vec<Arc<FileResource>>,
}

impl MergeSelection {
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty() || self.unseq.is_empty()
    }
}

/// Picks candidate file sets within a memory budget.
pub trait MergeFileSelector: Send + Sync {
    fn select(&self, resource: &MergeResource, memory_budget: u64) -> Result<MergeSelection>;
}

pub fn selector_for(strategy: MergeStrategy) -> Box<dyn MergeFileSelector> {
    match strategy {
        MergeStrategy::MaxFileNum => Box::new(MaxFileNumSelector),
        MergeStrategy::MaxSeriesNum => Box::new(MaxSeriesNumSelector),
    }
}

fn file_size(resource: &FileResource) -> i64 {
    std::fs::metadata(resource.path())
        .map(|m| m.len() as i64)
        .unwrap_or(0)
}

fn mergeable(resource: &FileResource, lower_bound: i64) -> bool {
    resource.is_closed()
        && !resource.is_merging()
        && !resource.is_deleted()
        && resource.still_lives(lower_bound)
}

fn paired_sequential(
    resource: &MergeResource,
    partitions: &BTreeSet<i64>,
) -> Vec<Arc<FileResource>> {
    resource
        .seq
        .iter()
        .filter(|s| {
            partitions.contains(&s.partition()) && mergeable(s, resource.time_lower_bound)
        })
        .cloned()
        .collect()
}

/// Greedy oldest-first selection bounded by total file size.
pub struct MaxFileNumSelector;

impl MergeFileSelector for MaxFileNumSelector {
    fn select(&self, resource: &MergeResource, memory_budget: u64) -> Result<MergeSelection> {
        let mut budget = memory_budget as i64;
        let mut unseq = Vec::new();
        let mut partitions = BTreeSet::new();
        for candidate in &resource.unseq {
            if !mergeable(candidate, resource.time_lower_bound) {
                continue;
            }
            let size = file_size(candidate);
            if size > budget && !unseq.is_empty() {
                break;
            }
            budget -= size;
            partitions.insert(candidate.partition());
            unseq.push(Arc::clone(candidate));
        }
        Ok(MergeSelection {
            seq: paired_sequential(resource, &partitions),
            unseq,
        })
    }
}

/// Oldest-first selection additionally bounded by distinct device count,
/// approximating the per-series working memory of the rewrite.
pub struct MaxSeriesNumSelector;

impl MergeFileSelector for MaxSeriesNumSelector {
    fn select(&self, resource: &MergeResource, memory_budget: u64) -> Result<MergeSelection> {
        let device_cap = ((memory_budget >> 20).max(1)) as usize;
        let mut devices: BTreeSet<String> = BTreeSet::new();
        let mut unseq = Vec::new();
        let mut partitions = BTreeSet::new();
        for candidate in &resource.unseq {
            if !mergeable(candidate, resource.time_lower_bound) {
                continue;
            }
            let mut next: BTreeSet<String> = devices.clone();
            next.extend(candidate.devices());
            if next.len() > device_cap && !unseq.is_empty() {
                break;
            }
            devices = next;
            partitions.insert(candidate.partition());
            unseq.push(Arc::clone(candidate));
        }
        Ok(MergeSelection {
            seq: paired_sequential(resource, &partitions),
            unseq,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MergeLog {
    seq: Vec<PathBuf>,
    unseq: Vec<PathBuf>,
}

/// Post-rewrite state of one sequential output file.
pub(crate) struct MergedOutput {
    start: HashMap<String, i64>,
    end: HashMap<String, i64>,
    versions: BTreeSet<u64>,
}

impl StorageGroup {
    /// Kick off a merge. Refuses while one is in progress and quietly
    /// returns when there is nothing to merge.
    pub fn merge(self: &Arc<Self>) -> Result<()> {
        let Some(selection) = self.start_merge()? else {
            return Ok(());
        };
        let group = Arc::downgrade(self);
        self.executor.submit(move || {
            if let Some(group) = group.upgrade() {
                group.run_merge(selection);
            }
        });
        Ok(())
    }

    /// Synchronous kick-off half: select candidates, mark them merging and
    /// open the merge window, all under the writer and merge locks.
    pub(crate) fn start_merge(&self) -> Result<Option<MergeSelection>> {
        let state = self.state.write();
        let mut merge = self.merge_state.write();
        if merge.merging {
            log::info!("storage group {}: merge already in progress", self.name);
            return Ok(None);
        }
        if state.seq_files.is_empty() || state.unseq_files.is_empty() {
            return Ok(None);
        }
        let lower_bound = self
            .config
            .data_ttl_ms
            .map(|ttl| self.clock.now_millis() - ttl)
            .unwrap_or(i64::MIN);
        let resource = MergeResource {
            seq: state.seq_files.clone(),
            unseq: state.unseq_files.clone(),
            time_lower_bound: lower_bound,
        };
        let selector = selector_for(self.config.merge_strategy);
        let selection = selector.select(&resource, self.config.merge_memory_budget)?;
        if selection.is_empty() {
            log::info!("storage group {}: merge selected no files", self.name);
            return Ok(None);
        }

        for file in selection.seq.iter().chain(selection.unseq.iter()) {
            file.set_merging(true);
        }
        let mods_path = self.sys_dir.join(MERGING_MODS_NAME);
        std::fs::File::create(&mods_path)?;
        merge.merging = true;
        merge.merging_mods = Some(ModificationFile::new(&mods_path));
        self.write_merge_log(&selection)?;
        log::info!(
            "storage group {}: merging {} sequential and {} unsequential files",
            self.name,
            selection.seq.len(),
            selection.unseq.len()
        );
        Ok(Some(selection))
    }

    fn write_merge_log(&self, selection: &MergeSelection) -> Result<()> {
        let log = MergeLog {
            seq: selection.seq.iter().map(|r| r.path()).collect(),
            unseq: selection.unseq.iter().map(|r| r.path()).collect(),
        };
        let path = self.sys_dir.join(MERGE_LOG_NAME);
        let tmp = layout::temp_path(&path);
        std::fs::write(&tmp, serde_json::to_vec(&log)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub(crate) fn run_merge(self: Arc<Self>, selection: MergeSelection) {
        match self.rewrite_merged_files(&selection) {
            Ok(outputs) => self.merge_end(&selection, outputs, false),
            Err(err) => {
                log::error!("storage group {}: merge failed: {err}", self.name);
                self.merge_end(&selection, Vec::new(), true);
            }
        }
    }

    /// Fold the live unsequential rows into `.merge` rewrites of the
    /// selected sequential files. Nothing is published here; the end
    /// action swaps the rewrites in under the proper locks.
    fn rewrite_merged_files(&self, selection: &MergeSelection) -> Result<Vec<MergedOutput>> {
        let mut pool: HashMap<i64, Vec<DataRecord>> = HashMap::new();
        let mut pool_versions: HashMap<i64, BTreeSet<u64>> = HashMap::new();
        for unseq in &selection.unseq {
            let tombstones = unseq.mods_records()?;
            let rows = unseq.read_records()?.into_iter().filter(|r| {
                !tombstones
                    .iter()
                    .any(|d| d.matches(&r.device, &r.measurement) && r.t <= d.upper_bound)
            });
            pool.entry(unseq.partition()).or_default().extend(rows);
            pool_versions
                .entry(unseq.partition())
                .or_default()
                .extend(unseq.historical_versions());
        }

        let mut per_partition: HashMap<i64, Vec<usize>> = HashMap::new();
        for (index, seq) in selection.seq.iter().enumerate() {
            per_partition.entry(seq.partition()).or_default().push(index);
        }

        let mut assigned: Vec<Vec<DataRecord>> = vec![Vec::new(); selection.seq.len()];
        for (partition, rows) in pool {
            let Some(indices) = per_partition.get(&partition) else {
                return Err(Error::Merge(format!(
                    "no sequential target selected for partition {partition}"
                )));
            };
            for row in rows {
                let mut target = *indices.last().expect("non-empty partition index");
                for &index in indices {
                    let file = &selection.seq[index];
                    if file
                        .end_time(&row.device)
                        .map_or(false, |end| row.t <= end)
                    {
                        target = index;
                        break;
                    }
                }
                assigned[target].push(row);
            }
        }

        let mut outputs = Vec::with_capacity(selection.seq.len());
        for (index, seq) in selection.seq.iter().enumerate() {
            let added = std::mem::take(&mut assigned[index]);
            let mut versions = seq.historical_versions();
            if !added.is_empty() {
                if let Some(extra) = pool_versions.get(&seq.partition()) {
                    versions.extend(extra.iter().copied());
                }
            }

            if added.is_empty() && !self.config.force_full_merge {
                let mut start = HashMap::new();
                let mut end = HashMap::new();
                for device in seq.devices() {
                    if let Some(t) = seq.start_time(&device) {
                        start.insert(device.clone(), t);
                    }
                    if let Some(t) = seq.end_time(&device) {
                        end.insert(device, t);
                    }
                }
                outputs.push(MergedOutput {
                    start,
                    end,
                    versions,
                });
                continue;
            }

            let tombstones = seq.mods_records()?;
            let mut merged: BTreeMap<(String, String, i64), Value> = BTreeMap::new();
            for record in seq.read_records()? {
                if tombstones
                    .iter()
                    .any(|d| d.matches(&record.device, &record.measurement)
                        && record.t <= d.upper_bound)
                {
                    continue;
                }
                merged.insert((record.device, record.measurement, record.t), record.v);
            }
            for record in added {
                merged.insert((record.device, record.measurement, record.t), record.v);
            }

            let target = layout::merge_path(&seq.path());
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&target)?;
            let mut writer = BufWriter::new(file);
            let mut start: HashMap<String, i64> = HashMap::new();
            let mut end: HashMap<String, i64> = HashMap::new();
            for ((device, measurement, t), v) in &merged {
                let record = DataRecord {
                    device: device.clone(),
                    measurement: measurement.clone(),
                    t: *t,
                    v: v.clone(),
                };
                serde_json::to_writer(&mut writer, &record)?;
                writer.write_all(b"\n")?;
                let first = start.entry(device.clone()).or_insert(*t);
                if *t < *first {
                    *first = *t;
                }
                let last = end.entry(device.clone()).or_insert(*t);
                if *t > *last {
                    *last = *t;
                }
            }
            let file = writer.into_inner().map_err(|err| err.into_error())?;
            file.sync_all()?;

            outputs.push(MergedOutput {
                start,
                end,
                versions,
            });
        }
        Ok(outputs)
    }

    /// End action, invoked on task completion, normal or aborted.
    pub(crate) fn merge_end(
        self: &Arc<Self>,
        selection: &MergeSelection,
        outputs: Vec<MergedOutput>,
        aborted: bool,
    ) {
        if aborted || selection.unseq.is_empty() {
            self.abort_merge(selection);
            return;
        }

        {
            let mut state = self.state.write();
            state
                .unseq_files
                .retain(|r| !selection.unseq.iter().any(|u| Arc::ptr_eq(r, u)));
        }
        for unseq in &selection.unseq {
            let _guard = unseq.write_query_lock().write();
            unseq.set_deleted(true);
            if let Err(err) = unseq.remove_files() {
                log::error!(
                    "storage group {}: failed removing merged unsequential file {}: {err}",
                    self.name,
                    unseq.path().display()
                );
            }
            unseq.set_merging(false);
        }

        let last = selection.seq.len() - 1;
        for (index, seq) in selection.seq.iter().enumerate() {
            loop {
                // Take the per-file lock, then the merge lock; back out and
                // retry when only one is available so the delete path
                // cannot deadlock against us.
                let Some(file_guard) = seq.write_query_lock().try_write() else {
                    std::thread::yield_now();
                    continue;
                };
                let Some(mut merge_guard) = self.merge_state.try_write() else {
                    drop(file_guard);
                    std::thread::yield_now();
                    continue;
                };
                if let Err(err) =
                    self.publish_merged_file(seq, &outputs[index], &mut merge_guard, index == last)
                {
                    log::error!(
                        "storage group {}: merge end action failed for {}: {err}",
                        self.name,
                        seq.path().display()
                    );
                }
                seq.set_merging(false);
                drop(merge_guard);
                drop(file_guard);
                break;
            }
        }
        log::info!("storage group {}: merge complete", self.name);
    }

    fn publish_merged_file(
        &self,
        resource: &Arc<FileResource>,
        output: &MergedOutput,
        merge: &mut MergeState,
        is_last: bool,
    ) -> Result<()> {
        let path = resource.path();
        let rewritten = layout::merge_path(&path);
        if rewritten.exists() {
            std::fs::rename(&rewritten, &path)?;
        }
        resource.remove_mods()?;
        let window = match merge.merging_mods.as_ref() {
            Some(mods) => mods.read_all()?,
            None => Vec::new(),
        };
        for deletion in &window {
            resource.append_mod(deletion)?;
        }
        resource.close_mods();

        resource.replace_times(output.start.clone(), output.end.clone());
        resource.add_historical_versions(output.versions.iter().copied());
        resource.save_meta()?;

        if is_last {
            if let Some(mut mods) = merge.merging_mods.take() {
                mods.remove()?;
            }
            merge.merging = false;
            let log_path = self.sys_dir.join(MERGE_LOG_NAME);
            if log_path.exists() {
                std::fs::remove_file(&log_path)?;
            }
        }
        Ok(())
    }

    fn abort_merge(self: &Arc<Self>, selection: &MergeSelection) {
        for file in selection.seq.iter().chain(selection.unseq.iter()) {
            file.set_merging(false);
            let leftover = layout::merge_path(&file.path());
            if leftover.exists() {
                let _ = std::fs::remove_file(&leftover);
            }
        }
        let mut merge = self.merge_state.write();
        if let Some(mut mods) = merge.merging_mods.take() {
            let _ = mods.remove();
        }
        merge.merging = false;
        drop(merge);
        let log_path = self.sys_dir.join(MERGE_LOG_NAME);
        if log_path.exists() {
            let _ = std::fs::remove_file(&log_path);
        }
        log::warn!("storage group {}: merge aborted", self.name);
    }

    /// Startup continuation of an interrupted merge. The `merge.mods`
    /// marker decides: resume it when configured to, discard it otherwise.
    /// A merge log without the marker is an orphan and is removed.
    pub(crate) fn recover_merge_state(self: &Arc<Self>) -> Result<()> {
        let mods_path = self.sys_dir.join(MERGING_MODS_NAME);
        let log_path = self.sys_dir.join(MERGE_LOG_NAME);
        if mods_path.exists() {
            if self.config.continue_merge_after_reboot {
                {
                    let mut merge = self.merge_state.write();
                    merge.merging = true;
                    merge.merging_mods = Some(ModificationFile::new(&mods_path));
                }
                let group = Arc::downgrade(self);
                self.executor.submit(move || {
                    if let Some(group) = group.upgrade() {
                        group.resume_merge();
                    }
                });
            } else {
                log::info!(
                    "storage group {}: discarding interrupted merge state",
                    self.name
                );
                std::fs::remove_file(&mods_path)?;
                if log_path.exists() {
                    std::fs::remove_file(&log_path)?;
                }
            }
        } else if log_path.exists() {
            log::warn!(
                "storage group {}: removing orphan merge log {}",
                self.name,
                log_path.display()
            );
            std::fs::remove_file(&log_path)?;
        }
        Ok(())
    }

    fn resume_merge(self: Arc<Self>) {
        let log_path = self.sys_dir.join(MERGE_LOG_NAME);
        let selection = std::fs::read(&log_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<MergeLog>(&bytes).ok())
            .and_then(|log| {
                let state = self.state.read();
                let find = |paths: &[PathBuf], list: &[Arc<FileResource>]| {
                    paths
                        .iter()
                        .map(|p| list.iter().find(|r| r.path() == *p).cloned())
                        .collect::<Option<Vec<_>>>()
                };
                let seq = find(&log.seq, &state.seq_files)?;
                let unseq = find(&log.unseq, &state.unseq_files)?;
                Some(MergeSelection { seq, unseq })
            });
        match selection {
            Some(selection) if !selection.is_empty() => {
                for file in selection.seq.iter().chain(selection.unseq.iter()) {
                    file.set_merging(true);
                }
                log::info!("storage group {}: resuming interrupted merge", self.name);
                self.run_merge(selection);
            }
            _ => {
                log::warn!(
                    "storage group {}: interrupted merge not resumable, discarding",
                    self.name
                );
                self.abort_merge(&MergeSelection {
                    seq: Vec::new(),
                    unseq: Vec::new(),
                });
            }
        }
    }
}
