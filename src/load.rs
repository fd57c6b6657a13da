//! Loading externally produced data files into the group.
//!
//! A staged file (data plus optional sidecar, under a partition-named
//! directory) is placed into the sequential index at the position its
//! device ranges dictate, renamed if its name would break index ordering,
//! or diverted to the unsequential side when it overlaps present data.

use std::path::Path;
use std::sync::Arc;

use crate::group::{GroupState, StorageGroup};
use crate::layout::{self, FileName};
use crate::resource::FileResource;
use crate::version::VersionController;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertPosition {
    AlreadyExist,
    Overlap,
    /// Insert after this index; -1 inserts at the front.
    After(i64),
}

/// Interval comparison over the devices both files share: 1 when `a` is
/// entirely newer, -1 when entirely older, 0 on any overlap or a mixed
/// verdict. Files with no shared devices compare as newer.
fn compare_device_ranges(a: &FileResource, b: &FileResource) -> i32 {
    let mut has_pre = false;
    let mut has_subsequent = false;
    for device in a.devices() {
        let (Some(start_a), Some(end_a)) = (a.start_time(&device), a.end_time(&device)) else {
            continue;
        };
        let Some(start_b) = b.start_time(&device) else {
            continue;
        };
        let end_b = b.end_time(&device).unwrap_or(i64::MAX);
        if start_a > end_b {
            has_pre = true;
        } else if start_b > end_a {
            has_subsequent = true;
        } else {
            return 0;
        }
    }
    if has_pre && has_subsequent {
        return 0;
    }
    if has_subsequent {
        -1
    } else {
        1
    }
}

fn find_insertion_position(
    new: &FileResource,
    seq: &[Arc<FileResource>],
) -> Result<InsertPosition> {
    let new_name = new.file_name()?;
    for (index, local) in seq.iter().enumerate() {
        if local.partition() == new.partition() && local.file_name()? == new_name {
            return Ok(InsertPosition::AlreadyExist);
        }
        if new.partition() > local.partition() {
            continue;
        }
        if index == seq.len() - 1 && local.devices().is_empty() {
            continue;
        }
        match compare_device_ranges(new, local) {
            0 => return Ok(InsertPosition::Overlap),
            -1 => return Ok(InsertPosition::After(index as i64 - 1)),
            _ => continue,
        }
    }
    Ok(InsertPosition::After(seq.len() as i64 - 1))
}

/// Name for a file entering the sequential index after `insert_pos`.
/// The existing name is kept when it already sorts between its neighbours
/// by creation time; otherwise a name is generated that does.
fn target_file_name(
    seq: &[Arc<FileResource>],
    insert_pos: i64,
    current: FileName,
    now: i64,
    partition: i64,
    versions: &dyn VersionController,
) -> Result<FileName> {
    let pre_time = if insert_pos < 0 {
        0
    } else {
        seq[insert_pos as usize].file_name()?.time
    };
    let inserted_last = (insert_pos + 1) as usize == seq.len();
    if inserted_last {
        if pre_time < current.time {
            Ok(current)
        } else {
            Ok(FileName::new(now, versions.next_version(partition)?, 0))
        }
    } else {
        let subsequent = seq[(insert_pos + 1) as usize].file_name()?;
        if pre_time < current.time && current.time < subsequent.time {
            Ok(current)
        } else {
            Ok(FileName::new(
                pre_time + (subsequent.time - pre_time) / 2,
                subsequent.version,
                0,
            ))
        }
    }
}

fn load_staged(staged: &Path) -> Result<Arc<FileResource>> {
    let resource = match FileResource::load(staged) {
        Ok(resource) => resource,
        Err(_) => FileResource::rebuild(staged)
            .map_err(|err| Error::LoadFile(format!("{}: {err}", staged.display())))?,
    };
    resource.set_closed(true);
    Ok(Arc::new(resource))
}

/// Move the staged data file and sidecar to their target path. Either
/// rename failing raises a load failure; the caller cleans the rest up.
fn move_staged(resource: &Arc<FileResource>, target: &Path) -> Result<()> {
    let source = resource.path();
    std::fs::rename(&source, target)
        .map_err(|err| Error::LoadFile(format!("{} -> {}: {err}", source.display(), target.display())))?;
    let source_meta = layout::resource_path(&source);
    resource.set_path(target.to_path_buf());
    if source_meta.exists() {
        std::fs::rename(&source_meta, layout::resource_path(target))
            .map_err(|err| Error::LoadFile(format!("{}: {err}", source_meta.display())))?;
    } else {
        resource
            .save_meta()
            .map_err(|err| Error::LoadFile(err.to_string()))?;
    }
    Ok(())
}

impl StorageGroup {
    /// Load an external file, deciding sequential versus unsequential
    /// placement from its device ranges.
    pub fn load_file(&self, staged: &Path) -> Result<()> {
        self.load_inner(staged, false)
    }

    /// Load an external file that is promised to follow the group's
    /// flushed watermarks; an overlap is an error instead of a diversion.
    pub fn load_file_for_sync(&self, staged: &Path) -> Result<()> {
        self.load_inner(staged, true)
    }

    fn load_inner(&self, staged: &Path, sync: bool) -> Result<()> {
        let resource = load_staged(staged)?;
        let partition = resource.partition();

        let mut state = self.state.write();
        let _merge = self.merge_state.write();

        if self.config.reduce_duplicate_loads
            && state
                .catalog
                .covers(partition, &resource.historical_versions())
        {
            log::info!(
                "storage group {}: discarding {}, versions already covered",
                self.name,
                staged.display()
            );
            drop(_merge);
            drop(state);
            return resource.remove_files();
        }

        match find_insertion_position(&resource, &state.seq_files)? {
            InsertPosition::AlreadyExist => {
                log::info!(
                    "storage group {}: {} already present",
                    self.name,
                    staged.display()
                );
                Ok(())
            }
            InsertPosition::Overlap if sync => Err(Error::LoadFile(format!(
                "{}: overlaps present sequential data",
                staged.display()
            ))),
            InsertPosition::Overlap => self.place_unsequential(&mut state, resource),
            InsertPosition::After(pos) => self.place_sequential(&mut state, resource, pos),
        }
    }

    fn place_unsequential(
        &self,
        state: &mut GroupState,
        resource: Arc<FileResource>,
    ) -> Result<()> {
        let partition = resource.partition();
        let root = self.dirs.next_unsequential_root()?;
        let dir = layout::partition_dir(&root, &self.name, partition);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(resource.file_name()?.to_string());
        move_staged(&resource, &target)?;
        log::info!(
            "storage group {}: loaded {} as unsequential",
            self.name,
            target.display()
        );
        state.unseq_files.push(Arc::clone(&resource));
        absorb_loaded(state, &resource, false);
        Ok(())
    }

    fn place_sequential(
        &self,
        state: &mut GroupState,
        resource: Arc<FileResource>,
        insert_pos: i64,
    ) -> Result<()> {
        let partition = resource.partition();
        let name = target_file_name(
            &state.seq_files,
            insert_pos,
            resource.file_name()?,
            self.clock.now_millis(),
            partition,
            self.versions.as_ref(),
        )?;
        let root = self.dirs.next_sequential_root()?;
        let dir = layout::partition_dir(&root, &self.name, partition);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(name.to_string());
        move_staged(&resource, &target)?;
        log::info!(
            "storage group {}: loaded {} into the sequential index",
            self.name,
            target.display()
        );
        state
            .seq_files
            .insert((insert_pos + 1) as usize, Arc::clone(&resource));
        absorb_loaded(state, &resource, true);
        Ok(())
    }
}

fn absorb_loaded(state: &mut GroupState, resource: &Arc<FileResource>, sequential: bool) {
    let partition = resource.partition();
    state.tracker.ensure_partition(partition);
    for device in resource.devices() {
        if let Some(end) = resource.end_time(&device) {
            if sequential {
                state.tracker.seed_flushed(partition, &device, end);
            } else {
                state.tracker.seed_latest(partition, &device, end);
            }
        }
    }
    state.catalog.record(partition, resource.historical_versions());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::FileVersionController;
    use tempfile::TempDir;

    fn resource_with_range(
        dir: &TempDir,
        name: &str,
        device: &str,
        start: i64,
        end: i64,
    ) -> Arc<FileResource> {
        let partition_dir = dir.path().join("0");
        std::fs::create_dir_all(&partition_dir).unwrap();
        let path = partition_dir.join(name);
        std::fs::write(&path, b"").unwrap();
        let name = FileName::parse(name).unwrap();
        let resource = Arc::new(FileResource::new(&path, 0, [name.version]));
        resource.update_start_time(device, start);
        resource.update_end_time(device, end);
        resource.set_closed(true);
        resource
    }

    #[test]
    fn range_comparison_verdicts() {
        let dir = TempDir::new().unwrap();
        let local = resource_with_range(&dir, "100-1-0.seg", "d1", 10, 30);

        let newer = resource_with_range(&dir, "200-2-0.seg", "d1", 31, 40);
        assert_eq!(compare_device_ranges(&newer, &local), 1);

        let older = resource_with_range(&dir, "300-3-0.seg", "d1", 1, 9);
        assert_eq!(compare_device_ranges(&older, &local), -1);

        let overlap = resource_with_range(&dir, "400-4-0.seg", "d1", 20, 40);
        assert_eq!(compare_device_ranges(&overlap, &local), 0);

        let disjoint = resource_with_range(&dir, "500-5-0.seg", "d2", 0, 5);
        assert_eq!(compare_device_ranges(&disjoint, &local), 1);
    }

    #[test]
    fn mixed_verdict_counts_as_overlap() {
        let dir = TempDir::new().unwrap();
        let local = resource_with_range(&dir, "100-1-0.seg", "d1", 10, 30);
        local.update_start_time("d2", 100);
        local.update_end_time("d2", 130);

        // Newer than d1's range, older than d2's.
        let mixed = resource_with_range(&dir, "200-2-0.seg", "d1", 40, 50);
        mixed.update_start_time("d2", 60);
        mixed.update_end_time("d2", 70);
        assert_eq!(compare_device_ranges(&mixed, &local), 0);
    }

    #[test]
    fn position_between_neighbours() {
        let dir = TempDir::new().unwrap();
        let a = resource_with_range(&dir, "100-1-0.seg", "d1", 0, 10);
        let c = resource_with_range(&dir, "300-2-0.seg", "d1", 40, 50);
        let seq = vec![a, c];

        let b = resource_with_range(&dir, "250-5-0.seg", "d1", 20, 30);
        assert_eq!(
            find_insertion_position(&b, &seq).unwrap(),
            InsertPosition::After(0)
        );

        let overlap = resource_with_range(&dir, "260-6-0.seg", "d1", 5, 25);
        assert_eq!(
            find_insertion_position(&overlap, &seq).unwrap(),
            InsertPosition::Overlap
        );

        let duplicate = resource_with_range(&dir, "100-1-0.seg", "d1", 0, 10);
        assert_eq!(
            find_insertion_position(&duplicate, &seq).unwrap(),
            InsertPosition::AlreadyExist
        );

        let newest = resource_with_range(&dir, "400-7-0.seg", "d1", 60, 70);
        assert_eq!(
            find_insertion_position(&newest, &seq).unwrap(),
            InsertPosition::After(1)
        );
    }

    #[test]
    fn name_kept_when_it_sorts_between_neighbours() {
        let dir = TempDir::new().unwrap();
        let sys = TempDir::new().unwrap();
        let versions = FileVersionController::new(sys.path()).unwrap();
        let a = resource_with_range(&dir, "100-1-0.seg", "d1", 0, 10);
        let c = resource_with_range(&dir, "300-2-0.seg", "d1", 40, 50);
        let seq = vec![a, c];

        let kept = target_file_name(
            &seq,
            0,
            FileName::new(250, 5, 0),
            1000,
            0,
            &versions,
        )
        .unwrap();
        assert_eq!(kept.to_string(), "250-5-0.seg");
    }

    #[test]
    fn name_regenerated_from_neighbour_midpoint() {
        let dir = TempDir::new().unwrap();
        let sys = TempDir::new().unwrap();
        let versions = FileVersionController::new(sys.path()).unwrap();
        let a = resource_with_range(&dir, "100-1-0.seg", "d1", 0, 10);
        let c = resource_with_range(&dir, "300-2-0.seg", "d1", 40, 50);
        let seq = vec![a, c];

        let renamed = target_file_name(
            &seq,
            0,
            FileName::new(400, 5, 0),
            1000,
            0,
            &versions,
        )
        .unwrap();
        assert_eq!(renamed.to_string(), "200-2-0.seg");
    }

    #[test]
    fn name_generated_fresh_at_list_end() {
        let dir = TempDir::new().unwrap();
        let sys = TempDir::new().unwrap();
        let versions = FileVersionController::new(sys.path()).unwrap();
        let a = resource_with_range(&dir, "500-1-0.seg", "d1", 0, 10);
        let seq = vec![a];

        // Creation time older than the predecessor forces a fresh name.
        let fresh = target_file_name(
            &seq,
            0,
            FileName::new(400, 9, 0),
            9000,
            0,
            &versions,
        )
        .unwrap();
        assert_eq!(fresh.time, 9000);
        assert_eq!(fresh.merge_cnt, 0);

        let kept = target_file_name(
            &seq,
            0,
            FileName::new(600, 9, 0),
            9000,
            0,
            &versions,
        )
        .unwrap();
        assert_eq!(kept, FileName::new(600, 9, 0));
    }
}
