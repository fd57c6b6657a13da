//! Startup recovery: rebuild the file index, the writable buffers and the
//! watermark tables from the on-disk tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::WorkBuffer;
use crate::config::StorageGroupConfig;
use crate::dirs::DirectoryRotator;
use crate::group::{register_resource, GroupState};
use crate::layout::{self, FileName, DATA_FILE_EXT, MERGE_SUFFIX, TEMP_SUFFIX};
use crate::resource::FileResource;
use crate::Result;

pub(crate) fn recover_group(
    name: &str,
    config: &StorageGroupConfig,
    dirs: &dyn DirectoryRotator,
) -> Result<GroupState> {
    let mut state = GroupState::default();
    recover_family(name, config, &dirs.sequential_roots(), true, &mut state)?;
    recover_family(name, config, &dirs.unsequential_roots(), false, &mut state)?;
    Ok(state)
}

fn recover_family(
    name: &str,
    config: &StorageGroupConfig,
    roots: &[PathBuf],
    sequential: bool,
    state: &mut GroupState,
) -> Result<()> {
    // Collect data files per partition across every root of the family so
    // the last (newest) file is chosen globally, not per root.
    let mut per_partition: BTreeMap<i64, Vec<(FileName, PathBuf)>> = BTreeMap::new();
    for root in roots {
        let group_dir = root.join(name);
        if !group_dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&group_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(partition) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(layout::parse_partition_dir)
            else {
                log::debug!("skipping non-partition directory {}", path.display());
                continue;
            };
            replay_renames(&path)?;
            for file in std::fs::read_dir(&path)? {
                let file = file?.path();
                if file.extension().and_then(|e| e.to_str()) != Some(DATA_FILE_EXT) {
                    continue;
                }
                match FileName::parse_path(&file) {
                    Ok(parsed) => per_partition
                        .entry(partition)
                        .or_default()
                        .push((parsed, file)),
                    Err(err) => {
                        log::warn!("skipping unparsable data file {}: {err}", file.display());
                    }
                }
            }
        }
    }

    for (partition, mut files) in per_partition {
        files.sort_by_key(|(parsed, _)| *parsed);
        let last = files.len() - 1;
        for (index, (parsed, path)) in files.into_iter().enumerate() {
            let resource = match FileResource::load(&path) {
                Ok(resource) => resource,
                Err(err) => {
                    log::warn!(
                        "sidecar unreadable for {} ({err}), rebuilding from data",
                        path.display()
                    );
                    match FileResource::rebuild(&path) {
                        Ok(resource) => resource,
                        Err(err) => {
                            log::error!("cannot recover {}, skipping: {err}", path.display());
                            continue;
                        }
                    }
                }
            };
            let resource = Arc::new(resource);

            if index == last && !resource.is_closed() {
                // The newest file is still writable: bind a buffer to it
                // and put it back into the working set.
                let buffer = Arc::new(WorkBuffer::new(
                    partition,
                    sequential,
                    Arc::clone(&resource),
                    parsed.version,
                    config.flush_threshold_rows,
                ));
                buffer.restore(&resource.read_records()?);
                let map = if sequential {
                    &mut state.working_seq
                } else {
                    &mut state.working_unseq
                };
                map.insert(partition, buffer);
                log::info!("reopened writable file {}", path.display());
            } else if !resource.is_closed() {
                resource.set_closed(true);
                resource.save_meta()?;
                log::info!("sealed straggler {}", path.display());
            }

            if parsed.merge_cnt == 0 {
                state
                    .catalog
                    .record(partition, resource.historical_versions());
            } else {
                for version in resource.historical_versions() {
                    state.catalog.record_max(partition, version);
                }
            }
            for device in resource.devices() {
                if let Some(end) = resource.end_time(&device) {
                    if sequential && resource.is_closed() {
                        state.tracker.seed_flushed(partition, &device, end);
                    } else {
                        state.tracker.seed_latest(partition, &device, end);
                    }
                }
            }
            register_resource(state, sequential, resource);
        }
    }
    Ok(())
}

/// Replay the rename protocol: a `<name>.tmp` or `<name>.merge` left behind
/// by a crash becomes `<name>` when the target is absent, and is dropped
/// when the target already exists.
fn replay_renames(partition_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(partition_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let target = name
            .strip_suffix(&format!(".{TEMP_SUFFIX}"))
            .or_else(|| name.strip_suffix(&format!(".{MERGE_SUFFIX}")));
        let Some(target) = target else {
            continue;
        };
        let target_path = partition_dir.join(target);
        if target_path.exists() {
            log::info!("dropping leftover temporary {}", path.display());
            std::fs::remove_file(&path)?;
        } else {
            log::info!("completing interrupted rename of {}", path.display());
            std::fs::rename(&path, &target_path)?;
        }
    }
    Ok(())
}
