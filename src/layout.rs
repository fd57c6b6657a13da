//! On-disk layout of a storage group.
//!
//! Data roots carry two family directories, one per file kind. Each family
//! holds one directory per storage group, which holds one directory per time
//! partition, which holds the data files and their sidecars:
//!
//! `<root>/<family>/<group>/<partition>/<millis>-<version>-<mergeCount>.seg`

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const DATA_FILE_EXT: &str = "seg";
pub const RESOURCE_SUFFIX: &str = "resource";
pub const MODS_SUFFIX: &str = "mods";
pub const TEMP_SUFFIX: &str = "tmp";
pub const MERGE_SUFFIX: &str = "merge";

pub const SEQUENCE_DIR: &str = "sequence";
pub const UNSEQUENCE_DIR: &str = "unsequence";

/// Name of the shared modification file active during a merge window,
/// kept in the storage-group system directory.
pub const MERGING_MODS_NAME: &str = "merge.mods";
/// Name of the merge progress log in the system directory.
pub const MERGE_LOG_NAME: &str = "merge.log";

/// Parsed data-file name: `<millis>-<version>-<mergeCount>.seg`.
///
/// Ordering within a partition compares `version` then `merge_cnt`; the
/// creation timestamp is context only and never drives index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileName {
    pub time: i64,
    pub version: u64,
    pub merge_cnt: u32,
}

impl FileName {
    pub fn new(time: i64, version: u64, merge_cnt: u32) -> Self {
        Self {
            time,
            version,
            merge_cnt,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let stem = name
            .strip_suffix(&format!(".{DATA_FILE_EXT}"))
            .ok_or(Error::Corrupt("data file name missing extension"))?;
        let mut parts = stem.split('-');
        let time = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or(Error::Corrupt("invalid creation millis in file name"))?;
        let version = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or(Error::Corrupt("invalid version in file name"))?;
        let merge_cnt = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or(Error::Corrupt("invalid merge count in file name"))?;
        if parts.next().is_some() {
            return Err(Error::Corrupt("trailing component in file name"));
        }
        Ok(Self {
            time,
            version,
            merge_cnt,
        })
    }

    pub fn parse_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::Corrupt("data file path has no name"))?;
        Self::parse(name)
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{DATA_FILE_EXT}",
            self.time, self.version, self.merge_cnt
        )
    }
}

impl PartialOrd for FileName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.merge_cnt.cmp(&other.merge_cnt))
    }
}

/// Parse a partition directory name. Non-numeric names are not partitions
/// and are skipped by the caller rather than treated as corruption.
pub fn parse_partition_dir(name: &str) -> Option<i64> {
    if name.is_empty() {
        return None;
    }
    name.parse::<i64>().ok()
}

/// Partition id owning a timestamp, for a fixed interval width.
pub fn partition_of(timestamp: i64, interval_ms: i64) -> i64 {
    timestamp.div_euclid(interval_ms)
}

pub fn resource_path(data_path: &Path) -> PathBuf {
    sidecar_path(data_path, RESOURCE_SUFFIX)
}

pub fn mods_path(data_path: &Path) -> PathBuf {
    sidecar_path(data_path, MODS_SUFFIX)
}

/// `<path>.tmp`, keeping every existing extension.
pub fn temp_path(path: &Path) -> PathBuf {
    sidecar_path(path, TEMP_SUFFIX)
}

/// `<path>.merge`, keeping every existing extension.
pub fn merge_path(path: &Path) -> PathBuf {
    sidecar_path(path, MERGE_SUFFIX)
}

fn sidecar_path(data_path: &Path, suffix: &str) -> PathBuf {
    let mut name = data_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    data_path.with_file_name(name)
}

/// Directory for one partition of one storage group under a family root.
pub fn partition_dir(family_root: &Path, group: &str, partition: i64) -> PathBuf {
    family_root.join(group).join(partition.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let name = FileName::new(1706486400000, 7, 1);
        assert_eq!(name.to_string(), "1706486400000-7-1.seg");
        assert_eq!(FileName::parse("1706486400000-7-1.seg").unwrap(), name);
    }

    #[test]
    fn reject_malformed_names() {
        assert!(FileName::parse("100-2.seg").is_err());
        assert!(FileName::parse("100-2-0-9.seg").is_err());
        assert!(FileName::parse("100-2-0").is_err());
        assert!(FileName::parse("abc-2-0.seg").is_err());
    }

    #[test]
    fn ordering_ignores_creation_time() {
        let older = FileName::new(900, 1, 0);
        let newer = FileName::new(100, 2, 0);
        assert!(older < newer);

        let merged = FileName::new(100, 2, 1);
        assert!(newer < merged);
    }

    #[test]
    fn partition_dir_names() {
        assert_eq!(parse_partition_dir("42"), Some(42));
        assert_eq!(parse_partition_dir("-3"), Some(-3));
        assert_eq!(parse_partition_dir("upgrade"), None);
        assert_eq!(parse_partition_dir(""), None);
    }

    #[test]
    fn partition_of_negative_timestamps() {
        assert_eq!(partition_of(10, 604_800_000), 0);
        assert_eq!(partition_of(604_800_000, 604_800_000), 1);
        assert_eq!(partition_of(-1, 604_800_000), -1);
    }

    #[test]
    fn sidecar_paths() {
        let data = Path::new("/data/sequence/sg1/0/100-1-0.seg");
        assert_eq!(
            resource_path(data),
            Path::new("/data/sequence/sg1/0/100-1-0.seg.resource")
        );
        assert_eq!(
            mods_path(data),
            Path::new("/data/sequence/sg1/0/100-1-0.seg.mods")
        );
    }
}
