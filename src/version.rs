//! Per-partition version allocation and the direct-version catalog.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::{Error, Result};

/// Allocates monotonically increasing versions per time partition. Every
/// file creation and every deletion consumes one value.
pub trait VersionController: Send + Sync {
    fn next_version(&self, partition: i64) -> Result<u64>;

    /// Hint that no writable buffer holds the partition any more; the
    /// controller may drop cached state. The durable counter survives.
    fn retire(&self, _partition: i64) {}
}

/// Version controller durably backed by one `<partition>-versions` file per
/// partition in the storage-group system directory. Each file holds the
/// little-endian counter followed by its crc32.
pub struct FileVersionController {
    dir: PathBuf,
    counters: Mutex<HashMap<i64, u64>>,
}

const VERSION_RECORD_LEN: usize = 12;

impl FileVersionController {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counters: Mutex::new(HashMap::new()),
        })
    }

    fn counter_path(&self, partition: i64) -> PathBuf {
        self.dir.join(format!("{partition}-versions"))
    }

    fn load(&self, partition: i64) -> Result<u64> {
        let path = self.counter_path(partition);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut buf = [0u8; VERSION_RECORD_LEN];
        file.read_exact(&mut buf)?;
        let value = u64::from_le_bytes(buf[0..8].try_into().expect("slice length"));
        let stored_crc = u32::from_le_bytes(buf[8..12].try_into().expect("slice length"));
        if crc32fast::hash(&buf[0..8]) != stored_crc {
            return Err(Error::Corrupt("version counter checksum mismatch"));
        }
        Ok(value)
    }

    fn store(&self, partition: i64, value: u64) -> Result<()> {
        let mut buf = [0u8; VERSION_RECORD_LEN];
        buf[0..8].copy_from_slice(&value.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..8]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.counter_path(partition))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}

impl VersionController for FileVersionController {
    fn next_version(&self, partition: i64) -> Result<u64> {
        let mut counters = self.counters.lock();
        let current = match counters.get(&partition) {
            Some(value) => *value,
            None => self.load(partition)?,
        };
        let next = current + 1;
        self.store(partition, next)?;
        counters.insert(partition, next);
        Ok(next)
    }

    fn retire(&self, partition: i64) {
        self.counters.lock().remove(&partition);
    }
}

/// Per-partition set of direct file versions (versions produced by closing
/// a writable buffer, not by merge) plus the running maximum. Answers
/// "do we already have this file?" for external loads.
#[derive(Debug, Default)]
pub struct PartitionVersionCatalog {
    direct: HashMap<i64, BTreeSet<u64>>,
    max: HashMap<i64, u64>,
}

impl PartitionVersionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, partition: i64, versions: impl IntoIterator<Item = u64>) {
        let set = self.direct.entry(partition).or_default();
        for version in versions {
            set.insert(version);
            let max = self.max.entry(partition).or_insert(version);
            if version > *max {
                *max = version;
            }
        }
    }

    /// Raise the running maximum without adding to the direct set, for
    /// versions observed in merge-derived files.
    pub fn record_max(&mut self, partition: i64, version: u64) {
        let max = self.max.entry(partition).or_insert(version);
        if version > *max {
            *max = version;
        }
    }

    pub fn max_version(&self, partition: i64) -> u64 {
        self.max.get(&partition).copied().unwrap_or(0)
    }

    /// True when every given version is already present for the partition.
    pub fn covers(&self, partition: i64, versions: &BTreeSet<u64>) -> bool {
        if versions.is_empty() {
            return false;
        }
        match self.direct.get(&partition) {
            Some(set) => versions.is_subset(set),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn versions_are_monotonic_and_durable() {
        let dir = TempDir::new().unwrap();
        let controller = FileVersionController::new(dir.path()).unwrap();
        assert_eq!(controller.next_version(0).unwrap(), 1);
        assert_eq!(controller.next_version(0).unwrap(), 2);
        assert_eq!(controller.next_version(5).unwrap(), 1);

        controller.retire(0);
        assert_eq!(controller.next_version(0).unwrap(), 3);

        // A fresh controller over the same directory resumes the counters.
        let reopened = FileVersionController::new(dir.path()).unwrap();
        assert_eq!(reopened.next_version(0).unwrap(), 4);
        assert_eq!(reopened.next_version(5).unwrap(), 2);
    }

    #[test]
    fn corrupt_counter_is_reported() {
        let dir = TempDir::new().unwrap();
        let controller = FileVersionController::new(dir.path()).unwrap();
        controller.next_version(3).unwrap();

        std::fs::write(dir.path().join("3-versions"), [0u8; 12]).unwrap();
        let reopened = FileVersionController::new(dir.path()).unwrap();
        assert!(matches!(
            reopened.next_version(3),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn catalog_subset_detection() {
        let mut catalog = PartitionVersionCatalog::new();
        catalog.record(0, [1, 2, 3]);

        let subset: BTreeSet<u64> = [1, 2].into_iter().collect();
        let disjoint: BTreeSet<u64> = [4].into_iter().collect();
        assert!(catalog.covers(0, &subset));
        assert!(!catalog.covers(0, &disjoint));
        assert!(!catalog.covers(1, &subset));
        assert_eq!(catalog.max_version(0), 3);
        assert_eq!(catalog.max_version(9), 0);
    }
}
