//! Data-directory rotation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::layout::{SEQUENCE_DIR, UNSEQUENCE_DIR};
use crate::{Error, Result};

/// Hands out family roots for new data files and enumerates every root for
/// the recovery scan.
pub trait DirectoryRotator: Send + Sync {
    fn next_sequential_root(&self) -> Result<PathBuf>;
    fn next_unsequential_root(&self) -> Result<PathBuf>;
    fn sequential_roots(&self) -> Vec<PathBuf>;
    fn unsequential_roots(&self) -> Vec<PathBuf>;
}

/// Round-robin rotator over a fixed set of data roots. Each root carries a
/// `sequence/` and an `unsequence/` family directory.
pub struct RoundRobinDirs {
    seq: Vec<PathBuf>,
    unseq: Vec<PathBuf>,
    next_seq: AtomicUsize,
    next_unseq: AtomicUsize,
}

impl RoundRobinDirs {
    pub fn new(data_roots: impl IntoIterator<Item = PathBuf>) -> Result<Self> {
        let roots: Vec<PathBuf> = data_roots.into_iter().collect();
        if roots.is_empty() {
            return Err(Error::DiskSpaceInsufficient(
                "no data directories configured".to_string(),
            ));
        }
        Ok(Self {
            seq: roots.iter().map(|r| r.join(SEQUENCE_DIR)).collect(),
            unseq: roots.iter().map(|r| r.join(UNSEQUENCE_DIR)).collect(),
            next_seq: AtomicUsize::new(0),
            next_unseq: AtomicUsize::new(0),
        })
    }

    fn pick(roots: &[PathBuf], cursor: &AtomicUsize) -> Result<PathBuf> {
        let index = cursor.fetch_add(1, Ordering::AcqRel) % roots.len();
        let root = &roots[index];
        std::fs::create_dir_all(root).map_err(|err| {
            Error::DiskSpaceInsufficient(format!("{}: {err}", root.display()))
        })?;
        Ok(root.clone())
    }
}

impl DirectoryRotator for RoundRobinDirs {
    fn next_sequential_root(&self) -> Result<PathBuf> {
        Self::pick(&self.seq, &self.next_seq)
    }

    fn next_unsequential_root(&self) -> Result<PathBuf> {
        Self::pick(&self.unseq, &self.next_unseq)
    }

    fn sequential_roots(&self) -> Vec<PathBuf> {
        self.seq.clone()
    }

    fn unsequential_roots(&self) -> Vec<PathBuf> {
        self.unseq.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_robin_cycles_roots() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let dirs =
            RoundRobinDirs::new([a.path().to_path_buf(), b.path().to_path_buf()]).unwrap();

        let first = dirs.next_sequential_root().unwrap();
        let second = dirs.next_sequential_root().unwrap();
        let third = dirs.next_sequential_root().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
        assert!(first.ends_with(SEQUENCE_DIR));
        assert!(dirs.next_unsequential_root().unwrap().ends_with(UNSEQUENCE_DIR));
    }

    #[test]
    fn empty_roots_rejected() {
        assert!(RoundRobinDirs::new([]).is_err());
    }
}
