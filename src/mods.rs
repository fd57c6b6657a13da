//! Tombstone records and modification sidecar files.
//!
//! A modification file is an append-only log of deletions next to a data
//! file. Records are one JSON object per line; a torn trailing line left by
//! a crash is tolerated on read and overwritten by the next append.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// A range tombstone: for `device.measurement`, delete every point whose
/// timestamp is `<= upper_bound`. The version stamps the deletion into the
/// per-partition total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub device: String,
    pub measurement: String,
    pub version: u64,
    pub upper_bound: i64,
}

impl Deletion {
    pub fn new(
        device: impl Into<String>,
        measurement: impl Into<String>,
        version: u64,
        upper_bound: i64,
    ) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
            version,
            upper_bound,
        }
    }

    pub fn matches(&self, device: &str, measurement: &str) -> bool {
        self.device == device && self.measurement == measurement
    }
}

/// Append-only modification file.
pub struct ModificationFile {
    path: PathBuf,
    file: Option<File>,
}

impl ModificationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("file just opened"))
    }

    /// Append one record and sync. Returns the file length before the
    /// append so the caller can roll back with [`truncate_to`].
    ///
    /// [`truncate_to`]: ModificationFile::truncate_to
    pub fn append(&mut self, deletion: &Deletion) -> Result<u64> {
        let mut line = serde_json::to_vec(deletion)?;
        line.push(b'\n');
        let file = self.open()?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(offset)
    }

    /// Roll an aborted write back to a previously observed length.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        let file = self.open()?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Release the handle; the next append reopens the file.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Delete the file from disk. Missing files are fine.
    pub fn remove(&mut self) -> Result<()> {
        self.file = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read every record currently in the file. A malformed trailing line
    /// is logged and skipped.
    pub fn read_all(&self) -> Result<Vec<Deletion>> {
        read_mods(&self.path)
    }
}

pub fn read_mods(path: &Path) -> Result<Vec<Deletion>> {
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
        match serde_json::from_str::<Deletion>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                log::warn!(
                    "skipping malformed tombstone in {}: {err}",
                    path.display()
                );
            }
        }
    }
    Ok(records)
}
