//! Writable buffer: the single in-memory accumulator for one
//! `(partition, kind)`, tied to its data file under construction.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::memtable::{MemTable, Value};
use crate::resource::{DataRecord, FileResource};
use crate::Result;

pub struct WorkBuffer {
    partition: i64,
    sequential: bool,
    resource: Arc<FileResource>,
    version: u64,
    flush_threshold: usize,
    mem: Mutex<MemTable>,
}

impl WorkBuffer {
    pub fn new(
        partition: i64,
        sequential: bool,
        resource: Arc<FileResource>,
        version: u64,
        flush_threshold: usize,
    ) -> Self {
        Self {
            partition,
            sequential,
            resource,
            version,
            flush_threshold,
            mem: Mutex::new(MemTable::new()),
        }
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    pub fn resource(&self) -> &Arc<FileResource> {
        &self.resource
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn insert(&self, device: &str, timestamp: i64, fields: &[(String, Value)]) -> Result<()> {
        let mut mem = self.mem.lock();
        for (measurement, value) in fields {
            mem.insert(device, measurement, timestamp, value.clone());
        }
        drop(mem);
        self.resource.update_start_time(device, timestamp);
        // Unsequential end times stay current during insertion; sequential
        // end times are frozen from the RAM table when the buffer closes.
        if !self.sequential {
            self.resource.update_end_time(device, timestamp);
        }
        Ok(())
    }

    /// Write a column-major run of rows `[start, end)` for one device.
    pub fn write_run(
        &self,
        device: &str,
        measurements: &[String],
        timestamps: &[i64],
        columns: &[Vec<Value>],
        start: usize,
        end: usize,
    ) -> Result<()> {
        let mut mem = self.mem.lock();
        for row in start..end {
            for (column, measurement) in columns.iter().zip(measurements.iter()) {
                mem.insert(device, measurement, timestamps[row], column[row].clone());
            }
        }
        drop(mem);
        self.resource.update_start_time(device, timestamps[start]);
        if !self.sequential {
            self.resource.update_end_time(device, timestamps[end - 1]);
        }
        Ok(())
    }

    /// Refill the memtable from recovered on-disk records without touching
    /// the resource time maps.
    pub fn restore(&self, records: &[DataRecord]) {
        let mut mem = self.mem.lock();
        for record in records {
            mem.insert(&record.device, &record.measurement, record.t, record.v.clone());
        }
    }

    pub fn should_flush(&self) -> bool {
        self.mem.lock().row_count() >= self.flush_threshold
    }

    pub fn is_empty(&self) -> bool {
        self.mem.lock().is_empty()
    }

    pub fn delete_in_mem(&self, device: &str, measurement: &str, upper_bound: i64) -> usize {
        self.mem.lock().delete(device, measurement, upper_bound)
    }

    pub fn snapshot(&self, device: &str, measurement: &str) -> Vec<(i64, Value)> {
        self.mem.lock().snapshot(device, measurement)
    }

    /// Persist every in-memory point to the data file and sync it. The
    /// caller seals the resource afterwards.
    pub fn flush_to_disk(&self) -> Result<()> {
        let path = self.resource.path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        let mem = self.mem.lock();
        for (device, measurement, t, v) in mem.iter_points() {
            let record = DataRecord {
                device: device.to_string(),
                measurement: measurement.to_string(),
                t,
                v: v.clone(),
            };
            serde_json::to_writer(&mut writer, &record)?;
            writer.write_all(b"\n")?;
        }
        drop(mem);
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}
