//! Layered per-device timestamp tables driving the routing decision.
//!
//! Three tables, loosest to strictest:
//!   1. latest ingest time seen in RAM, per (partition, device);
//!   2. latest time committed to a sealed or closing sequential file,
//!      per (partition, device);
//!   3. the maximum of (2) across partitions, per device.
//!
//! For every (partition, device), (2) <= (1), (2) never decreases, and (3)
//! is the cross-partition maximum of (2). A row is sequential iff its
//! timestamp is strictly greater than (2) for its partition.

use std::collections::HashMap;

/// Sentinel for "no timestamp observed".
pub const NO_TIMESTAMP: i64 = i64::MIN;

#[derive(Debug, Default)]
pub struct LatestTimeTracker {
    latest: HashMap<i64, HashMap<String, i64>>,
    flushed: HashMap<i64, HashMap<String, i64>>,
    global_flushed: HashMap<String, i64>,
}

impl LatestTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_partition(&mut self, partition: i64) {
        self.latest.entry(partition).or_default();
        self.flushed.entry(partition).or_default();
    }

    pub fn latest_time(&self, partition: i64, device: &str) -> i64 {
        self.latest
            .get(&partition)
            .and_then(|m| m.get(device))
            .copied()
            .unwrap_or(NO_TIMESTAMP)
    }

    pub fn flushed_time(&self, partition: i64, device: &str) -> i64 {
        self.flushed
            .get(&partition)
            .and_then(|m| m.get(device))
            .copied()
            .unwrap_or(NO_TIMESTAMP)
    }

    pub fn global_flushed_time(&self, device: &str) -> i64 {
        self.global_flushed
            .get(device)
            .copied()
            .unwrap_or(NO_TIMESTAMP)
    }

    /// Strict comparison: a row at exactly the flushed watermark is not
    /// sequential.
    pub fn is_sequential(&self, partition: i64, device: &str, timestamp: i64) -> bool {
        timestamp > self.flushed_time(partition, device)
    }

    /// Record an ingested timestamp in the RAM table.
    pub fn observe(&mut self, partition: i64, device: &str, timestamp: i64) {
        let entry = self
            .latest
            .entry(partition)
            .or_default()
            .entry(device.to_string())
            .or_insert(NO_TIMESTAMP);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Promote the partition's RAM table into the flushed table after a
    /// sequential buffer flushed. Returns false iff the partition had no
    /// devices.
    pub fn promote_flushed(&mut self, partition: i64) -> bool {
        let Some(latest) = self.latest.get(&partition) else {
            return false;
        };
        if latest.is_empty() {
            return false;
        }
        let devices: Vec<(String, i64)> =
            latest.iter().map(|(d, t)| (d.clone(), *t)).collect();
        let flushed = self.flushed.entry(partition).or_default();
        for (device, time) in devices {
            let entry = flushed.entry(device.clone()).or_insert(NO_TIMESTAMP);
            if time > *entry {
                *entry = time;
            }
            let global = self
                .global_flushed
                .entry(device)
                .or_insert(NO_TIMESTAMP);
            if time > *global {
                *global = time;
            }
        }
        true
    }

    /// Seed a flushed watermark from a recovered or loaded sequential file.
    /// Keeps the RAM table consistent with (2) <= (1).
    pub fn seed_flushed(&mut self, partition: i64, device: &str, timestamp: i64) {
        self.seed_latest(partition, device, timestamp);
        let flushed = self
            .flushed
            .entry(partition)
            .or_default()
            .entry(device.to_string())
            .or_insert(NO_TIMESTAMP);
        if timestamp > *flushed {
            *flushed = timestamp;
        }
        let global = self
            .global_flushed
            .entry(device.to_string())
            .or_insert(NO_TIMESTAMP);
        if timestamp > *global {
            *global = timestamp;
        }
    }

    pub fn seed_latest(&mut self, partition: i64, device: &str, timestamp: i64) {
        self.observe(partition, device, timestamp);
    }

    /// Max ingest time across partitions, or None if the device was never
    /// seen. Drives the delete no-op check.
    pub fn last_update_time(&self, device: &str) -> Option<i64> {
        let mut best = None;
        for table in self.latest.values() {
            if let Some(time) = table.get(device) {
                best = Some(best.map_or(*time, |b: i64| b.max(*time)));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_uses_strict_comparison() {
        let mut tracker = LatestTimeTracker::new();
        tracker.ensure_partition(0);
        assert!(tracker.is_sequential(0, "d1", 10));

        tracker.observe(0, "d1", 20);
        tracker.promote_flushed(0);
        assert!(!tracker.is_sequential(0, "d1", 20));
        assert!(!tracker.is_sequential(0, "d1", 5));
        assert!(tracker.is_sequential(0, "d1", 21));
    }

    #[test]
    fn flushed_never_exceeds_latest() {
        let mut tracker = LatestTimeTracker::new();
        tracker.observe(0, "d1", 100);
        tracker.observe(1, "d1", 50);
        tracker.promote_flushed(0);
        tracker.promote_flushed(1);

        assert!(tracker.flushed_time(0, "d1") <= tracker.latest_time(0, "d1"));
        assert!(tracker.flushed_time(1, "d1") <= tracker.latest_time(1, "d1"));
        assert_eq!(tracker.global_flushed_time("d1"), 100);
    }

    #[test]
    fn promote_reports_empty_partition() {
        let mut tracker = LatestTimeTracker::new();
        tracker.ensure_partition(7);
        assert!(!tracker.promote_flushed(7));
        tracker.observe(7, "d1", 1);
        assert!(tracker.promote_flushed(7));
    }

    #[test]
    fn global_is_max_over_partitions() {
        let mut tracker = LatestTimeTracker::new();
        tracker.seed_flushed(0, "d1", 30);
        tracker.seed_flushed(2, "d1", 80);
        tracker.seed_flushed(1, "d1", 40);
        assert_eq!(tracker.global_flushed_time("d1"), 80);
        assert_eq!(tracker.flushed_time(1, "d1"), 40);
    }

    #[test]
    fn last_update_time_over_partitions() {
        let mut tracker = LatestTimeTracker::new();
        assert_eq!(tracker.last_update_time("d1"), None);
        tracker.observe(0, "d1", 15);
        tracker.observe(3, "d1", 9);
        assert_eq!(tracker.last_update_time("d1"), Some(15));
    }
}
