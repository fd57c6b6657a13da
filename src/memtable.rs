//! In-memory series store backing one writable buffer.
//!
//! The production column store lives behind the buffer API; this stand-in
//! keeps one sorted map per series and is enough to serve unsealed queries,
//! in-memory deletes and the flush walk.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

#[derive(Debug, Default)]
pub struct MemTable {
    series: HashMap<String, HashMap<String, BTreeMap<i64, Value>>>,
    row_count: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: &str, measurement: &str, timestamp: i64, value: Value) {
        let points = self
            .series
            .entry(device.to_string())
            .or_default()
            .entry(measurement.to_string())
            .or_default();
        if points.insert(timestamp, value).is_none() {
            self.row_count += 1;
        }
    }

    /// Drop every point of the series at or before the bound. Returns the
    /// number of points removed.
    pub fn delete(&mut self, device: &str, measurement: &str, upper_bound: i64) -> usize {
        let Some(points) = self
            .series
            .get_mut(device)
            .and_then(|m| m.get_mut(measurement))
        else {
            return 0;
        };
        let keep = points.split_off(&(upper_bound + 1));
        let removed = points.len();
        *points = keep;
        self.row_count -= removed;
        removed
    }

    pub fn snapshot(&self, device: &str, measurement: &str) -> Vec<(i64, Value)> {
        self.series
            .get(device)
            .and_then(|m| m.get(measurement))
            .map(|points| points.iter().map(|(t, v)| (*t, v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Walk every point in (device, measurement, timestamp) order.
    pub fn iter_points(&self) -> impl Iterator<Item = (&str, &str, i64, &Value)> {
        let mut devices: Vec<_> = self.series.iter().collect();
        devices.sort_by(|a, b| a.0.cmp(b.0));
        devices.into_iter().flat_map(|(device, series)| {
            let mut names: Vec<_> = series.iter().collect();
            names.sort_by(|a, b| a.0.cmp(b.0));
            names.into_iter().flat_map(move |(measurement, points)| {
                points
                    .iter()
                    .map(move |(t, v)| (device.as_str(), measurement.as_str(), *t, v))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_snapshot_sorted() {
        let mut table = MemTable::new();
        table.insert("d1", "m1", 20, Value::I64(2));
        table.insert("d1", "m1", 10, Value::I64(1));
        table.insert("d1", "m2", 5, Value::F64(0.5));

        let points = table.snapshot("d1", "m1");
        assert_eq!(points, vec![(10, Value::I64(1)), (20, Value::I64(2))]);
        assert_eq!(table.row_count(), 3);
    }

    #[test]
    fn duplicate_timestamp_overwrites() {
        let mut table = MemTable::new();
        table.insert("d1", "m1", 10, Value::I64(1));
        table.insert("d1", "m1", 10, Value::I64(9));
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.snapshot("d1", "m1"), vec![(10, Value::I64(9))]);
    }

    #[test]
    fn delete_is_inclusive() {
        let mut table = MemTable::new();
        for t in [10, 20, 30] {
            table.insert("d1", "m1", t, Value::I64(t));
        }
        let removed = table.delete("d1", "m1", 20);
        assert_eq!(removed, 2);
        assert_eq!(table.snapshot("d1", "m1"), vec![(30, Value::I64(30))]);
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn iter_points_is_ordered() {
        let mut table = MemTable::new();
        table.insert("d2", "m1", 1, Value::I64(1));
        table.insert("d1", "m1", 3, Value::I64(3));
        table.insert("d1", "m1", 2, Value::I64(2));

        let rows: Vec<_> = table
            .iter_points()
            .map(|(d, m, t, _)| (d.to_string(), m.to_string(), t))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("d1".to_string(), "m1".to_string(), 2),
                ("d1".to_string(), "m1".to_string(), 3),
                ("d2".to_string(), "m1".to_string(), 1),
            ]
        );
    }
}
