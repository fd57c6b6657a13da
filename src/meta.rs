//! Metadata-tree collaborator interface.

use crate::memtable::Value;
use crate::Result;

/// The schema tree and last-value cache live outside the coordinator; each
/// ingested point is reported here with the device's global flushed
/// watermark as the cache priority key.
pub trait MetadataProvider: Send + Sync {
    fn update_last_cache(
        &self,
        device: &str,
        measurement: &str,
        timestamp: i64,
        value: &Value,
        latest_flushed: i64,
    ) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetadata;

impl MetadataProvider for NullMetadata {
    fn update_last_cache(
        &self,
        _device: &str,
        _measurement: &str,
        _timestamp: i64,
        _value: &Value,
        _latest_flushed: i64,
    ) -> Result<()> {
        Ok(())
    }
}
