//! Write-ahead log hook.
//!
//! The log itself is an external collaborator; the coordinator only mirrors
//! deletion records into it for every affected writable buffer when the
//! feature is enabled.

use crate::mods::Deletion;
use crate::Result;

pub trait WalSink: Send + Sync {
    fn append_deletion(&self, partition: i64, sequential: bool, deletion: &Deletion)
        -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWal;

impl WalSink for NoopWal {
    fn append_deletion(
        &self,
        _partition: i64,
        _sequential: bool,
        _deletion: &Deletion,
    ) -> Result<()> {
        Ok(())
    }
}
