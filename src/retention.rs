//! Data-ttl sweep over the file index.

use std::sync::Arc;

use crate::group::StorageGroup;
use crate::resource::FileResource;

impl StorageGroup {
    /// Evict sealed files whose data is entirely older than the ttl
    /// cutoff. Files in a merge are left alone, and a file busy with a
    /// reader is skipped until the next sweep.
    pub fn check_files_ttl(&self) {
        let _sweep = self.sweep_lock.lock();
        let Some(ttl) = self.config.data_ttl_ms else {
            return;
        };
        let cutoff = self.clock.now_millis() - ttl;

        let (seq, unseq) = {
            let state = self.state.read();
            (state.seq_files.clone(), state.unseq_files.clone())
        };
        for (sequential, resource) in seq
            .iter()
            .map(|r| (true, r))
            .chain(unseq.iter().map(|r| (false, r)))
        {
            if resource.is_merging() || !resource.is_closed() {
                continue;
            }
            if !resource.is_deleted() && resource.still_lives(cutoff) {
                continue;
            }
            {
                let _state = self.state.write();
                // A merge may have claimed the file since the snapshot.
                if resource.is_merging() {
                    continue;
                }
                resource.set_deleted(true);
            }
            self.try_evict(sequential, resource);
        }
    }

    pub(crate) fn try_evict(&self, sequential: bool, resource: &Arc<FileResource>) {
        let Some(_guard) = resource.write_query_lock().try_write() else {
            log::debug!(
                "ttl sweep skipping busy file {}",
                resource.path().display()
            );
            return;
        };
        if let Err(err) = resource.remove_files() {
            log::error!(
                "ttl sweep failed removing {}: {err}",
                resource.path().display()
            );
            return;
        }
        let mut state = self.state.write();
        let list = if sequential {
            &mut state.seq_files
        } else {
            &mut state.unseq_files
        };
        list.retain(|r| !Arc::ptr_eq(r, resource));
        log::info!(
            "storage group {}: ttl evicted {}",
            self.name,
            resource.path().display()
        );
    }
}
