//! Per storage-group write, query and file-lifecycle coordinator for
//! time-partitioned series data.
//!
//! A [`StorageGroup`] owns the data files, sidecars and writable buffers
//! of one logical storage group: it routes every row to a sequential or
//! unsequential file by the device's flushed watermark, drives
//! asynchronous flush and close, folds unsequential files into sequential
//! ones in the background, applies crash-safe range deletions, enforces a
//! data ttl, loads externally produced files, and answers series queries
//! with a consistent resource snapshot.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod dirs;
pub mod error;
pub mod flush;
pub mod group;
pub mod layout;
pub mod load;
pub mod memtable;
pub mod merge;
pub mod meta;
pub mod mods;
pub mod query;
pub mod recover;
pub mod resource;
pub mod retention;
pub mod tracker;
pub mod version;
pub mod wal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MergeStrategy, StorageGroupConfig};
pub use dirs::{DirectoryRotator, RoundRobinDirs};
pub use error::{Error, Result};
pub use group::{
    DirectFlushPolicy, FlushPolicy, GroupOptions, Record, RowStatus, StorageGroup, Tablet,
};
pub use memtable::Value;
pub use meta::{MetadataProvider, NullMetadata};
pub use mods::Deletion;
pub use query::{
    NoopFileManager, QueryDataSource, QueryFileManager, ReadSource, TimeFilter, TimeRange,
};
pub use resource::FileResource;
pub use version::{FileVersionController, VersionController};
pub use wal::{NoopWal, WalSink};
