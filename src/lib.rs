//! emberdb: an embedded, partitioned LSM-tree key/value store.
//!
//! Every partition is an independent LSM tree with its own level hierarchy
//! and compaction schedule, while all partitions share one manifest, one
//! value log, and one key registry. Cross-partition writes commit
//! atomically under a single timestamp.

pub mod db;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod keys;
pub mod levels;
pub mod manifest;
pub mod options;
pub mod oracle;
pub mod registry;
pub mod scheduler;
pub mod skiplist;
pub mod table;
pub mod tasks;
pub mod throttle;
pub mod vlog;
pub mod watermark;

/// Identifier of an independently compacted LSM sub-tree.
pub type PartitionId = u32;

pub use db::Db;
pub use error::{Error, Result};
pub use keys::{Entry, ValuePointer, ValueStruct};
pub use options::{CompressionType, FileLoadingMode, Options};
pub use skiplist::Skiplist;
pub use throttle::Throttle;
pub use watermark::WaterMark;
