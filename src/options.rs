use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::skiplist::MAX_NODE_SIZE;

/// Values above this size always go to the value log, no matter what
/// `value_threshold` is configured to.
pub(crate) const MAX_VALUE_THRESHOLD: usize = 1 << 20;

/// How data in table files and value log files is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLoadingMode {
    /// Load using standard file IO.
    FileIO,
    /// Memory-map the file.
    MemoryMap,
}

/// How a table's blocks are compressed. Carried through the manifest so a
/// table can be reopened with the codec it was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Snappy,
    Zstd,
}

impl From<CompressionType> for u8 {
    fn from(c: CompressionType) -> u8 {
        match c {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
            CompressionType::Zstd => 2,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = crate::Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Snappy),
            2 => Ok(CompressionType::Zstd),
            other => Err(crate::errdata!("unknown compression type {other}")),
        }
    }
}

/// Configuration for the database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the manifest, key registry and table files.
    pub dir: PathBuf,

    /// Directory holding the value log. May equal `dir`.
    pub value_dir: PathBuf,

    /// Keep everything in memory: no directories, locks, manifest or key
    /// registry files are created.
    pub in_memory: bool,

    /// Open without taking an exclusive lock. No truncation, no compaction
    /// on close, no new files.
    pub read_only: bool,

    /// Allow truncating a trailing half-written manifest record on open.
    pub truncate: bool,

    /// Values at or above this size are stored in the value log and the
    /// skiplist holds a value pointer instead.
    pub value_threshold: usize,

    /// Maximum size of a single value log segment, in `[1 MiB, 2 GiB]`.
    pub value_log_file_size: u64,

    /// How value log segments are loaded.
    pub value_log_loading_mode: FileLoadingMode,

    /// Size at which the active skiplist is sealed and queued for flush.
    pub max_table_size: u64,

    /// How many sealed skiplists may be pending flush per partition.
    pub num_memory_tables: usize,

    /// Number of levels per partition.
    pub max_levels: usize,

    /// Total size budget of level one.
    pub level_one_size: u64,

    /// Size ratio between adjacent levels from level two down.
    pub level_size_multiplier: u64,

    /// Level-zero table count that makes compaction from L0 eligible.
    pub num_level_zero_tables: usize,

    /// Level-zero table count at which writers stall until compaction
    /// catches up. Must be greater than `num_level_zero_tables`.
    pub num_level_zero_tables_stall: usize,

    /// Number of compaction workers.
    pub num_compactors: usize,

    /// Compact level zero into level one before closing.
    pub compact_l0_on_close: bool,

    /// Serve level zero from memory. Forces `compact_l0_on_close`.
    pub keep_l0_in_memory: bool,

    /// Master key for the key registry. Empty disables encryption.
    pub encryption_key: Vec<u8>,

    /// Data keys older than this are rotated.
    pub encryption_key_rotation_duration: Duration,

    /// Block cache budget shared by all partitions.
    pub max_cache_size: usize,

    /// Fsync the value log on every write batch. Disabled when in memory.
    pub sync_writes: bool,

    /// Emit trace events for background activity.
    pub event_logging: bool,

    // Derived at open, not set by callers.
    pub(crate) max_batch_size: u64,
    pub(crate) max_batch_count: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            value_dir: PathBuf::new(),
            in_memory: false,
            read_only: false,
            truncate: false,
            value_threshold: 32,
            value_log_file_size: 1 << 30,
            value_log_loading_mode: FileLoadingMode::FileIO,
            max_table_size: 64 << 20,
            num_memory_tables: 5,
            max_levels: 7,
            level_one_size: 256 << 20,
            level_size_multiplier: 10,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 10,
            num_compactors: 2,
            compact_l0_on_close: true,
            keep_l0_in_memory: false,
            encryption_key: Vec::new(),
            encryption_key_rotation_duration: Duration::from_secs(10 * 24 * 60 * 60),
            max_cache_size: 1 << 30,
            sync_writes: true,
            event_logging: false,
            max_batch_size: 0,
            max_batch_count: 0,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory, which also holds the
    /// value log.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            value_dir: dir.clone(),
            dir,
            ..Default::default()
        }
    }

    /// Separate directory for value log segments.
    pub fn value_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.value_dir = dir.into();
        self
    }

    pub fn in_memory(mut self, enabled: bool) -> Self {
        self.in_memory = enabled;
        self
    }

    pub fn read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }

    pub fn truncate(mut self, enabled: bool) -> Self {
        self.truncate = enabled;
        self
    }

    pub fn value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    pub fn value_log_file_size(mut self, size: u64) -> Self {
        self.value_log_file_size = size;
        self
    }

    pub fn value_log_loading_mode(mut self, mode: FileLoadingMode) -> Self {
        self.value_log_loading_mode = mode;
        self
    }

    pub fn max_table_size(mut self, size: u64) -> Self {
        self.max_table_size = size;
        self
    }

    pub fn num_memory_tables(mut self, count: usize) -> Self {
        self.num_memory_tables = count;
        self
    }

    pub fn max_levels(mut self, count: usize) -> Self {
        self.max_levels = count;
        self
    }

    pub fn level_one_size(mut self, size: u64) -> Self {
        self.level_one_size = size;
        self
    }

    pub fn level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    pub fn num_level_zero_tables(mut self, count: usize) -> Self {
        self.num_level_zero_tables = count;
        self
    }

    pub fn num_level_zero_tables_stall(mut self, count: usize) -> Self {
        self.num_level_zero_tables_stall = count;
        self
    }

    pub fn num_compactors(mut self, count: usize) -> Self {
        self.num_compactors = count;
        self
    }

    pub fn compact_l0_on_close(mut self, enabled: bool) -> Self {
        self.compact_l0_on_close = enabled;
        self
    }

    pub fn keep_l0_in_memory(mut self, enabled: bool) -> Self {
        self.keep_l0_in_memory = enabled;
        self
    }

    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.encryption_key = key;
        self
    }

    pub fn encryption_key_rotation_duration(mut self, duration: Duration) -> Self {
        self.encryption_key_rotation_duration = duration;
        self
    }

    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    pub fn event_logging(mut self, enabled: bool) -> Self {
        self.event_logging = enabled;
        self
    }

    /// Validates the options and fills in the derived batch limits. Called
    /// once at open, before any file is touched.
    pub(crate) fn finish(mut self) -> Result<Self> {
        if self.in_memory
            && (self.dir != PathBuf::new() || self.value_dir != PathBuf::new())
        {
            return Err(crate::errconfig!(
                "cannot open in memory-only mode with dir or value_dir set"
            ));
        }

        if self.value_threshold > MAX_VALUE_THRESHOLD {
            return Err(crate::errconfig!(
                "value_threshold must be less than or equal to {MAX_VALUE_THRESHOLD}"
            ));
        }

        if self.value_log_file_size < (1 << 20) || self.value_log_file_size > (2 << 30) {
            return Err(crate::errconfig!(
                "value_log_file_size must be between 1 MiB and 2 GiB"
            ));
        }

        if self.num_level_zero_tables_stall <= self.num_level_zero_tables {
            return Err(crate::errconfig!(
                "num_level_zero_tables_stall must be greater than num_level_zero_tables"
            ));
        }

        // Serving L0 from memory only works if L0 is drained before close.
        self.compact_l0_on_close = self.compact_l0_on_close || self.keep_l0_in_memory;

        if self.read_only {
            self.truncate = false;
            self.compact_l0_on_close = false;
        }

        if self.in_memory {
            self.sync_writes = false;
        }

        self.max_batch_size = (15 * self.max_table_size) / 100;
        self.max_batch_count = self.max_batch_size / MAX_NODE_SIZE as u64;

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let opts = Options::new("/tmp/emberdb");
        assert_eq!(opts.dir, PathBuf::from("/tmp/emberdb"));
        assert_eq!(opts.value_dir, PathBuf::from("/tmp/emberdb"));
        assert_eq!(opts.max_levels, 7);
        assert!(opts.sync_writes);
    }

    #[test]
    fn test_finish_derives_batch_limits() {
        let opts = Options::new("/tmp/emberdb").finish().unwrap();
        assert_eq!(opts.max_batch_size, (15 * opts.max_table_size) / 100);
        assert_eq!(
            opts.max_batch_count,
            opts.max_batch_size / MAX_NODE_SIZE as u64
        );
    }

    #[test]
    fn test_finish_rejects_bad_vlog_size() {
        let opts = Options::new("/tmp/emberdb").value_log_file_size(1 << 10);
        assert!(matches!(opts.finish(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_finish_rejects_stall_below_target() {
        let opts = Options::new("/tmp/emberdb")
            .num_level_zero_tables(5)
            .num_level_zero_tables_stall(5);
        assert!(matches!(opts.finish(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_keep_l0_in_memory_forces_compact_on_close() {
        let opts = Options::new("/tmp/emberdb")
            .compact_l0_on_close(false)
            .keep_l0_in_memory(true)
            .finish()
            .unwrap();
        assert!(opts.compact_l0_on_close);
    }

    #[test]
    fn test_read_only_disables_truncate() {
        let opts = Options::new("/tmp/emberdb")
            .truncate(true)
            .read_only(true)
            .finish()
            .unwrap();
        assert!(!opts.truncate);
        assert!(!opts.compact_l0_on_close);
    }
}
