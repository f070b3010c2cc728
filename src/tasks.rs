//! Background task implementations registered on the scheduler.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::db::DbInner;
use crate::error::Result;
use crate::levels::LevelsController;
use crate::scheduler::{BackgroundTask, Context};
use crate::table::TABLE_FILE_EXTENSION;
use crate::vlog::VLOG_FILE_EXTENSION;

/// One compaction worker. Each worker starts after its own random delay so
/// the pool does not tick in lockstep, then checks for work every second.
pub(crate) struct CompactionWorker {
    levels: Arc<LevelsController>,
    initial_delay: Duration,
}

impl CompactionWorker {
    pub(crate) fn new(levels: Arc<LevelsController>) -> CompactionWorker {
        CompactionWorker {
            levels,
            initial_delay: Duration::from_millis(rand::thread_rng().gen_range(0..1000)),
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionWorker {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.levels.run_compaction().await
    }
}

/// Walks the database directories once a minute and records their sizes.
pub(crate) struct SizeTracker {
    inner: Arc<DbInner>,
}

impl SizeTracker {
    pub(crate) fn new(inner: Arc<DbInner>) -> SizeTracker {
        SizeTracker { inner }
    }

    fn dir_size(dir: &std::path::Path, extension: &str) -> Result<u64> {
        let mut total = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(extension) {
                    total += entry.metadata()?.len();
                }
            }
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SizeTracker {
    fn name(&self) -> &'static str {
        "size-tracker"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let options = &self.inner.options;
        let lsm_size = Self::dir_size(&options.dir, TABLE_FILE_EXTENSION)?;
        let vlog_size = Self::dir_size(&options.value_dir, VLOG_FILE_EXTENSION)?;
        self.inner.size.lsm_size.store(lsm_size, Ordering::SeqCst);
        self.inner.size.vlog_size.store(vlog_size, Ordering::SeqCst);
        tracing::debug!(lsm_size, vlog_size, "database size sampled");
        Ok(())
    }
}
