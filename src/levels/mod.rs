//! The partitioned level controller: the mutable, in-memory mirror of the
//! manifest, one level hierarchy per partition.
//!
//! On startup the controller reconciles the manifest against the
//! directory (missing tables are fatal, unreferenced partitions are
//! cleaned up), opens every referenced table with bounded parallelism and
//! rebuilds the level handlers. At runtime it serves reads, admits flushed
//! level-zero tables (stalling writers when level zero is congested), and
//! schedules compactions scored the way RocksDB scores leveled compaction.

pub mod compaction;
pub mod handler;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::flock::sync_dir;
use crate::keys::ValueStruct;
use crate::manifest::change::ManifestChange;
use crate::manifest::{Manifest, ManifestFile};
use crate::options::{CompressionType, Options};
use crate::registry::KeyRegistry;
use crate::table::{new_filename, parse_file_id, Builder, Table};
use crate::throttle::Throttle;
use crate::PartitionId;

use compaction::{
    key_range_of, CompactDef, CompactStatus, CompactionPriority, KeyRange, MergeIterator,
};
use handler::LevelHandler;

/// Parallelism for opening tables at startup. Three workers saturate disk
/// throughput on both HDDs and SSDs.
const TABLE_OPEN_WORKERS: usize = 3;

/// One partition's level hierarchy and compaction state.
pub struct PartitionLevels {
    pub next_file_id: AtomicU64,
    pub levels: Vec<Arc<LevelHandler>>,
    pub compact_status: Mutex<CompactStatus>,
}

/// The level controller shared by all partitions.
pub struct LevelsController {
    options: Options,
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionLevels>>>,
    manifest: Arc<ManifestFile>,
    registry: Arc<KeyRegistry>,
}

/// Scans the directory for table files, keyed by partition.
pub fn get_file_id_map(dir: &std::path::Path) -> Result<HashMap<PartitionId, HashSet<u64>>> {
    let mut id_map: HashMap<PartitionId, HashSet<u64>> = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some((partition_id, file_id)) = parse_file_id(name) {
                id_map.entry(partition_id).or_default().insert(file_id);
            }
        }
    }
    Ok(id_map)
}

/// Checks that every table the manifest references exists on disk and
/// removes table files belonging to partitions the manifest knows nothing
/// about.
pub fn revert_to_manifest(
    dir: &std::path::Path,
    manifest: &Manifest,
    id_map: &HashMap<PartitionId, HashSet<u64>>,
) -> Result<()> {
    // 1. Every manifest table must exist.
    for (partition_id, partition) in &manifest.partitions {
        for table_id in partition.tables.keys() {
            let present = id_map
                .get(partition_id)
                .map(|ids| ids.contains(table_id))
                .unwrap_or(false);
            if !present {
                return Err(crate::errdata!("file does not exist for table {table_id}"));
            }
        }
    }

    // 2. Delete files whose partition the manifest does not know.
    for (partition_id, file_ids) in id_map {
        if manifest.partitions.contains_key(partition_id) {
            continue;
        }
        for file_id in file_ids {
            tracing::info!(
                partition_id,
                file_id,
                "table file not referenced in manifest, removing"
            );
            let path = new_filename(*partition_id, *file_id, dir);
            fs::remove_file(&path).map_err(|e| {
                crate::errdata!(
                    "failed to remove excess table file {partition_id}/{file_id}: {e}"
                )
            })?;
        }
    }

    Ok(())
}

impl std::fmt::Debug for LevelsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelsController").finish_non_exhaustive()
    }
}

impl LevelsController {
    /// Builds the controller from the replayed manifest, opening every
    /// referenced table.
    pub fn new(
        options: &Options,
        manifest_image: &Manifest,
        manifest: Arc<ManifestFile>,
        registry: Arc<KeyRegistry>,
    ) -> Result<LevelsController> {
        let controller = LevelsController {
            options: options.clone(),
            partitions: RwLock::new(HashMap::new()),
            manifest,
            registry,
        };
        controller.partition(0);

        if options.in_memory {
            return Ok(controller);
        }

        let id_map = get_file_id_map(&options.dir)?;
        revert_to_manifest(&options.dir, manifest_image, &id_map)?;

        // Open every referenced table, a few at a time.
        struct OpenSpec {
            partition_id: PartitionId,
            file_id: u64,
            level: u8,
            key_id: u64,
        }
        let mut specs = Vec::new();
        for (&partition_id, partition) in &manifest_image.partitions {
            for (&file_id, table) in &partition.tables {
                specs.push(OpenSpec {
                    partition_id,
                    file_id,
                    level: table.level,
                    key_id: table.key_id,
                });
            }
        }

        let throttle = Throttle::new(TABLE_OPEN_WORKERS);
        let opened_count = AtomicU32::new(0);
        let start = Instant::now();
        let (sender, receiver) = std::sync::mpsc::channel::<(PartitionId, u8, Arc<Table>)>();

        let registry = &controller.registry;
        let dir = &options.dir;
        std::thread::scope(|scope| -> Result<()> {
            for spec in &specs {
                throttle.acquire()?;
                let sender = sender.clone();
                let opened_count = &opened_count;
                let throttle = &throttle;
                scope.spawn(move || {
                    let result = (|| -> Result<()> {
                        let data_key = registry.data_key(spec.partition_id, spec.key_id)?;
                        let path = new_filename(spec.partition_id, spec.file_id, dir);
                        match Table::open(&path, data_key.as_ref()) {
                            Ok(table) => {
                                opened_count.fetch_add(1, Ordering::SeqCst);
                                let _ = sender.send((spec.partition_id, spec.level, Arc::new(table)));
                                Ok(())
                            }
                            Err(crate::Error::InvalidData(msg))
                                if msg.starts_with("CHECKSUM_MISMATCH") =>
                            {
                                // Skip the table; its manifest entry stays.
                                tracing::error!(%msg, "ignoring table {:?}", path);
                                Ok(())
                            }
                            Err(e) => Err(crate::errdata!("opening table {:?}: {e}", path)),
                        }
                    })();
                    throttle.done(result);
                });
            }
            Ok(())
        })?;
        throttle.finish()?;
        drop(sender);

        tracing::info!(
            tables = opened_count.load(Ordering::SeqCst),
            elapsed = ?start.elapsed(),
            "all tables opened"
        );

        let mut by_partition_level: HashMap<PartitionId, HashMap<u8, Vec<Arc<Table>>>> =
            HashMap::new();
        for (partition_id, level, table) in receiver {
            by_partition_level
                .entry(partition_id)
                .or_default()
                .entry(level)
                .or_default()
                .push(table);
        }

        for (&partition_id, partition_manifest) in &manifest_image.partitions {
            let partition = controller.partition(partition_id);
            let max_file_id = partition_manifest.tables.keys().copied().max().unwrap_or(0);
            partition.next_file_id.store(max_file_id + 1, Ordering::SeqCst);

            if let Some(levels) = by_partition_level.remove(&partition_id) {
                for (level, tables) in levels {
                    partition.levels[level as usize].init_tables(tables);
                }
            }
        }

        // Make sure no key ranges overlap where they are not supposed to.
        if let Err(e) = controller.validate() {
            let _ = controller.close();
            return Err(crate::errdata!("failed to validate levels: {e}"));
        }

        sync_dir(&options.dir)?;
        Ok(controller)
    }

    /// Returns the partition's levels, creating them on first touch.
    pub fn partition(&self, partition_id: PartitionId) -> Arc<PartitionLevels> {
        if let Some(partition) = self.partitions.read().unwrap().get(&partition_id) {
            return Arc::clone(partition);
        }

        let mut partitions = self.partitions.write().unwrap();
        Arc::clone(partitions.entry(partition_id).or_insert_with(|| {
            let max_levels = self.options.max_levels;
            let mut levels = Vec::with_capacity(max_levels);
            let mut max_size = 0u64;
            for i in 0..max_levels {
                max_size = match i {
                    0 => 0,
                    1 => self.options.level_one_size,
                    _ => max_size * self.options.level_size_multiplier,
                };
                levels.push(Arc::new(LevelHandler::new(i as u8, max_size)));
            }
            Arc::new(PartitionLevels {
                next_file_id: AtomicU64::new(0),
                levels,
                compact_status: Mutex::new(CompactStatus::new(max_levels)),
            })
        }))
    }

    /// Known partitions at this moment.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.read().unwrap().keys().copied().collect()
    }

    /// Resolves a timestamped key through the partition's levels, top
    /// down. Lower levels hold older data, so the first hit wins.
    pub fn get(&self, partition_id: PartitionId, key: &[u8]) -> Result<Option<ValueStruct>> {
        let partition = match self.partitions.read().unwrap().get(&partition_id) {
            Some(partition) => Arc::clone(partition),
            None => return Ok(None),
        };
        for level in &partition.levels {
            if let Some(found) = level.get(key)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Highest commit timestamp stored in any table.
    pub fn max_version(&self) -> u64 {
        let partitions = self.partitions.read().unwrap();
        partitions
            .values()
            .flat_map(|p| p.levels.iter())
            .flat_map(|l| l.tables())
            .map(|t| t.max_version())
            .max()
            .unwrap_or(0)
    }

    /// Records the new level-zero table in the manifest and attaches it,
    /// stalling while level zero is congested.
    pub async fn add_l0_table(
        &self,
        partition_id: PartitionId,
        table: Arc<Table>,
    ) -> Result<()> {
        self.manifest.add_changes(vec![ManifestChange::new_create(
            partition_id,
            table.file_id(),
            0,
            table.key_id(),
            CompressionType::None,
        )])?;

        let partition = self.partition(partition_id);
        let l0 = &partition.levels[0];
        if l0.num_tables() >= self.options.num_level_zero_tables_stall {
            let since = Instant::now();
            tracing::warn!(partition_id, "level zero full, stalling writes");
            while l0.num_tables() >= self.options.num_level_zero_tables {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tracing::info!(
                partition_id,
                stalled = ?since.elapsed(),
                "level zero unstalled"
            );
        }
        l0.add_l0_table(table);
        Ok(())
    }

    /// Scores every level of every partition and returns the compactions
    /// worth running, highest score first.
    pub fn pick_compaction_levels(&self) -> Vec<CompactionPriority> {
        let partitions: Vec<(PartitionId, Arc<PartitionLevels>)> = {
            let guard = self.partitions.read().unwrap();
            guard.iter().map(|(&id, p)| (id, Arc::clone(p))).collect()
        };

        let mut priorities = Vec::new();
        for (partition_id, partition) in partitions {
            let l0_score = partition.levels[0].num_tables() as f64
                / self.options.num_level_zero_tables as f64;
            if l0_score >= 1.0 {
                priorities.push(CompactionPriority {
                    partition_id,
                    level: 0,
                    score: l0_score,
                    drop_prefix: None,
                });
            }

            let status = partition.compact_status.lock().unwrap();
            for i in 1..self.options.max_levels {
                let level = &partition.levels[i];
                let size = level.total_size().saturating_sub(status.delete_size(i));
                let score = size as f64 / level.max_total_size() as f64;
                if score < 1.0 {
                    continue;
                }
                // The last level compacts into itself, which only helps
                // when a table still holds shadowed versions to reclaim.
                if i + 1 == self.options.max_levels
                    && !level.tables().iter().any(|t| t.has_stale_versions())
                {
                    continue;
                }
                priorities.push(CompactionPriority {
                    partition_id,
                    level: i,
                    score,
                    drop_prefix: None,
                });
            }
        }

        priorities.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        priorities
    }

    /// Runs one compaction pass: tries priorities in order until one
    /// executes.
    pub async fn run_compaction(&self) -> Result<()> {
        for priority in self.pick_compaction_levels() {
            match self.do_compact(&priority).await {
                Ok(true) => break,
                Ok(false) => continue, // Range collision, try the next one.
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Executes one compaction priority. Returns false when its key ranges
    /// collide with an in-flight compaction.
    pub async fn do_compact(&self, priority: &CompactionPriority) -> Result<bool> {
        let partition = self.partition(priority.partition_id);
        let cd = if priority.level == 0 {
            self.fill_tables_l0(priority, &partition)
        } else if priority.level + 1 == self.options.max_levels {
            self.fill_tables_last_level(priority, &partition)
        } else {
            self.fill_tables(priority, &partition)
        };
        let cd = match cd {
            Some(cd) => cd,
            None => return Ok(false),
        };

        let result = self.run_compact_def(&partition, &cd);
        partition.compact_status.lock().unwrap().delete(&cd);
        result?;
        tracing::info!(
            partition_id = priority.partition_id,
            from_level = cd.this_level,
            to_level = cd.next_level,
            tables_in = cd.top.len() + cd.bot.len(),
            "compaction done"
        );
        Ok(true)
    }

    /// Plans a level-zero compaction: all of level zero merges into the
    /// overlapping span of level one.
    fn fill_tables_l0(
        &self,
        priority: &CompactionPriority,
        partition: &PartitionLevels,
    ) -> Option<CompactDef> {
        let top = partition.levels[0].tables();
        if top.is_empty() {
            return None;
        }
        if let Some(prefix) = &priority.drop_prefix {
            if !top.iter().any(|t| t.contains_prefix(prefix)) {
                return None;
            }
        }

        let next_level = 1usize;
        let top_range = key_range_of(&top);
        let (lo, hi) = partition.levels[next_level].overlapping_tables(&top_range);
        let bot: Vec<Arc<Table>> = partition.levels[next_level].tables()[lo..hi].to_vec();
        let next_range = if bot.is_empty() {
            top_range
        } else {
            key_range_of(&bot)
        };

        let cd = CompactDef {
            partition_id: priority.partition_id,
            this_level: 0,
            next_level,
            top,
            bot,
            // Level-zero tables overlap arbitrarily, reserve everything.
            this_range: KeyRange::infinite(),
            next_range,
            drop_prefix: priority.drop_prefix.clone(),
        };
        partition
            .compact_status
            .lock()
            .unwrap()
            .compare_and_add(&cd)
            .then_some(cd)
    }

    /// Plans a compaction from `priority.level` down one level, picking
    /// the largest table whose ranges are free.
    fn fill_tables(
        &self,
        priority: &CompactionPriority,
        partition: &PartitionLevels,
    ) -> Option<CompactDef> {
        let this_level = priority.level;
        let next_level = this_level + 1;
        let mut tables = partition.levels[this_level].tables();
        if tables.is_empty() {
            return None;
        }
        tables.sort_by_key(|t| std::cmp::Reverse(t.size()));

        for table in tables {
            // A prefix sweep only rewrites tables actually carrying it.
            if let Some(prefix) = &priority.drop_prefix {
                if !table.contains_prefix(prefix) {
                    continue;
                }
            }
            let this_range = KeyRange::new(table.smallest().to_vec(), table.biggest().to_vec());
            let (lo, hi) = partition.levels[next_level].overlapping_tables(&this_range);
            let bot: Vec<Arc<Table>> = partition.levels[next_level].tables()[lo..hi].to_vec();
            let next_range = if bot.is_empty() {
                this_range.clone()
            } else {
                key_range_of(&bot)
            };

            let cd = CompactDef {
                partition_id: priority.partition_id,
                this_level,
                next_level,
                top: vec![table],
                bot,
                this_range,
                next_range,
                drop_prefix: priority.drop_prefix.clone(),
            };
            if partition
                .compact_status
                .lock()
                .unwrap()
                .compare_and_add(&cd)
            {
                return Some(cd);
            }
        }
        None
    }

    /// Plans a last-level compaction: the level compacts into itself,
    /// rewriting one table to shed shadowed versions (and, during a prefix
    /// sweep, matching keys). Nothing below holds older data, so only the
    /// newest version of each user key needs to survive.
    fn fill_tables_last_level(
        &self,
        priority: &CompactionPriority,
        partition: &PartitionLevels,
    ) -> Option<CompactDef> {
        let this_level = priority.level;
        let mut tables = partition.levels[this_level].tables();
        if tables.is_empty() {
            return None;
        }
        tables.sort_by_key(|t| std::cmp::Reverse(t.size()));

        for table in tables {
            let worth_rewriting = match &priority.drop_prefix {
                Some(prefix) => table.contains_prefix(prefix),
                None => table.has_stale_versions(),
            };
            if !worth_rewriting {
                continue;
            }
            let this_range = KeyRange::new(table.smallest().to_vec(), table.biggest().to_vec());
            let cd = CompactDef {
                partition_id: priority.partition_id,
                this_level,
                next_level: this_level,
                top: vec![table],
                bot: Vec::new(),
                this_range: this_range.clone(),
                next_range: this_range,
                drop_prefix: priority.drop_prefix.clone(),
            };
            if partition
                .compact_status
                .lock()
                .unwrap()
                .compare_and_add(&cd)
            {
                return Some(cd);
            }
        }
        None
    }

    /// Merges the planned tables, writes the result to the target level
    /// and commits the swap through the manifest.
    fn run_compact_def(&self, partition: &PartitionLevels, cd: &CompactDef) -> Result<()> {
        let new_tables = self.compact_build_tables(partition, cd)?;

        let mut changes = Vec::with_capacity(new_tables.len() + cd.top.len() + cd.bot.len());
        for table in &new_tables {
            changes.push(ManifestChange::new_create(
                cd.partition_id,
                table.file_id(),
                cd.next_level as u8,
                table.key_id(),
                CompressionType::None,
            ));
        }
        for table in cd.top.iter().chain(cd.bot.iter()) {
            changes.push(ManifestChange::new_delete(cd.partition_id, table.file_id()));
        }
        self.manifest.add_changes(changes)?;

        partition.levels[cd.next_level].replace_tables(&cd.bot, new_tables);
        partition.levels[cd.this_level].delete_tables(&cd.top);

        // The manifest no longer references the inputs; their files can go.
        for table in cd.top.iter().chain(cd.bot.iter()) {
            if let Err(e) = fs::remove_file(table.path()) {
                tracing::warn!(path = ?table.path(), error = %e, "failed to remove compacted table");
            }
        }
        sync_dir(&self.options.dir)?;

        partition.levels[cd.next_level].validate()?;
        Ok(())
    }

    /// Merge-sorts the input tables into new target-level tables split at
    /// the table size budget.
    fn compact_build_tables(
        &self,
        partition: &PartitionLevels,
        cd: &CompactDef,
    ) -> Result<Vec<Arc<Table>>> {
        // Sources ordered newest first: within level zero the highest file
        // id is newest; the target level is always older than the source.
        let mut sources = Vec::with_capacity(cd.top.len() + cd.bot.len());
        if cd.this_level == 0 {
            for table in cd.top.iter().rev() {
                sources.push(table.iter());
            }
        } else {
            for table in &cd.top {
                sources.push(table.iter());
            }
        }
        for table in &cd.bot {
            sources.push(table.iter());
        }

        let data_key = self.registry.latest_data_key(cd.partition_id)?;
        let mut merge = MergeIterator::new(sources);
        let mut out = Vec::new();
        let mut builder = Builder::new();

        // When the level compacts into itself it is the bottom of the
        // tree: older versions of a user key have nowhere else to live and
        // can be dropped after the newest one.
        let keep_newest_only = cd.this_level == cd.next_level;
        let mut prev_user_key: Option<Vec<u8>> = None;

        while let Some((key, value)) = merge.next_entry() {
            let user_key = crate::keys::parse_key(&key);
            if let Some(prefix) = &cd.drop_prefix {
                if user_key.starts_with(prefix) {
                    continue;
                }
            }
            if keep_newest_only {
                if prev_user_key.as_deref() == Some(user_key) {
                    continue;
                }
                prev_user_key = Some(user_key.to_vec());
            }
            if builder.estimated_size() >= self.options.max_table_size && !builder.is_empty() {
                let done = std::mem::take(&mut builder);
                out.push(self.finish_table(partition, cd, done, data_key.as_ref())?);
            }
            builder.add(&key, &value);
        }
        if !builder.is_empty() {
            out.push(self.finish_table(partition, cd, builder, data_key.as_ref())?);
        }
        Ok(out)
    }

    fn finish_table(
        &self,
        partition: &PartitionLevels,
        cd: &CompactDef,
        builder: Builder,
        data_key: Option<&crate::registry::DataKey>,
    ) -> Result<Arc<Table>> {
        let file_id = partition.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = new_filename(cd.partition_id, file_id, &self.options.dir);
        Ok(Arc::new(builder.finish(&path, data_key)?))
    }

    /// Drops every key of the partition starting with `prefix` by sweeping
    /// the levels top down with prefix-carrying compactions. Keys still in
    /// the memtables must have been flushed by the caller first.
    pub async fn drop_prefix(&self, partition_id: PartitionId, prefix: &[u8]) -> Result<()> {
        let partition = self.partition(partition_id);
        for level in 0..self.options.max_levels {
            loop {
                let priority = CompactionPriority {
                    partition_id,
                    level,
                    score: f64::MAX,
                    drop_prefix: Some(prefix.to_vec()),
                };
                if self.do_compact(&priority).await? {
                    if level == 0 {
                        break; // One pass takes all of level zero.
                    }
                    continue;
                }
                // Nothing ran: done with this level, unless a colliding
                // background compaction held the range.
                let still_present = partition.levels[level]
                    .tables()
                    .iter()
                    .any(|t| t.contains_prefix(prefix));
                if !still_present {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        tracing::info!(partition_id, "dropped prefix from all levels");
        Ok(())
    }

    /// Compacts level zero down until it is empty or no compaction can
    /// run; used on close when `compact_l0_on_close` is set.
    pub async fn compact_l0(&self) -> Result<()> {
        for partition_id in self.partition_ids() {
            loop {
                let partition = self.partition(partition_id);
                if partition.levels[0].num_tables() == 0 {
                    break;
                }
                let priority = CompactionPriority {
                    partition_id,
                    level: 0,
                    score: f64::MAX,
                    drop_prefix: None,
                };
                if !self.do_compact(&priority).await? {
                    break; // A colliding compaction holds the range.
                }
            }
        }
        Ok(())
    }

    /// Re-checks every level handler's ordering invariants.
    pub fn validate(&self) -> Result<()> {
        let partitions = self.partitions.read().unwrap();
        for partition in partitions.values() {
            for level in &partition.levels {
                level.validate()?;
            }
        }
        Ok(())
    }

    /// Closes every level handler; the first error wins.
    pub fn close(&self) -> Result<()> {
        let partitions = self.partitions.read().unwrap();
        let mut first_error = None;
        for partition in partitions.values() {
            for level in &partition.levels {
                if let Err(e) = level.close() {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
