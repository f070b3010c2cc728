//! The database: startup, the write and read paths, and shutdown.
//!
//! Startup acquires the directory locks, replays the manifest, opens the
//! key registry, reconciles the level controller against the file system,
//! opens the value log and replays it from the recovered head pointer, and
//! finally launches the background workers.
//!
//! Writes flow through a single channel: the writer task appends each
//! batch to the value log, applies the entries to the active skiplist of
//! their partition under one commit timestamp, and acknowledges the
//! caller. Sealed skiplists move through a flush queue into level-zero
//! tables. Reads resolve through the active skiplist, the sealed ones, and
//! then the partition's levels.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::flock::{sync_dir, DirLockGuard};
use crate::keys::{
    key_with_ts, Entry, ValuePointer, ValueStruct, META_VALUE_POINTER,
};
use crate::levels::LevelsController;
use crate::manifest::{Manifest, ManifestFile};
use crate::options::Options;
use crate::oracle::Oracle;
use crate::registry::{KeyRegistry, KeyRegistryOptions};
use crate::scheduler::Scheduler;
use crate::skiplist::{Skiplist, MAX_NODE_SIZE};
use crate::table::{new_filename, Builder};
use crate::tasks::{CompactionWorker, SizeTracker};
use crate::vlog::{ValueLog, VlogRecord};
use crate::PartitionId;

/// Reserved key the engine stores the latest durable value-log position
/// under. Its commit timestamp only ever grows.
pub const HEAD_KEY: &[u8] = b"!ember!head";

/// Capacity of the write channel, in request batches.
const WRITE_CHANNEL_CAPACITY: usize = 1000;

/// One batch travelling through the write channel.
struct Request {
    entries: Vec<Entry>,
    done: oneshot::Sender<Result<()>>,
}

/// A sealed skiplist waiting to become a level-zero table.
struct FlushTask {
    partition_id: PartitionId,
    skiplist: Skiplist,
}

/// The in-memory tables of one partition. The locks guard the pointer
/// swap on seal, not individual reads and writes.
struct PartitionMemtables {
    active: RwLock<Skiplist>,
    flushed: RwLock<Vec<Skiplist>>,
}

/// Directory sizes sampled by the size tracker.
#[derive(Default)]
pub struct DatabaseSize {
    pub lsm_size: AtomicU64,
    pub vlog_size: AtomicU64,
}

pub(crate) struct DbInner {
    pub(crate) options: Options,
    dir_lock: Mutex<Option<DirLockGuard>>,
    value_dir_lock: Mutex<Option<DirLockGuard>>,
    manifest: Arc<ManifestFile>,
    registry: Arc<KeyRegistry>,
    pub(crate) levels: Arc<LevelsController>,
    vlog: Option<Arc<ValueLog>>,
    oracle: Arc<Oracle>,
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionMemtables>>>,
    write_tx: Mutex<Option<mpsc::Sender<Request>>>,
    flush_tx: Mutex<Option<mpsc::Sender<FlushTask>>>,
    /// Latest value-log position that reached the write path.
    head: Mutex<ValuePointer>,
    pub(crate) size: DatabaseSize,
    closed: AtomicBool,
}

/// An embedded, partitioned LSM key/value store.
pub struct Db {
    inner: Arc<DbInner>,
    scheduler: Scheduler,
    writer: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database with the given options and launches
    /// its background workers. Must run inside a tokio runtime.
    pub async fn open(options: Options) -> Result<Db> {
        let options = options.finish()?;

        let (dir_lock, value_dir_lock) = if options.in_memory {
            (None, None)
        } else {
            create_dirs(&options)?;
            let dir_lock = DirLockGuard::acquire(&options.dir, options.read_only)?;
            let value_dir_lock = if same_path(&options.dir, &options.value_dir) {
                None
            } else {
                Some(DirLockGuard::acquire(&options.value_dir, options.read_only)?)
            };
            (Some(dir_lock), value_dir_lock)
        };

        let (manifest, manifest_image) = if options.in_memory {
            (ManifestFile::in_memory(), Manifest::new())
        } else {
            ManifestFile::open_or_create(&options.dir, options.read_only)?
        };
        let manifest = Arc::new(manifest);

        let registry = Arc::new(KeyRegistry::open(KeyRegistryOptions {
            directory: options.dir.clone(),
            read_only: options.read_only,
            in_memory: options.in_memory,
            encryption_key: options.encryption_key.clone(),
            encryption_key_rotation_duration: options.encryption_key_rotation_duration,
        })?);

        let levels = Arc::new(LevelsController::new(
            &options,
            &manifest_image,
            Arc::clone(&manifest),
            Arc::clone(&registry),
        )?);

        let vlog = if options.in_memory {
            None
        } else {
            Some(Arc::new(ValueLog::open(
                &options.value_dir,
                options.value_log_file_size,
                options.sync_writes,
                options.read_only,
            )?))
        };

        let inner = Arc::new(DbInner {
            options,
            dir_lock: Mutex::new(dir_lock),
            value_dir_lock: Mutex::new(value_dir_lock),
            manifest,
            registry,
            levels,
            vlog,
            oracle: Arc::new(Oracle::new(1)),
            partitions: RwLock::new(HashMap::new()),
            write_tx: Mutex::new(None),
            flush_tx: Mutex::new(None),
            head: Mutex::new(ValuePointer::default()),
            size: DatabaseSize::default(),
            closed: AtomicBool::new(false),
        });

        // Rebuild the in-memory tables from the value log and pick the
        // next commit timestamp after everything recovered.
        let mut max_version = inner.levels.max_version();
        let mut pending_flushes = Vec::new();
        if let Some(vlog) = &inner.vlog {
            let head = inner.recover_head()?;
            *inner.head.lock()? = head;
            let inner_ref = &inner;
            let pending = &mut pending_flushes;
            vlog.replay(head, |entry, pointer| {
                max_version = max_version.max(crate::keys::parse_ts(&entry.key));
                inner_ref.apply_replayed(entry, pointer, pending)
            })?;
        }
        inner.oracle.set_next_ts(max_version + 1);

        let scheduler = Scheduler::new();
        scheduler.adopt(inner.oracle.read_mark.process(scheduler.subscribe_shutdown()));
        scheduler.adopt(inner.oracle.txn_mark.process(scheduler.subscribe_shutdown()));

        let db = Db {
            inner: Arc::clone(&inner),
            scheduler,
            writer: Mutex::new(None),
            flusher: Mutex::new(None),
        };

        if !inner.options.read_only {
            let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
            *inner.write_tx.lock()? = Some(write_tx);
            *db.writer.lock()? = Some(tokio::spawn(writer_loop(Arc::clone(&inner), write_rx)));

            // In-memory databases never flush: sealed skiplists simply
            // accumulate and stay readable.
            if !inner.options.in_memory {
                let (flush_tx, flush_rx) =
                    mpsc::channel(inner.options.num_memory_tables.max(1));
                *inner.flush_tx.lock()? = Some(flush_tx);
                *db.flusher.lock()? =
                    Some(tokio::spawn(flush_loop(Arc::clone(&inner), flush_rx)));

                for task in pending_flushes {
                    inner.send_flush(task).await?;
                }

                for _ in 0..inner.options.num_compactors {
                    db.scheduler
                        .register(Arc::new(CompactionWorker::new(Arc::clone(&inner.levels))));
                }
                db.scheduler
                    .register(Arc::new(SizeTracker::new(Arc::clone(&inner))));
            }
        }

        Ok(db)
    }

    /// Writes a batch of entries atomically under one commit timestamp.
    pub async fn write(&self, entries: Vec<Entry>) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(crate::errdata!("database closed"));
        }
        if entries.len() as u64 > inner.options.max_batch_count {
            return Err(crate::errdata!("batch too big: {} entries", entries.len()));
        }
        let size: u64 = entries
            .iter()
            .map(|e| e.estimate_size(inner.options.value_threshold))
            .sum();
        if size > inner.options.max_batch_size {
            return Err(crate::errdata!("batch too big: {size} bytes"));
        }

        let sender = match inner.write_tx.lock()?.clone() {
            Some(sender) => sender,
            None => return Err(crate::errdata!("database is read-only")),
        };

        let (done, receiver) = oneshot::channel();
        sender
            .send(Request { entries, done })
            .await
            .map_err(|_| crate::errdata!("write channel closed"))?;
        receiver
            .await
            .map_err(|_| crate::errdata!("write dropped during shutdown"))?
    }

    /// Writes one key/value pair.
    pub async fn put(
        &self,
        partition_id: PartitionId,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<()> {
        self.write(vec![Entry::new(partition_id, key, value)]).await
    }

    /// Reads the newest committed version of a key.
    pub async fn get(
        &self,
        partition_id: PartitionId,
        key: &[u8],
    ) -> Result<Option<ValueStruct>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(crate::errdata!("database closed"));
        }

        let read_ts = inner.oracle.read_ts();
        inner.oracle.wait_for_ts(read_ts).await;
        inner.oracle.read_mark.begin(read_ts);
        let result = inner.get_at(partition_id, key, read_ts);
        inner.oracle.read_mark.done(read_ts);
        result
    }

    /// Removes every key of the partition that starts with `prefix`.
    ///
    /// The partition's in-memory tables are flushed first so the sweep
    /// covers all data, then every level is compacted with the prefix
    /// dropped during the merge. Writes racing this call are not
    /// linearized against it.
    pub async fn drop_prefix(&self, partition_id: PartitionId, prefix: &[u8]) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(crate::errdata!("database closed"));
        }
        if inner.options.read_only {
            return Err(crate::errdata!("database is read-only"));
        }
        if inner.options.in_memory {
            return Err(crate::errdata!(
                "cannot drop a prefix from an in-memory database"
            ));
        }

        // Push the partition's in-memory data down to level zero.
        let memtables = inner.memtables(partition_id);
        let has_data = !memtables.active.read()?.is_empty();
        if has_data {
            let sealed = inner.seal_active(&memtables)?;
            inner
                .send_flush(FlushTask {
                    partition_id,
                    skiplist: sealed,
                })
                .await?;
        }
        while !memtables.flushed.read()?.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        inner.levels.drop_prefix(partition_id, prefix).await
    }

    /// Current directory sizes as sampled by the size tracker.
    pub fn size(&self) -> (u64, u64) {
        (
            self.inner.size.lsm_size.load(Ordering::SeqCst),
            self.inner.size.vlog_size.load(Ordering::SeqCst),
        )
    }

    /// Flushes remaining work and closes everything. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Stop the writer first so no new entries arrive.
        inner.write_tx.lock()?.take();
        if let Some(writer) = self.writer.lock()?.take() {
            writer.await?;
        }

        // Seal and flush whatever the memtables still hold.
        if !inner.options.read_only && !inner.options.in_memory {
            let partitions: Vec<(PartitionId, Arc<PartitionMemtables>)> = {
                let guard = inner.partitions.read()?;
                guard.iter().map(|(&id, p)| (id, Arc::clone(p))).collect()
            };
            for (partition_id, memtables) in partitions {
                let sealed = {
                    let mut active = memtables.active.write()?;
                    if active.is_empty() {
                        continue;
                    }
                    let replacement = Skiplist::new(inner.arena_size());
                    std::mem::replace(&mut *active, replacement)
                };
                memtables.flushed.write()?.push(sealed.clone());
                inner
                    .send_flush(FlushTask {
                        partition_id,
                        skiplist: sealed,
                    })
                    .await?;
            }
        }

        // Close the flush queue and wait for it to drain.
        inner.flush_tx.lock()?.take();
        if let Some(flusher) = self.flusher.lock()?.take() {
            flusher.await?;
        }

        if inner.options.compact_l0_on_close {
            if let Err(e) = inner.levels.compact_l0().await {
                tracing::error!(error = %e, "compacting level zero on close failed");
            }
        }

        self.scheduler.shutdown().await?;

        inner.levels.close()?;
        if let Some(vlog) = &inner.vlog {
            vlog.close()?;
        }
        inner.manifest.close()?;
        inner.registry.close()?;

        if let Some(guard) = inner.value_dir_lock.lock()?.take() {
            guard.release()?;
        }
        if let Some(guard) = inner.dir_lock.lock()?.take() {
            guard.release()?;
        }
        Ok(())
    }
}

impl DbInner {
    /// Arena size for a fresh skiplist: the table budget plus headroom for
    /// one full write batch.
    fn arena_size(&self) -> u32 {
        let size = self.options.max_table_size
            + self.options.max_batch_size
            + self.options.max_batch_count * MAX_NODE_SIZE as u64;
        size.min(u32::MAX as u64) as u32
    }

    fn memtables(&self, partition_id: PartitionId) -> Arc<PartitionMemtables> {
        if let Some(memtables) = self.partitions.read().unwrap().get(&partition_id) {
            return Arc::clone(memtables);
        }
        let mut partitions = self.partitions.write().unwrap();
        Arc::clone(partitions.entry(partition_id).or_insert_with(|| {
            // Make sure the level hierarchy exists alongside.
            self.levels.partition(partition_id);
            Arc::new(PartitionMemtables {
                active: RwLock::new(Skiplist::new(self.arena_size())),
                flushed: RwLock::new(Vec::new()),
            })
        }))
    }

    /// Reads the persisted head pointers and returns the highest one.
    fn recover_head(&self) -> Result<ValuePointer> {
        let seek = key_with_ts(HEAD_KEY, u64::MAX);
        let mut head = ValuePointer::default();
        for partition_id in self.levels.partition_ids() {
            if let Some(found) = self.levels.get(partition_id, &seek)? {
                if found.value.len() == crate::keys::VALUE_POINTER_SIZE {
                    let pointer = ValuePointer::decode(&found.value);
                    if (pointer.file_id, pointer.offset) > (head.file_id, head.offset) {
                        head = pointer;
                    }
                }
            }
        }
        Ok(head)
    }

    /// Re-applies one replayed value-log entry to its partition's
    /// memtable, sealing full skiplists into the pending flush list.
    fn apply_replayed(
        &self,
        entry: crate::vlog::VlogEntry,
        pointer: ValuePointer,
        pending: &mut Vec<FlushTask>,
    ) -> Result<()> {
        let memtables = self.memtables(entry.partition_id);

        if self.memtable_full(&memtables) {
            let sealed = self.seal_active(&memtables)?;
            pending.push(FlushTask {
                partition_id: entry.partition_id,
                skiplist: sealed,
            });
        }

        let value = if entry.value.len() >= self.options.value_threshold {
            ValueStruct {
                meta: entry.meta | META_VALUE_POINTER,
                user_meta: entry.user_meta,
                expires_at: entry.expires_at,
                value: pointer.encode().to_vec(),
                version: 0,
            }
        } else {
            ValueStruct {
                meta: entry.meta & !META_VALUE_POINTER,
                user_meta: entry.user_meta,
                expires_at: entry.expires_at,
                value: entry.value,
                version: 0,
            }
        };
        memtables.active.read().unwrap().put(&entry.key, value);
        *self.head.lock().unwrap() = pointer;
        Ok(())
    }

    fn memtable_full(&self, memtables: &PartitionMemtables) -> bool {
        memtables.active.read().unwrap().mem_size() as u64 >= self.options.max_table_size
    }

    /// Swaps in a fresh active skiplist, returning the sealed one.
    fn seal_active(&self, memtables: &PartitionMemtables) -> Result<Skiplist> {
        let sealed = {
            let mut active = memtables.active.write()?;
            let replacement = Skiplist::new(self.arena_size());
            std::mem::replace(&mut *active, replacement)
        };
        memtables.flushed.write()?.push(sealed.clone());
        Ok(sealed)
    }

    async fn send_flush(&self, task: FlushTask) -> Result<()> {
        let sender = match self.flush_tx.lock()?.clone() {
            Some(sender) => sender,
            None => return Ok(()), // In-memory: sealed lists just accumulate.
        };
        sender
            .send(task)
            .await
            .map_err(|_| crate::errdata!("flush channel closed"))
    }

    /// Applies one request batch: value log first, then the skiplists.
    async fn apply_request(&self, request: &mut Request) -> Result<()> {
        let ts = self.oracle.next_commit_ts();
        let result = self.write_entries(&request.entries, ts).await;
        self.oracle.done_commit(ts);
        result
    }

    async fn write_entries(&self, entries: &[Entry], ts: u64) -> Result<()> {
        for entry in entries {
            let key = key_with_ts(&entry.key, ts);

            // Every entry is appended to the value log for durability; the
            // returned pointer becomes the new head.
            let pointer = match &self.vlog {
                Some(vlog) => {
                    let pointer = vlog.append(&VlogRecord {
                        partition_id: entry.partition_id,
                        key: &key,
                        value: &entry.value,
                        meta: entry.meta,
                        user_meta: entry.user_meta,
                        expires_at: entry.expires_at,
                    })?;
                    *self.head.lock()? = pointer;
                    Some(pointer)
                }
                None => None,
            };

            let value = match pointer {
                Some(pointer) if entry.value.len() >= self.options.value_threshold => {
                    ValueStruct {
                        meta: entry.meta | META_VALUE_POINTER,
                        user_meta: entry.user_meta,
                        expires_at: entry.expires_at,
                        value: pointer.encode().to_vec(),
                        version: 0,
                    }
                }
                _ => ValueStruct {
                    meta: entry.meta & !META_VALUE_POINTER,
                    user_meta: entry.user_meta,
                    expires_at: entry.expires_at,
                    value: entry.value.clone(),
                    version: 0,
                },
            };

            let memtables = self.memtables(entry.partition_id);
            if self.memtable_full(&memtables) {
                let sealed = self.seal_active(&memtables)?;
                self.send_flush(FlushTask {
                    partition_id: entry.partition_id,
                    skiplist: sealed,
                })
                .await?;
            }
            memtables.active.read()?.put(&key, value);
        }
        Ok(())
    }

    /// Resolves a key at a fixed read timestamp.
    fn get_at(
        &self,
        partition_id: PartitionId,
        key: &[u8],
        read_ts: u64,
    ) -> Result<Option<ValueStruct>> {
        let seek = key_with_ts(key, read_ts);

        let found = 'search: {
            if let Some(memtables) = self.partitions.read()?.get(&partition_id) {
                if let Some(found) = memtables.active.read()?.get(&seek) {
                    break 'search Some(found);
                }
                let flushed = memtables.flushed.read()?;
                for skiplist in flushed.iter().rev() {
                    if let Some(found) = skiplist.get(&seek) {
                        break 'search Some(found);
                    }
                }
            }
            self.levels.get(partition_id, &seek)?
        };

        match found {
            Some(value) if value.meta & META_VALUE_POINTER != 0 => {
                let vlog = self
                    .vlog
                    .as_ref()
                    .ok_or_else(|| crate::errdata!("value pointer without a value log"))?;
                let pointer = ValuePointer::decode(&value.value);
                let record = vlog.read(pointer)?;
                Ok(Some(ValueStruct {
                    meta: value.meta & !META_VALUE_POINTER,
                    user_meta: value.user_meta,
                    expires_at: value.expires_at,
                    value: record.value,
                    version: value.version,
                }))
            }
            other => Ok(other),
        }
    }

    /// Builds a level-zero table from a sealed skiplist and retires it.
    async fn flush_one(&self, task: FlushTask) -> Result<()> {
        if !task.skiplist.is_empty() {
            // Persist the head pointer inside the flushed table so crash
            // recovery knows where value-log replay may start.
            let head_ts = self.oracle.next_commit_ts();
            self.oracle.done_commit(head_ts);
            let head = *self.head.lock()?;
            task.skiplist.put(
                &key_with_ts(HEAD_KEY, head_ts),
                ValueStruct {
                    value: head.encode().to_vec(),
                    ..Default::default()
                },
            );

            let mut builder = Builder::new();
            {
                let mut iter = task.skiplist.iter();
                iter.seek_to_first();
                while iter.valid() {
                    builder.add(iter.key(), &iter.value());
                    iter.next();
                }
            }

            let partition = self.levels.partition(task.partition_id);
            let file_id = partition.next_file_id.fetch_add(1, Ordering::SeqCst);
            let path = new_filename(task.partition_id, file_id, &self.options.dir);
            let data_key = self.registry.latest_data_key(task.partition_id)?;
            let table = Arc::new(builder.finish(&path, data_key.as_ref())?);
            sync_dir(&self.options.dir)?;

            self.levels.add_l0_table(task.partition_id, table).await?;
            tracing::debug!(
                partition_id = task.partition_id,
                file_id,
                "flushed memtable to level zero"
            );
        }

        // Drop the sealed list; its arena goes with the last reference.
        if let Some(memtables) = self.partitions.read()?.get(&task.partition_id) {
            memtables
                .flushed
                .write()?
                .retain(|s| !s.same_as(&task.skiplist));
        }
        Ok(())
    }
}

async fn writer_loop(inner: Arc<DbInner>, mut receiver: mpsc::Receiver<Request>) {
    while let Some(mut request) = receiver.recv().await {
        let result = inner.apply_request(&mut request).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "write batch failed");
        }
        let _ = request.done.send(result);
    }
}

async fn flush_loop(inner: Arc<DbInner>, mut receiver: mpsc::Receiver<FlushTask>) {
    while let Some(task) = receiver.recv().await {
        if let Err(e) = inner.flush_one(task).await {
            tracing::error!(error = %e, "memtable flush failed");
        }
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn create_dirs(options: &Options) -> Result<()> {
    for path in [&options.dir, &options.value_dir] {
        if !path.exists() {
            if options.read_only {
                return Err(Error::Io(format!(
                    "cannot find directory {path:?} for read-only open"
                )));
            }
            std::fs::create_dir_all(path)
                .map_err(|e| Error::Io(format!("error creating dir {path:?}: {e}")))?;
        }
    }
    Ok(())
}

impl Drop for Db {
    fn drop(&mut self) {
        // Locks release with their guards; a clean close does this earlier.
        if let Ok(mut guard) = self.inner.value_dir_lock.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.inner.dir_lock.lock() {
            guard.take();
        }
    }
}
