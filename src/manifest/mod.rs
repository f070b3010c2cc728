//! The manifest: a replayable append-only log of atomic change sets that
//! fully describes which tables exist at which level in which partition.
//!
//! # File format
//!
//! ```text
//! +-------------------------------+
//! | "!Bgr"  | version (u32 BE)    |   8 byte header
//! +-------------------------------+
//! | len u32 BE | xxh32 u32 BE     |
//! | change set payload            |   repeated records
//! +-------------------------------+
//! ```
//!
//! The payload is a [`ManifestChangeSet`](change::ManifestChangeSet). A
//! truncated trailing record is treated as end of file and cut off on the
//! next read-write open. The file is periodically rewritten from the live
//! table set once deletions dominate.

pub mod change;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::flock::sync_dir;
use crate::hasher::checksum32;
use crate::options::CompressionType;
use crate::PartitionId;

use change::{ManifestChange, ManifestChangeSet, Operation};

/// Filename of the current manifest.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

/// Staging filename used while rewriting the manifest.
pub const MANIFEST_REWRITE_FILENAME: &str = "MANIFEST-REWRITE";

/// Magic prefix identifying a manifest file.
const MAGIC_TEXT: &[u8; 4] = b"!Bgr";

/// Format version written after the magic.
const MANIFEST_VERSION: u32 = 0x01092017;

/// Absolute deletion count required before a rewrite is considered.
pub const DELETIONS_REWRITE_THRESHOLD: usize = 10_000;

/// A rewrite additionally requires deletions to outnumber live tables by
/// this ratio.
const DELETIONS_RATIO: usize = 10;

/// Metadata the manifest tracks for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableManifest {
    pub level: u8,
    pub key_id: u64,
    pub compression: CompressionType,
}

/// Per-level set of table ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelManifest {
    pub tables: HashSet<u64>,
}

/// All tables of one partition, indexed both by level and by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionManifest {
    pub levels: Vec<LevelManifest>,
    pub tables: HashMap<u64, TableManifest>,
}

/// In-memory image of the manifest file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub partitions: HashMap<PartitionId, PartitionManifest>,

    /// Running totals used to decide when a rewrite pays off.
    pub creations: usize,
    pub deletions: usize,
    pub total_tables: usize,
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest::default()
    }

    /// Returns a change sequence that recreates the manifest in its present
    /// state when applied to an empty one.
    pub fn as_changes(&self) -> Vec<ManifestChange> {
        let mut changes = Vec::with_capacity(self.total_tables);
        for (&partition_id, partition) in &self.partitions {
            for (&table_id, table) in &partition.tables {
                changes.push(ManifestChange::new_create(
                    partition_id,
                    table_id,
                    table.level,
                    table.key_id,
                    table.compression,
                ));
            }
        }
        changes
    }
}

/// Applies one change to the manifest image.
fn apply_manifest_change(build: &mut Manifest, change: &ManifestChange) -> Result<()> {
    let partition = build.partitions.entry(change.partition_id).or_default();

    match change.operation {
        Operation::Create => {
            if partition.tables.contains_key(&change.table_id) {
                return Err(crate::errdata!(
                    "MANIFEST invalid, table {} already exists for partition {}",
                    change.table_id,
                    change.partition_id
                ));
            }
            partition.tables.insert(
                change.table_id,
                TableManifest {
                    level: change.level,
                    key_id: change.key_id,
                    compression: CompressionType::try_from(change.compression)?,
                },
            );
            while partition.levels.len() <= change.level as usize {
                partition.levels.push(LevelManifest::default());
            }
            partition.levels[change.level as usize]
                .tables
                .insert(change.table_id);
            build.creations += 1;
            build.total_tables += 1;
        }
        Operation::Delete => {
            let table = match partition.tables.get(&change.table_id) {
                Some(table) => *table,
                None => {
                    return Err(crate::errdata!(
                        "MANIFEST removes non-existing table {} for partition {}",
                        change.table_id,
                        change.partition_id
                    ))
                }
            };
            partition.levels[table.level as usize]
                .tables
                .remove(&change.table_id);
            partition.tables.remove(&change.table_id);
            build.deletions += 1;
            build.total_tables -= 1;
        }
    }
    Ok(())
}

/// Applies a change set atomically: every change lands on a scratch copy
/// first, so a failing change never leaves the image half-mutated.
pub fn apply_change_set(build: &mut Manifest, set: &ManifestChangeSet) -> Result<()> {
    let mut scratch = build.clone();
    for change in &set.changes {
        apply_manifest_change(&mut scratch, change)?;
    }
    *build = scratch;
    Ok(())
}

struct ManifestInner {
    /// `None` in in-memory mode.
    file: Option<File>,
    manifest: Manifest,
}

/// Handle on the manifest file. Appends are serialized by an internal lock
/// which also guards the in-memory image.
pub struct ManifestFile {
    directory: PathBuf,
    deletions_rewrite_threshold: usize,
    in_memory: bool,
    inner: Mutex<ManifestInner>,
}

impl ManifestFile {
    /// Opens `dir/MANIFEST`, creating it when missing (read-write only).
    /// Returns the handle and a copy of the replayed image for startup
    /// reconciliation.
    pub fn open_or_create(dir: &Path, read_only: bool) -> Result<(ManifestFile, Manifest)> {
        Self::help_open_or_create(dir, read_only, DELETIONS_REWRITE_THRESHOLD)
    }

    /// A manifest that never touches disk, for in-memory databases.
    pub fn in_memory() -> ManifestFile {
        ManifestFile {
            directory: PathBuf::new(),
            deletions_rewrite_threshold: DELETIONS_REWRITE_THRESHOLD,
            in_memory: true,
            inner: Mutex::new(ManifestInner {
                file: None,
                manifest: Manifest::new(),
            }),
        }
    }

    /// Like [`ManifestFile::open_or_create`] with a configurable rewrite
    /// threshold so tests can reach the rewrite path quickly.
    pub fn help_open_or_create(
        dir: &Path,
        read_only: bool,
        deletions_threshold: usize,
    ) -> Result<(ManifestFile, Manifest)> {
        let path = dir.join(MANIFEST_FILENAME);

        let open_result = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path);

        let mut file = match open_result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if read_only {
                    return Err(Error::Io(
                        "no manifest found, required for read-only db".to_string(),
                    ));
                }
                let manifest = Manifest::new();
                let (file, net_creations) = help_rewrite(dir, &manifest)?;
                debug_assert_eq!(net_creations, 0);
                let mf = ManifestFile {
                    directory: dir.to_path_buf(),
                    deletions_rewrite_threshold: deletions_threshold,
                    in_memory: false,
                    inner: Mutex::new(ManifestInner {
                        file: Some(file),
                        manifest: manifest.clone(),
                    }),
                };
                return Ok((mf, manifest));
            }
            Err(e) => {
                return Err(Error::Io(format!(
                    "failed to open existing manifest file: {e}"
                )))
            }
            Ok(file) => file,
        };

        let (manifest, trunc_offset) = replay_manifest_file(&mut file)?;

        if !read_only {
            // Cut off a half-written trailing record.
            file.set_len(trunc_offset)?;
        }
        file.seek(SeekFrom::End(0))?;

        let mf = ManifestFile {
            directory: dir.to_path_buf(),
            deletions_rewrite_threshold: deletions_threshold,
            in_memory: false,
            inner: Mutex::new(ManifestInner {
                file: Some(file),
                manifest: manifest.clone(),
            }),
        };
        Ok((mf, manifest))
    }

    /// Writes a batch of changes atomically: on replay either the whole set
    /// is applied or none of it.
    pub fn add_changes(&self, changes: Vec<ManifestChange>) -> Result<()> {
        let set = ManifestChangeSet::new(changes);
        let payload = set.marshal();

        let mut inner = self.inner.lock()?;
        apply_change_set(&mut inner.manifest, &set)?;

        if self.in_memory {
            return Ok(());
        }

        // Rewrite once deletions dominate, otherwise append.
        if inner.manifest.deletions > self.deletions_rewrite_threshold
            && inner.manifest.deletions
                > DELETIONS_RATIO * (inner.manifest.creations - inner.manifest.deletions)
        {
            self.rewrite_locked(&mut inner)?;
        } else {
            let mut record = Vec::with_capacity(8 + payload.len());
            let mut len_crc = [0u8; 8];
            BigEndian::write_u32(&mut len_crc[0..4], payload.len() as u32);
            BigEndian::write_u32(&mut len_crc[4..8], checksum32(&payload));
            record.extend_from_slice(&len_crc);
            record.extend_from_slice(&payload);

            let file = inner.file.as_mut().expect("manifest file missing");
            file.write_all(&record)?;
        }

        inner
            .file
            .as_mut()
            .expect("manifest file missing")
            .sync_all()?;
        Ok(())
    }

    /// Rebuilds the file from the live table set. The append lock must be
    /// held.
    fn rewrite_locked(&self, inner: &mut ManifestInner) -> Result<()> {
        // Close the old handle before the rename replaces it.
        inner.file.take();

        let (file, net_creations) = help_rewrite(&self.directory, &inner.manifest)?;
        inner.file = Some(file);
        inner.manifest.creations = net_creations;
        inner.manifest.deletions = 0;
        Ok(())
    }

    /// Returns a copy of the current image.
    pub fn manifest(&self) -> Result<Manifest> {
        Ok(self.inner.lock()?.manifest.clone())
    }

    pub fn close(&self) -> Result<()> {
        if self.in_memory {
            return Ok(());
        }
        // Dropping the handle closes the file.
        self.inner.lock()?.file.take();
        Ok(())
    }
}

/// Writes a fresh manifest to `MANIFEST-REWRITE` and renames it over
/// `MANIFEST`. Returns the reopened file (positioned at the end) and the
/// net creation count.
fn help_rewrite(dir: &Path, manifest: &Manifest) -> Result<(File, usize)> {
    let rewrite_path = dir.join(MANIFEST_REWRITE_FILENAME);

    let mut file = File::create(&rewrite_path)?;

    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC_TEXT);
    buf.extend_from_slice(&MANIFEST_VERSION.to_be_bytes());

    let net_creations = manifest.total_tables;
    let set = ManifestChangeSet::new(manifest.as_changes());
    let payload = set.marshal();

    let mut len_crc = [0u8; 8];
    BigEndian::write_u32(&mut len_crc[0..4], payload.len() as u32);
    BigEndian::write_u32(&mut len_crc[4..8], checksum32(&payload));
    buf.extend_from_slice(&len_crc);
    buf.extend_from_slice(&payload);

    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    let manifest_path = dir.join(MANIFEST_FILENAME);
    fs::rename(&rewrite_path, &manifest_path)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&manifest_path)?;
    file.seek(SeekFrom::End(0))?;

    sync_dir(dir)?;

    Ok((file, net_creations))
}

/// Replays the manifest file from the start, returning the rebuilt image
/// and the byte offset at which replay stopped. A truncated trailing
/// record ends replay cleanly; a corrupt one is an error.
pub fn replay_manifest_file(file: &mut File) -> Result<(Manifest, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(&mut *file);

    let mut header = [0u8; 8];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::BadMagic)?;
    if &header[0..4] != MAGIC_TEXT {
        return Err(Error::BadMagic);
    }
    if BigEndian::read_u32(&header[4..8]) != MANIFEST_VERSION {
        return Err(Error::BadVersion);
    }

    let mut build = Manifest::new();
    let mut offset: u64 = 8;
    loop {
        let mut len_crc = [0u8; 8];
        match reader.read_exact(&mut len_crc) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(format!("failed to replay manifest file: {e}"))),
        }

        let length = BigEndian::read_u32(&len_crc[0..4]) as u64;
        if length > file_size {
            return Err(crate::errdata!(
                "buffer length for change set greater than file size, manifest might be \
                 corrupted. buffer length: {length} file size: {file_size}"
            ));
        }

        let mut payload = vec![0u8; length as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(format!("failed to replay manifest file: {e}"))),
        }

        if checksum32(&payload) != BigEndian::read_u32(&len_crc[4..8]) {
            return Err(Error::BadChecksum);
        }

        let set = ManifestChangeSet::unmarshal(&payload)?;
        apply_change_set(&mut build, &set)?;

        offset += 8 + length;
    }

    Ok((build, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create(table_id: u64) -> ManifestChange {
        ManifestChange::new_create(0, table_id, 0, 0, CompressionType::None)
    }

    #[test]
    fn test_open_creates_fresh_manifest() {
        let dir = TempDir::new().unwrap();
        let (mf, manifest) = ManifestFile::open_or_create(dir.path(), false).unwrap();
        assert_eq!(manifest.creations, 0);
        assert_eq!(manifest.deletions, 0);
        assert!(dir.path().join(MANIFEST_FILENAME).exists());
        mf.close().unwrap();
    }

    #[test]
    fn test_read_only_requires_existing_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(ManifestFile::open_or_create(dir.path(), true).is_err());
    }

    #[test]
    fn test_rewrite_triggers_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let deletions_threshold = 10;
        let (mf, _) =
            ManifestFile::help_open_or_create(dir.path(), false, deletions_threshold).unwrap();

        mf.add_changes(vec![create(0)]).unwrap();
        for i in 0..(deletions_threshold as u64 * 3) {
            mf.add_changes(vec![create(i + 1), ManifestChange::new_delete(0, i)])
                .unwrap();
        }
        mf.close().unwrap();

        let (mf, manifest) =
            ManifestFile::help_open_or_create(dir.path(), false, deletions_threshold).unwrap();
        let partition = &manifest.partitions[&0];
        assert_eq!(partition.tables.len(), 1);
        assert_eq!(
            partition.tables[&(deletions_threshold as u64 * 3)],
            TableManifest {
                level: 0,
                key_id: 0,
                compression: CompressionType::None
            }
        );
        mf.close().unwrap();
    }

    #[test]
    fn test_rewrite_resets_counters() {
        let dir = TempDir::new().unwrap();
        let (mf, _) = ManifestFile::help_open_or_create(dir.path(), false, 5).unwrap();

        mf.add_changes(vec![create(0)]).unwrap();
        for i in 0..20u64 {
            mf.add_changes(vec![create(i + 1), ManifestChange::new_delete(0, i)])
                .unwrap();
        }
        let manifest = mf.manifest().unwrap();
        assert_eq!(manifest.deletions, 0);
        assert_eq!(manifest.creations, manifest.total_tables);
        mf.close().unwrap();
    }

    #[test]
    fn test_replay_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILENAME);
        let mut buf = Vec::new();
        buf.extend_from_slice(b"XXXX");
        buf.extend_from_slice(&MANIFEST_VERSION.to_be_bytes());
        fs::write(&path, &buf).unwrap();

        let mut file = File::open(&path).unwrap();
        assert_eq!(
            replay_manifest_file(&mut file).unwrap_err(),
            Error::BadMagic
        );
    }

    #[test]
    fn test_replay_rejects_bad_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILENAME);
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC_TEXT);
        buf.extend_from_slice(&0u32.to_be_bytes());
        fs::write(&path, &buf).unwrap();

        let mut file = File::open(&path).unwrap();
        assert_eq!(
            replay_manifest_file(&mut file).unwrap_err(),
            Error::BadVersion
        );
    }

    #[test]
    fn test_replay_rejects_bad_checksum() {
        let dir = TempDir::new().unwrap();
        let (mf, _) = ManifestFile::open_or_create(dir.path(), false).unwrap();
        mf.add_changes(vec![create(0)]).unwrap();
        mf.close().unwrap();

        let path = dir.path().join(MANIFEST_FILENAME);
        let mut contents = fs::read(&path).unwrap();
        // Flip a payload byte of the appended record, invalidating its
        // stored checksum.
        let last = contents.len() - 1;
        contents[last] ^= 0xFF;
        fs::write(&path, &contents).unwrap();

        let mut file = File::open(&path).unwrap();
        assert_eq!(
            replay_manifest_file(&mut file).unwrap_err(),
            Error::BadChecksum
        );
    }

    #[test]
    fn test_truncated_trailing_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (mf, _) = ManifestFile::open_or_create(dir.path(), false).unwrap();
        mf.add_changes(vec![create(0)]).unwrap();
        mf.add_changes(vec![create(1)]).unwrap();
        mf.close().unwrap();

        let path = dir.path().join(MANIFEST_FILENAME);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();
        drop(file);

        let (mf, manifest) = ManifestFile::open_or_create(dir.path(), false).unwrap();
        assert_eq!(manifest.partitions[&0].tables.len(), 1);
        assert!(manifest.partitions[&0].tables.contains_key(&0));
        mf.close().unwrap();
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let mut manifest = Manifest::new();
        let set = ManifestChangeSet::new(vec![create(0)]);
        apply_change_set(&mut manifest, &set).unwrap();
        assert!(apply_change_set(&mut manifest, &set).is_err());
    }

    #[test]
    fn test_delete_unknown_table_rejected() {
        let mut manifest = Manifest::new();
        let set = ManifestChangeSet::new(vec![ManifestChange::new_delete(0, 99)]);
        assert!(apply_change_set(&mut manifest, &set).is_err());
    }

    #[test]
    fn test_failed_set_leaves_image_untouched() {
        let mut manifest = Manifest::new();
        apply_change_set(&mut manifest, &ManifestChangeSet::new(vec![create(0)])).unwrap();
        let before = manifest.clone();

        // Second change of the set is invalid, the first must not stick.
        let bad = ManifestChangeSet::new(vec![create(1), ManifestChange::new_delete(0, 42)]);
        assert!(apply_change_set(&mut manifest, &bad).is_err());
        assert_eq!(manifest, before);
    }

    #[test]
    fn test_replay_matches_applied_state() {
        let dir = TempDir::new().unwrap();
        let (mf, _) = ManifestFile::open_or_create(dir.path(), false).unwrap();
        mf.add_changes(vec![
            ManifestChange::new_create(0, 0, 0, 0, CompressionType::None),
            ManifestChange::new_create(1, 0, 2, 7, CompressionType::Zstd),
        ])
        .unwrap();
        mf.add_changes(vec![ManifestChange::new_delete(0, 0)]).unwrap();
        let in_memory = mf.manifest().unwrap();
        mf.close().unwrap();

        let path = dir.path().join(MANIFEST_FILENAME);
        let mut file = File::open(&path).unwrap();
        let (replayed, _) = replay_manifest_file(&mut file).unwrap();
        assert_eq!(replayed, in_memory);
        assert_eq!(replayed.total_tables, 1);
        assert_eq!(
            replayed.partitions[&1].tables[&0],
            TableManifest {
                level: 2,
                key_id: 7,
                compression: CompressionType::Zstd
            }
        );
    }

    #[test]
    fn test_in_memory_manifest_tracks_changes() {
        let mf = ManifestFile::in_memory();
        mf.add_changes(vec![create(0)]).unwrap();
        let manifest = mf.manifest().unwrap();
        assert_eq!(manifest.total_tables, 1);
        mf.close().unwrap();
    }
}
