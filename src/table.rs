//! Immutable sorted table files.
//!
//! Tables are the on-disk black box of the LSM: a flush or compaction
//! builds one from an ordered stream of timestamped keys, and readers
//! address it by `(partitionId, fileId)`. Files are named
//! `{partitionId:08X}{fileId:016X}.sst`.
//!
//! # File format
//!
//! ```text
//! +--------------------------------------------------+
//! | entries: u16 klen BE | key | u32 vlen BE | value |
//! +--------------------------------------------------+
//! | footer: iv[16] | key_id u64 BE | count u32 BE    |
//! |         checksum u32 BE                          |
//! +--------------------------------------------------+
//! ```
//!
//! The entry region is encrypted with the table's data key (AES-CTR, the
//! footer IV) when `key_id` is non-zero. The checksum is xxHash32 over the
//! stored (possibly encrypted) entry region, so corruption is detected
//! before decryption. The whole table is loaded into memory on open.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::hasher::checksum32;
use crate::keys::{compare_keys, parse_ts, same_key, ValueStruct};
use crate::registry::{generate_iv, xor_block, DataKey, IV_SIZE};
use crate::PartitionId;

/// Table file extension.
pub const TABLE_FILE_EXTENSION: &str = ".sst";

/// Length of a table file name without the extension: 8 hex digits of
/// partition id and 16 of file id.
const TABLE_FILE_NAME_LENGTH: usize = 24;

const FOOTER_SIZE: usize = IV_SIZE + 8 + 4 + 4;

/// Builds `{partitionId:08X}{fileId:016X}.sst`.
pub fn id_to_filename(partition_id: PartitionId, file_id: u64) -> String {
    format!("{partition_id:08X}{file_id:016X}{TABLE_FILE_EXTENSION}")
}

/// Full path of a table file inside `dir`.
pub fn new_filename(partition_id: PartitionId, file_id: u64, dir: &Path) -> PathBuf {
    dir.join(id_to_filename(partition_id, file_id))
}

/// Parses a table file name into `(partitionId, fileId)`. Returns `None`
/// for files that are not tables.
pub fn parse_file_id(name: &str) -> Option<(PartitionId, u64)> {
    let stem = name.strip_suffix(TABLE_FILE_EXTENSION)?;
    if stem.len() != TABLE_FILE_NAME_LENGTH {
        return None;
    }
    let partition_id = u32::from_str_radix(&stem[0..8], 16).ok()?;
    let file_id = u64::from_str_radix(&stem[8..24], 16).ok()?;
    Some((partition_id, file_id))
}

#[derive(Clone, Copy)]
struct EntryRef {
    key_start: u32,
    key_len: u16,
    value_start: u32,
    value_len: u32,
}

/// An open, fully-loaded table.
pub struct Table {
    path: PathBuf,
    partition_id: PartitionId,
    file_id: u64,
    /// Plaintext entry region.
    data: Vec<u8>,
    index: Vec<EntryRef>,
    smallest: Vec<u8>,
    largest: Vec<u8>,
    /// On-disk size in bytes.
    size: u64,
    /// Highest commit timestamp stored in this table.
    max_version: u64,
    /// Id of the data key the file is encrypted with, 0 for plaintext.
    key_id: u64,
    /// Whether any user key appears with more than one version.
    stale_versions: bool,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").finish_non_exhaustive()
    }
}

impl Table {
    /// Opens a table file, verifying its checksum and decrypting with
    /// `data_key` when the file was built with one.
    pub fn open(path: &Path, data_key: Option<&DataKey>) -> Result<Table> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let (partition_id, file_id) = parse_file_id(name)
            .ok_or_else(|| crate::errdata!("invalid table filename: {name}"))?;

        let raw = std::fs::read(path)?;
        if raw.len() < FOOTER_SIZE {
            return Err(crate::errdata!("table file {name} too short"));
        }
        let (region, footer) = raw.split_at(raw.len() - FOOTER_SIZE);

        let iv = &footer[0..IV_SIZE];
        let key_id = BigEndian::read_u64(&footer[IV_SIZE..IV_SIZE + 8]);
        let count = BigEndian::read_u32(&footer[IV_SIZE + 8..IV_SIZE + 12]) as usize;
        let stored_checksum = BigEndian::read_u32(&footer[IV_SIZE + 12..IV_SIZE + 16]);

        if checksum32(region) != stored_checksum {
            return Err(crate::errdata!(
                "CHECKSUM_MISMATCH: table file {name} is corrupt"
            ));
        }

        let data = match (key_id, data_key) {
            (0, _) => region.to_vec(),
            (_, Some(key)) => xor_block(region, &key.data, iv)?,
            (_, None) => {
                return Err(crate::errdata!(
                    "table file {name} is encrypted with key {key_id} but no data key was given"
                ))
            }
        };

        let index = Self::build_index(&data, count)?;

        Ok(Table::from_parts(path.to_path_buf(), partition_id, file_id, data, index, raw.len() as u64, key_id))
    }

    fn from_parts(
        path: PathBuf,
        partition_id: PartitionId,
        file_id: u64,
        data: Vec<u8>,
        index: Vec<EntryRef>,
        size: u64,
        key_id: u64,
    ) -> Table {
        let key_of = |e: &EntryRef| {
            &data[e.key_start as usize..e.key_start as usize + e.key_len as usize]
        };
        let smallest = index.first().map(key_of).unwrap_or_default().to_vec();
        let largest = index.last().map(key_of).unwrap_or_default().to_vec();
        let max_version = index.iter().map(|e| parse_ts(key_of(e))).max().unwrap_or(0);
        let stale_versions = index
            .windows(2)
            .any(|pair| same_key(key_of(&pair[0]), key_of(&pair[1])));

        Table {
            path,
            partition_id,
            file_id,
            data,
            index,
            smallest,
            largest,
            size,
            max_version,
            key_id,
            stale_versions,
        }
    }

    fn build_index(data: &[u8], count: usize) -> Result<Vec<EntryRef>> {
        let mut index = Vec::with_capacity(count);
        let mut offset = 0usize;
        for _ in 0..count {
            if offset + 2 > data.len() {
                return Err(crate::errdata!("table entry region truncated"));
            }
            let key_len = BigEndian::read_u16(&data[offset..offset + 2]) as usize;
            let key_start = offset + 2;
            let value_len_at = key_start + key_len;
            if value_len_at + 4 > data.len() {
                return Err(crate::errdata!("table entry region truncated"));
            }
            let value_len = BigEndian::read_u32(&data[value_len_at..value_len_at + 4]) as usize;
            let value_start = value_len_at + 4;
            if value_start + value_len > data.len() {
                return Err(crate::errdata!("table entry region truncated"));
            }
            index.push(EntryRef {
                key_start: key_start as u32,
                key_len: key_len as u16,
                value_start: value_start as u32,
                value_len: value_len as u32,
            });
            offset = value_start + value_len;
        }
        Ok(index)
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest stored key (with timestamp).
    pub fn smallest(&self) -> &[u8] {
        &self.smallest
    }

    /// Largest stored key (with timestamp).
    pub fn biggest(&self) -> &[u8] {
        &self.largest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_version(&self) -> u64 {
        self.max_version
    }

    pub fn key_id(&self) -> u64 {
        self.key_id
    }

    /// Whether the table holds shadowed older versions that a bottom-level
    /// rewrite could reclaim.
    pub fn has_stale_versions(&self) -> bool {
        self.stale_versions
    }

    /// Whether any stored user key starts with `prefix`.
    pub fn contains_prefix(&self, prefix: &[u8]) -> bool {
        let seek = crate::keys::key_with_ts(prefix, u64::MAX);
        let i = self.lower_bound(&seek);
        i < self.index.len() && crate::keys::parse_key(self.key_at(i)).starts_with(prefix)
    }

    pub fn num_entries(&self) -> usize {
        self.index.len()
    }

    fn key_at(&self, i: usize) -> &[u8] {
        let entry = &self.index[i];
        &self.data[entry.key_start as usize..entry.key_start as usize + entry.key_len as usize]
    }

    fn value_at(&self, i: usize) -> ValueStruct {
        let entry = &self.index[i];
        let start = entry.value_start as usize;
        ValueStruct::unmarshal(&self.data[start..start + entry.value_len as usize])
    }

    /// Returns the newest version of the user key visible at the timestamp
    /// encoded in `key`.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        let i = self.lower_bound(key);
        if i >= self.index.len() {
            return None;
        }
        let found = self.key_at(i);
        if !same_key(key, found) {
            return None;
        }
        let mut value = self.value_at(i);
        value.version = parse_ts(found);
        Some(value)
    }

    fn lower_bound(&self, key: &[u8]) -> usize {
        let mut lo = 0usize;
        let mut hi = self.index.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if compare_keys(self.key_at(mid), key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator {
            table: self,
            pos: 0,
        }
    }
}

/// Forward iterator over a table.
pub struct TableIterator<'a> {
    table: &'a Table,
    pos: usize,
}

impl TableIterator<'_> {
    pub fn valid(&self) -> bool {
        self.pos < self.table.index.len()
    }

    pub fn key(&self) -> &[u8] {
        self.table.key_at(self.pos)
    }

    pub fn value(&self) -> ValueStruct {
        self.table.value_at(self.pos)
    }

    pub fn next(&mut self) {
        self.pos += 1;
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Positions at the first entry with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.pos = self.table.lower_bound(key);
    }
}

/// Accumulates sorted entries for a new table file.
pub struct Builder {
    buf: Vec<u8>,
    count: u32,
    last_key: Vec<u8>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            buf: Vec::new(),
            count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly ascending stored-key
    /// order.
    pub fn add(&mut self, key: &[u8], value: &ValueStruct) {
        debug_assert!(
            self.last_key.is_empty()
                || compare_keys(&self.last_key, key) == std::cmp::Ordering::Less,
            "keys must be added in ascending order"
        );
        let mut klen = [0u8; 2];
        BigEndian::write_u16(&mut klen, key.len() as u16);
        self.buf.extend_from_slice(&klen);
        self.buf.extend_from_slice(key);

        let encoded = value.to_vec();
        let mut vlen = [0u8; 4];
        BigEndian::write_u32(&mut vlen, encoded.len() as u32);
        self.buf.extend_from_slice(&vlen);
        self.buf.extend_from_slice(&encoded);

        self.count += 1;
        self.last_key = key.to_vec();
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes the entry region occupies so far; used to split compaction
    /// output at the table size budget.
    pub fn estimated_size(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Writes the table to `path` (fsynced) and returns it opened. The
    /// entry region is encrypted when a data key is given.
    pub fn finish(self, path: &Path, data_key: Option<&DataKey>) -> Result<Table> {
        let iv = generate_iv();
        let (region, key_id) = match data_key {
            Some(key) => (xor_block(&self.buf, &key.data, &iv)?, key.key_id),
            None => (self.buf.clone(), 0),
        };

        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..IV_SIZE].copy_from_slice(&iv);
        BigEndian::write_u64(&mut footer[IV_SIZE..IV_SIZE + 8], key_id);
        BigEndian::write_u32(&mut footer[IV_SIZE + 8..IV_SIZE + 12], self.count);
        BigEndian::write_u32(&mut footer[IV_SIZE + 12..IV_SIZE + 16], checksum32(&region));

        let mut file = File::create(path)?;
        file.write_all(&region)?;
        file.write_all(&footer)?;
        file.sync_all()?;
        drop(file);

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let (partition_id, file_id) = parse_file_id(name)
            .ok_or_else(|| crate::errdata!("invalid table filename: {name}"))?;

        let index = Table::build_index(&self.buf, self.count as usize)?;
        Ok(Table::from_parts(
            path.to_path_buf(),
            partition_id,
            file_id,
            self.buf,
            index,
            (region.len() + FOOTER_SIZE) as u64,
            key_id,
        ))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_with_ts;
    use tempfile::TempDir;

    fn value(v: &[u8]) -> ValueStruct {
        ValueStruct {
            value: v.to_vec(),
            ..Default::default()
        }
    }

    fn build_sample(dir: &Path, partition_id: u32, file_id: u64) -> Table {
        let mut builder = Builder::new();
        for i in 0..100u64 {
            builder.add(
                &key_with_ts(format!("key{i:03}").as_bytes(), 7),
                &value(format!("value{i}").as_bytes()),
            );
        }
        builder
            .finish(&new_filename(partition_id, file_id, dir), None)
            .unwrap()
    }

    #[test]
    fn test_filename_roundtrip() {
        let name = id_to_filename(1, 0xAB);
        assert_eq!(name, "0000000100000000000000AB.sst");
        assert_eq!(parse_file_id(&name), Some((1, 0xAB)));
        assert_eq!(parse_file_id("garbage.sst"), None);
        assert_eq!(parse_file_id("00000001.vlog"), None);
    }

    #[test]
    fn test_build_and_reopen() {
        let dir = TempDir::new().unwrap();
        let table = build_sample(dir.path(), 0, 1);
        assert_eq!(table.num_entries(), 100);
        assert_eq!(crate::keys::parse_key(table.smallest()), b"key000");
        assert_eq!(crate::keys::parse_key(table.biggest()), b"key099");
        assert_eq!(table.max_version(), 7);

        let reopened = Table::open(table.path(), None).unwrap();
        assert_eq!(reopened.num_entries(), 100);
        assert_eq!(reopened.smallest(), table.smallest());
        assert_eq!(reopened.biggest(), table.biggest());
    }

    #[test]
    fn test_get_finds_visible_version() {
        let dir = TempDir::new().unwrap();
        let table = build_sample(dir.path(), 0, 1);

        let found = table.get(&key_with_ts(b"key042", 10)).unwrap();
        assert_eq!(found.value, b"value42");
        assert_eq!(found.version, 7);

        // A read below the stored version sees nothing.
        assert!(table.get(&key_with_ts(b"key042", 3)).is_none());
        assert!(table.get(&key_with_ts(b"missing", 10)).is_none());
    }

    #[test]
    fn test_iterator_and_seek() {
        let dir = TempDir::new().unwrap();
        let table = build_sample(dir.path(), 0, 1);

        let mut iter = table.iter();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 100);

        iter.seek(&key_with_ts(b"key050", u64::MAX));
        assert!(iter.valid());
        assert_eq!(crate::keys::parse_key(iter.key()), b"key050");
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let table = build_sample(dir.path(), 0, 1);
        let path = table.path().to_path_buf();
        drop(table);

        let mut contents = std::fs::read(&path).unwrap();
        contents[10] ^= 0xFF;
        std::fs::write(&path, &contents).unwrap();

        match Table::open(&path, None) {
            Err(crate::Error::InvalidData(msg)) => {
                assert!(msg.starts_with("CHECKSUM_MISMATCH"))
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_version_detection() {
        let dir = TempDir::new().unwrap();

        let mut builder = Builder::new();
        builder.add(&key_with_ts(b"k", 5), &value(b"new"));
        builder.add(&key_with_ts(b"k", 1), &value(b"old"));
        let stale = builder.finish(&new_filename(0, 1, dir.path()), None).unwrap();
        assert!(stale.has_stale_versions());

        let fresh = build_sample(dir.path(), 0, 2);
        assert!(!fresh.has_stale_versions());
    }

    #[test]
    fn test_contains_prefix() {
        let dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder.add(&key_with_ts(b"alpha", 1), &value(b"a"));
        builder.add(&key_with_ts(b"tmp!x", 1), &value(b"t"));
        builder.add(&key_with_ts(b"zeta", 1), &value(b"z"));
        let table = builder.finish(&new_filename(0, 3, dir.path()), None).unwrap();

        assert!(table.contains_prefix(b"tmp!"));
        assert!(table.contains_prefix(b"al"));
        // The range [alpha, zeta] straddles "beta" but no key carries it.
        assert!(!table.contains_prefix(b"beta"));
        assert!(!table.contains_prefix(b"zz"));
    }

    #[test]
    fn test_encrypted_table_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data_key = DataKey {
            partition_id: 0,
            key_id: 5,
            data: vec![0x42; 32],
            iv: generate_iv().to_vec(),
            created_at: 0,
        };

        let mut builder = Builder::new();
        builder.add(&key_with_ts(b"secret", 1), &value(b"payload"));
        let path = new_filename(0, 9, dir.path());
        let table = builder.finish(&path, Some(&data_key)).unwrap();
        assert_eq!(table.key_id(), 5);
        drop(table);

        // Ciphertext on disk must not contain the plaintext key.
        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));

        let reopened = Table::open(&path, Some(&data_key)).unwrap();
        let found = reopened.get(&key_with_ts(b"secret", 1)).unwrap();
        assert_eq!(found.value, b"payload");

        // Without the key the open fails.
        assert!(Table::open(&path, None).is_err());
    }
}
