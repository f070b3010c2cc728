//! Append-only value log.
//!
//! Large values are written here and the LSM stores only a 12-byte value
//! pointer. The log is a sequence of segments named `{:06}.vlog`; appending
//! a record returns the `(fileId, len, offset)` pointer locating it.
//!
//! # Record format
//!
//! ```text
//! +------------+----------------+----------+----------+------+----------+
//! | crc32 u32  | partition u32  | klen u32 | vlen u32 | meta | userMeta |
//! | expiresAt u64 | key (with ts) | value                               |
//! +---------------------------------------------------------------------+
//! ```
//!
//! All integers big-endian; the CRC-32 (Castagnoli) covers everything
//! after the checksum field. Records also carry enough context (partition,
//! timestamped key, metadata) for crash replay to rebuild the in-memory
//! tables from the head pointer forward.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::flock::sync_dir;
use crate::hasher::crc32;
use crate::keys::ValuePointer;
use crate::PartitionId;

/// Value log file extension.
pub const VLOG_FILE_EXTENSION: &str = ".vlog";

/// Fixed bytes before the key in every record.
const RECORD_HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 1 + 1 + 8;

/// Path of segment `file_id` inside `dir`.
pub fn vlog_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{file_id:06}{VLOG_FILE_EXTENSION}"))
}

fn parse_vlog_id(name: &str) -> Option<u32> {
    name.strip_suffix(VLOG_FILE_EXTENSION)?.parse().ok()
}

/// A record to append.
pub struct VlogRecord<'a> {
    pub partition_id: PartitionId,
    /// Timestamped key.
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
}

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlogEntry {
    pub partition_id: PartitionId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
}

struct ActiveSegment {
    file_id: u32,
    file: File,
    offset: u32,
}

/// The shared value log.
pub struct ValueLog {
    dir: PathBuf,
    file_size_limit: u64,
    sync_writes: bool,
    /// Segments present on disk, including the active one.
    segments: Mutex<BTreeSet<u32>>,
    active: Mutex<Option<ActiveSegment>>,
}

impl ValueLog {
    /// Opens the value log in `dir`. Read-write mode starts a fresh active
    /// segment after the highest existing one.
    pub fn open(
        dir: &Path,
        file_size_limit: u64,
        sync_writes: bool,
        read_only: bool,
    ) -> Result<ValueLog> {
        let mut segments = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = parse_vlog_id(name) {
                    segments.insert(id);
                }
            }
        }

        let active = if read_only {
            None
        } else {
            let file_id = segments.iter().next_back().map_or(0, |max| max + 1);
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(vlog_file_path(dir, file_id))?;
            sync_dir(dir)?;
            segments.insert(file_id);
            Some(ActiveSegment {
                file_id,
                file,
                offset: 0,
            })
        };

        Ok(ValueLog {
            dir: dir.to_path_buf(),
            file_size_limit,
            sync_writes,
            segments: Mutex::new(segments),
            active: Mutex::new(active),
        })
    }

    fn encode_record(rec: &VlogRecord) -> Vec<u8> {
        let total = RECORD_HEADER_SIZE + rec.key.len() + rec.value.len();
        let mut buf = vec![0u8; total];
        BigEndian::write_u32(&mut buf[4..8], rec.partition_id);
        BigEndian::write_u32(&mut buf[8..12], rec.key.len() as u32);
        BigEndian::write_u32(&mut buf[12..16], rec.value.len() as u32);
        buf[16] = rec.meta;
        buf[17] = rec.user_meta;
        BigEndian::write_u64(&mut buf[18..26], rec.expires_at);
        buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + rec.key.len()].copy_from_slice(rec.key);
        buf[RECORD_HEADER_SIZE + rec.key.len()..].copy_from_slice(rec.value);
        let checksum = crc32(&buf[4..]);
        BigEndian::write_u32(&mut buf[0..4], checksum);
        buf
    }

    fn decode_record(buf: &[u8]) -> Result<VlogEntry> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(crate::errdata!("value log record truncated"));
        }
        let stored_crc = BigEndian::read_u32(&buf[0..4]);
        if crc32(&buf[4..]) != stored_crc {
            return Err(crate::errdata!("value log record has bad checksum"));
        }
        let partition_id = BigEndian::read_u32(&buf[4..8]);
        let klen = BigEndian::read_u32(&buf[8..12]) as usize;
        let vlen = BigEndian::read_u32(&buf[12..16]) as usize;
        if buf.len() != RECORD_HEADER_SIZE + klen + vlen {
            return Err(crate::errdata!("value log record length mismatch"));
        }
        Ok(VlogEntry {
            partition_id,
            meta: buf[16],
            user_meta: buf[17],
            expires_at: BigEndian::read_u64(&buf[18..26]),
            key: buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + klen].to_vec(),
            value: buf[RECORD_HEADER_SIZE + klen..].to_vec(),
        })
    }

    /// Appends a record, rotating the active segment at the size limit,
    /// and returns its pointer.
    pub fn append(&self, rec: &VlogRecord) -> Result<ValuePointer> {
        let buf = Self::encode_record(rec);

        let mut guard = self.active.lock()?;
        let active = guard
            .as_mut()
            .ok_or_else(|| crate::errdata!("value log is read-only"))?;

        if active.offset as u64 + buf.len() as u64 > self.file_size_limit && active.offset > 0 {
            active.file.sync_all()?;
            let next_id = active.file_id + 1;
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(vlog_file_path(&self.dir, next_id))?;
            sync_dir(&self.dir)?;
            self.segments.lock()?.insert(next_id);
            *active = ActiveSegment {
                file_id: next_id,
                file,
                offset: 0,
            };
        }

        let pointer = ValuePointer {
            file_id: active.file_id,
            len: buf.len() as u32,
            offset: active.offset,
        };
        active.file.write_all(&buf)?;
        active.offset += buf.len() as u32;
        if self.sync_writes {
            active.file.sync_data()?;
        }
        Ok(pointer)
    }

    /// Reads the record a pointer refers to.
    pub fn read(&self, ptr: ValuePointer) -> Result<VlogEntry> {
        let mut buf = vec![0u8; ptr.len as usize];

        let mut guard = self.active.lock()?;
        if let Some(active) = guard.as_mut() {
            if active.file_id == ptr.file_id {
                active.file.seek(SeekFrom::Start(ptr.offset as u64))?;
                active.file.read_exact(&mut buf)?;
                active.file.seek(SeekFrom::Start(active.offset as u64))?;
                return Self::decode_record(&buf);
            }
        }
        drop(guard);

        let mut file = File::open(vlog_file_path(&self.dir, ptr.file_id))?;
        file.seek(SeekFrom::Start(ptr.offset as u64))?;
        file.read_exact(&mut buf)?;
        Self::decode_record(&buf)
    }

    /// Replays every record after `head`, calling `apply` with each entry
    /// and its pointer. A truncated or corrupt trailing record stops the
    /// replay cleanly.
    pub fn replay(
        &self,
        head: ValuePointer,
        mut apply: impl FnMut(VlogEntry, ValuePointer) -> Result<()>,
    ) -> Result<()> {
        let segments: Vec<u32> = self
            .segments
            .lock()?
            .iter()
            .copied()
            .filter(|&id| id >= head.file_id)
            .collect();

        for file_id in segments {
            let path = vlog_file_path(&self.dir, file_id);
            let mut contents = Vec::new();
            match File::open(&path) {
                Ok(mut file) => {
                    file.read_to_end(&mut contents)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let mut offset = if file_id == head.file_id && !head.is_zero() {
                (head.offset + head.len) as usize
            } else {
                0
            };

            while offset + RECORD_HEADER_SIZE <= contents.len() {
                let klen = BigEndian::read_u32(&contents[offset + 8..offset + 12]) as usize;
                let vlen = BigEndian::read_u32(&contents[offset + 12..offset + 16]) as usize;
                let total = RECORD_HEADER_SIZE + klen + vlen;
                if offset + total > contents.len() {
                    break; // Truncated trailing record.
                }
                let entry = match Self::decode_record(&contents[offset..offset + total]) {
                    Ok(entry) => entry,
                    Err(_) => {
                        tracing::warn!(
                            file_id,
                            offset,
                            "stopping value log replay at corrupt record"
                        );
                        break;
                    }
                };
                let pointer = ValuePointer {
                    file_id,
                    len: total as u32,
                    offset: offset as u32,
                };
                apply(entry, pointer)?;
                offset += total;
            }
        }
        Ok(())
    }

    /// Fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        if let Some(active) = self.active.lock()?.as_mut() {
            active.file.sync_all()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.active.lock()?;
        if let Some(active) = guard.as_mut() {
            active.file.sync_all()?;
        }
        guard.take();
        Ok(())
    }
}
