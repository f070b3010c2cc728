//! Durable, encrypted catalogue of per-partition data keys.
//!
//! Data keys encrypt value-log and table blocks; they are themselves
//! envelope-encrypted under the master key with an AES-CTR keystream.
//!
//! # File format
//!
//! ```text
//! +----------------+------------------------+
//! | IV (16 bytes)  | sanity text (10 bytes) |
//! +----------------+------------------------+
//! | len u32 BE | xxh32 u32 BE | DataKey     |   repeated records
//! +-------------------------------------------+
//! ```
//!
//! The sanity text is `"not badger"`, XOR-stream encrypted when a master
//! key is set and stored as plaintext otherwise; it detects opening a
//! registry with the wrong master key.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes::{Aes128, Aes192, Aes256};
use byteorder::{BigEndian, ByteOrder};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::hasher::checksum32;
use crate::PartitionId;

/// Filename of the key registry.
pub const KEY_REGISTRY_FILENAME: &str = "KEYREGISTRY";

/// AES block size; also the IV length.
pub const IV_SIZE: usize = 16;

const SANITY_TEXT: &[u8; 10] = b"not badger";

/// Applies an AES-CTR keystream to `src`. The same call encrypts and
/// decrypts. The key must be 16, 24 or 32 bytes; the IV one AES block.
pub fn xor_block(src: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let mut dst = src.to_vec();
    match key.len() {
        16 => Ctr128BE::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| crate::errdata!("bad cipher setup: {e}"))?
            .apply_keystream(&mut dst),
        24 => Ctr128BE::<Aes192>::new_from_slices(key, iv)
            .map_err(|e| crate::errdata!("bad cipher setup: {e}"))?
            .apply_keystream(&mut dst),
        32 => Ctr128BE::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| crate::errdata!("bad cipher setup: {e}"))?
            .apply_keystream(&mut dst),
        n => return Err(crate::errdata!("invalid AES key length {n}")),
    }
    Ok(dst)
}

/// Generates a random IV of one AES block.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// One data-encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKey {
    pub partition_id: PartitionId,
    pub key_id: u64,
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
    pub created_at: u64,
}

impl DataKey {
    /// Encodes the key, envelope-encrypting `data` when a master key is
    /// given.
    pub fn marshal(&self, master_key: &[u8]) -> Result<Vec<u8>> {
        let data = if master_key.is_empty() {
            self.data.clone()
        } else {
            xor_block(&self.data, master_key, &self.iv)?
        };

        let mut buf = Vec::with_capacity(4 + 8 + 4 + data.len() + 4 + self.iv.len() + 8);
        buf.extend_from_slice(&self.partition_id.to_be_bytes());
        buf.extend_from_slice(&self.key_id.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&(self.iv.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        Ok(buf)
    }

    /// Decodes a key record, decrypting `data` when a master key is given.
    pub fn unmarshal(src: &[u8], master_key: &[u8]) -> Result<DataKey> {
        fn take<'a>(src: &'a [u8], i: &mut usize, n: usize) -> Result<&'a [u8]> {
            if *i + n > src.len() {
                return Err(crate::errdata!("data key record truncated"));
            }
            let out = &src[*i..*i + n];
            *i += n;
            Ok(out)
        }

        let mut i = 0usize;
        let partition_id = BigEndian::read_u32(take(src, &mut i, 4)?);
        let key_id = BigEndian::read_u64(take(src, &mut i, 8)?);
        let data_len = BigEndian::read_u32(take(src, &mut i, 4)?) as usize;
        let data = take(src, &mut i, data_len)?.to_vec();
        let iv_len = BigEndian::read_u32(take(src, &mut i, 4)?) as usize;
        let iv = take(src, &mut i, iv_len)?.to_vec();
        let created_at = BigEndian::read_u64(take(src, &mut i, 8)?);

        let data = if master_key.is_empty() {
            data
        } else {
            xor_block(&data, master_key, &iv)?
        };

        Ok(DataKey {
            partition_id,
            key_id,
            data,
            iv,
            created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeyRegistryOptions {
    pub directory: PathBuf,
    pub read_only: bool,
    pub in_memory: bool,
    pub encryption_key: Vec<u8>,
    pub encryption_key_rotation_duration: Duration,
}

struct RegistryInner {
    data_keys: HashMap<PartitionId, HashMap<u64, DataKey>>,
    next_key_id: u64,
    file: Option<File>,
}

/// Maintains all data keys, appending new records as keys rotate.
pub struct KeyRegistry {
    options: KeyRegistryOptions,
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry").finish_non_exhaustive()
    }
}

impl KeyRegistry {
    fn new(options: KeyRegistryOptions) -> KeyRegistry {
        KeyRegistry {
            options,
            inner: RwLock::new(RegistryInner {
                data_keys: HashMap::new(),
                next_key_id: 0,
                file: None,
            }),
        }
    }

    /// Opens the key registry, creating the file when missing (read-write
    /// only).
    pub fn open(options: KeyRegistryOptions) -> Result<KeyRegistry> {
        if !options.encryption_key.is_empty()
            && !matches!(options.encryption_key.len(), 16 | 24 | 32)
        {
            return Err(crate::errconfig!(
                "encryption key's length should be either 16, 24, or 32 bytes"
            ));
        }

        if options.in_memory {
            return Ok(KeyRegistry::new(options));
        }

        let path = options.directory.join(KEY_REGISTRY_FILENAME);
        if !path.exists() {
            let registry = KeyRegistry::new(options);
            if registry.options.read_only {
                return Ok(registry);
            }
            registry.write_fresh(&path)?;
            return Ok(registry);
        }

        Self::read_existing(options, &path)
    }

    /// Writes the prologue of a brand-new registry file and keeps the
    /// handle for appends.
    fn write_fresh(&self, path: &Path) -> Result<()> {
        let iv = generate_iv();
        let sanity = if self.options.encryption_key.is_empty() {
            SANITY_TEXT.to_vec()
        } else {
            xor_block(SANITY_TEXT, &self.options.encryption_key, &iv)?
        };

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all(&iv)?;
        file.write_all(&sanity)?;
        file.sync_all()?;

        self.inner.write()?.file = Some(file);
        Ok(())
    }

    fn read_existing(options: KeyRegistryOptions, path: &Path) -> Result<KeyRegistry> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)?;

        let mut iv = [0u8; IV_SIZE];
        file.read_exact(&mut iv)
            .map_err(|_| crate::errdata!("key registry prologue truncated"))?;
        let mut sanity = [0u8; SANITY_TEXT.len()];
        file.read_exact(&mut sanity)
            .map_err(|_| crate::errdata!("key registry prologue truncated"))?;

        let expected = if options.encryption_key.is_empty() {
            SANITY_TEXT.to_vec()
        } else {
            xor_block(SANITY_TEXT, &options.encryption_key, &iv)?
        };
        if sanity.as_slice() != expected.as_slice() {
            return Err(crate::errdata!("bad encryption key"));
        }

        let mut data_keys: HashMap<PartitionId, HashMap<u64, DataKey>> = HashMap::new();
        let mut next_key_id = 0u64;
        loop {
            let mut len_crc = [0u8; 8];
            match file.read_exact(&mut len_crc) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let length = BigEndian::read_u32(&len_crc[0..4]) as usize;
            let mut record = vec![0u8; length];
            file.read_exact(&mut record)?;
            if checksum32(&record) != BigEndian::read_u32(&len_crc[4..8]) {
                return Err(crate::errdata!("key registry record has bad checksum"));
            }
            let key = DataKey::unmarshal(&record, &options.encryption_key)?;
            next_key_id = next_key_id.max(key.key_id);
            data_keys.entry(key.partition_id).or_default().insert(key.key_id, key);
        }

        let registry = KeyRegistry::new(options);
        {
            let mut inner = registry.inner.write()?;
            inner.data_keys = data_keys;
            inner.next_key_id = next_key_id;
            inner.file = Some(file);
        }
        Ok(registry)
    }

    /// Looks up a data key. Key id 0 means plaintext and resolves to
    /// `None`; unknown ids are programming errors.
    pub fn data_key(&self, partition_id: PartitionId, key_id: u64) -> Result<Option<DataKey>> {
        if key_id == 0 {
            return Ok(None);
        }
        let inner = self.inner.read()?;
        let partition = inner
            .data_keys
            .get(&partition_id)
            .ok_or_else(|| crate::errdata!("invalid partition id {partition_id}"))?;
        let key = partition
            .get(&key_id)
            .ok_or_else(|| crate::errdata!("invalid data key id {key_id}"))?;
        Ok(Some(key.clone()))
    }

    /// Returns the partition's current data key, rotating it when its age
    /// exceeds the rotation duration. `None` when encryption is off.
    pub fn latest_data_key(&self, partition_id: PartitionId) -> Result<Option<DataKey>> {
        if self.options.encryption_key.is_empty() {
            return Ok(None);
        }

        {
            let inner = self.inner.read()?;
            if let Some(key) = Self::newest_for(&inner, partition_id) {
                let valid_until =
                    key.created_at + self.options.encryption_key_rotation_duration.as_secs();
                if now_seconds() < valid_until {
                    return Ok(Some(key.clone()));
                }
            }
        }

        self.rotate_key(partition_id).map(Some)
    }

    fn newest_for(inner: &RegistryInner, partition_id: PartitionId) -> Option<&DataKey> {
        inner
            .data_keys
            .get(&partition_id)?
            .values()
            .max_by_key(|k| k.created_at)
    }

    /// Generates a fresh random data key, appends its record and installs
    /// it as the partition's newest key.
    fn rotate_key(&self, partition_id: PartitionId) -> Result<DataKey> {
        let mut inner = self.inner.write()?;

        // Another writer may have rotated while we upgraded the lock.
        if let Some(key) = Self::newest_for(&inner, partition_id) {
            let valid_until =
                key.created_at + self.options.encryption_key_rotation_duration.as_secs();
            if now_seconds() < valid_until {
                return Ok(key.clone());
            }
        }

        let mut data = vec![0u8; self.options.encryption_key.len()];
        rand::thread_rng().fill_bytes(&mut data);

        inner.next_key_id += 1;
        let key = DataKey {
            partition_id,
            key_id: inner.next_key_id,
            data,
            iv: generate_iv().to_vec(),
            created_at: now_seconds(),
        };

        if let Some(file) = inner.file.as_mut() {
            let record = key.marshal(&self.options.encryption_key)?;
            let mut len_crc = [0u8; 8];
            BigEndian::write_u32(&mut len_crc[0..4], record.len() as u32);
            BigEndian::write_u32(&mut len_crc[4..8], checksum32(&record));
            file.write_all(&len_crc)?;
            file.write_all(&record)?;
            file.sync_all()?;
        }

        tracing::info!(partition_id, key_id = key.key_id, "rotated data key");
        inner
            .data_keys
            .entry(partition_id)
            .or_default()
            .insert(key.key_id, key.clone());
        Ok(key)
    }

    pub fn close(&self) -> Result<()> {
        self.inner.write()?.file.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &Path, key: Vec<u8>) -> KeyRegistryOptions {
        KeyRegistryOptions {
            directory: dir.to_path_buf(),
            read_only: false,
            in_memory: false,
            encryption_key: key,
            encryption_key_rotation_duration: Duration::from_secs(10 * 24 * 60 * 60),
        }
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let dir = TempDir::new().unwrap();
        let result = KeyRegistry::open(options(dir.path(), vec![0u8; 15]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_open_creates_file_and_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let registry = KeyRegistry::open(options(dir.path(), Vec::new())).unwrap();
            registry.close().unwrap();
        }
        assert!(dir.path().join(KEY_REGISTRY_FILENAME).exists());
        let registry = KeyRegistry::open(options(dir.path(), Vec::new())).unwrap();
        registry.close().unwrap();
    }

    #[test]
    fn test_plaintext_when_no_master_key() {
        let dir = TempDir::new().unwrap();
        let registry = KeyRegistry::open(options(dir.path(), Vec::new())).unwrap();
        assert_eq!(registry.latest_data_key(0).unwrap(), None);
        assert_eq!(registry.data_key(0, 0).unwrap(), None);
    }

    #[test]
    fn test_wrong_master_key_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let registry = KeyRegistry::open(options(dir.path(), vec![1u8; 16])).unwrap();
            registry.close().unwrap();
        }
        let result = KeyRegistry::open(options(dir.path(), vec![2u8; 16]));
        match result {
            Err(Error::InvalidData(msg)) => assert!(msg.contains("bad encryption key")),
            other => panic!("expected bad encryption key, got {other:?}"),
        }
    }

    #[test]
    fn test_rotation_and_reload() {
        let dir = TempDir::new().unwrap();
        let master = vec![7u8; 32];

        let key = {
            let registry = KeyRegistry::open(options(dir.path(), master.clone())).unwrap();
            let key = registry.latest_data_key(3).unwrap().unwrap();
            assert_eq!(key.partition_id, 3);
            assert_eq!(key.data.len(), 32);
            // A second call within the rotation window returns the same key.
            let again = registry.latest_data_key(3).unwrap().unwrap();
            assert_eq!(again.key_id, key.key_id);
            registry.close().unwrap();
            key
        };

        let registry = KeyRegistry::open(options(dir.path(), master)).unwrap();
        let loaded = registry.data_key(3, key.key_id).unwrap().unwrap();
        assert_eq!(loaded, key);
        registry.close().unwrap();
    }

    #[test]
    fn test_expired_key_rotates() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(dir.path(), vec![9u8; 16]);
        opts.encryption_key_rotation_duration = Duration::from_secs(0);

        let registry = KeyRegistry::open(opts).unwrap();
        let first = registry.latest_data_key(0).unwrap().unwrap();
        let second = registry.latest_data_key(0).unwrap().unwrap();
        assert_ne!(first.key_id, second.key_id);
    }

    #[test]
    fn test_unknown_ids_are_errors() {
        let dir = TempDir::new().unwrap();
        let registry = KeyRegistry::open(options(dir.path(), vec![1u8; 16])).unwrap();
        assert!(registry.data_key(42, 1).is_err());

        let key = registry.latest_data_key(0).unwrap().unwrap();
        assert!(registry.data_key(0, key.key_id + 100).is_err());
    }

    #[test]
    fn test_data_key_roundtrip_under_master_key() {
        let master = vec![5u8; 24];
        let key = DataKey {
            partition_id: 9,
            key_id: 4,
            data: vec![0xAB; 24],
            iv: generate_iv().to_vec(),
            created_at: 123456,
        };
        let encoded = key.marshal(&master).unwrap();
        // The envelope must not leak the key bytes.
        assert!(!encoded
            .windows(key.data.len())
            .any(|window| window == key.data.as_slice()));
        assert_eq!(DataKey::unmarshal(&encoded, &master).unwrap(), key);
    }

    #[test]
    fn test_xor_block_is_an_involution() {
        let key = vec![3u8; 16];
        let iv = generate_iv();
        let encrypted = xor_block(b"payload bytes", &key, &iv).unwrap();
        assert_eq!(
            xor_block(&encrypted, &key, &iv).unwrap(),
            b"payload bytes".to_vec()
        );
    }

    #[test]
    fn test_read_only_missing_file_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(dir.path(), Vec::new());
        opts.read_only = true;
        let _registry = KeyRegistry::open(opts).unwrap();
        assert!(!dir.path().join(KEY_REGISTRY_FILENAME).exists());
    }
}
