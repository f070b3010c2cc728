//! Fixed-size wire format for manifest changes.
//!
//! Every change is exactly [`MANIFEST_CHANGE_SIZE`] bytes:
//!
//! ```text
//! +------------+----------+--------+-------+----------+--------+-------+
//! | Partition  | TableId  | Op     | Level | KeyId    | EncAlg | Compr |
//! | 4 BE       | 8 BE     | 1      | 1     | 8 BE     | 1      | 1     |
//! +------------+----------+--------+-------+----------+--------+-------+
//! ```
//!
//! A change set is a 4 byte big-endian count followed by that many changes.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::options::CompressionType;
use crate::PartitionId;

/// Encoded size of one [`ManifestChange`].
pub const MANIFEST_CHANGE_SIZE: usize = 4 + 8 + 1 + 1 + 8 + 1 + 1;

/// The only encryption algorithm currently written to disk.
pub const ENCRYPTION_ALGORITHM_AES: u8 = 0;

/// What a manifest change does to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> u8 {
        match op {
            Operation::Create => 0,
            Operation::Delete => 1,
        }
    }
}

impl TryFrom<u8> for Operation {
    type Error = Error;

    fn try_from(v: u8) -> Result<Operation> {
        match v {
            0 => Ok(Operation::Create),
            1 => Ok(Operation::Delete),
            _ => Err(Error::BadOperation),
        }
    }
}

/// One table creation or deletion recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestChange {
    pub partition_id: PartitionId,
    pub table_id: u64,
    pub operation: Operation,
    pub level: u8,
    pub key_id: u64,
    pub encryption_algorithm: u8,
    pub compression: u8,
}

impl ManifestChange {
    pub fn new_create(
        partition_id: PartitionId,
        table_id: u64,
        level: u8,
        key_id: u64,
        compression: CompressionType,
    ) -> ManifestChange {
        ManifestChange {
            partition_id,
            table_id,
            operation: Operation::Create,
            level,
            key_id,
            encryption_algorithm: ENCRYPTION_ALGORITHM_AES,
            compression: compression.into(),
        }
    }

    pub fn new_delete(partition_id: PartitionId, table_id: u64) -> ManifestChange {
        ManifestChange {
            partition_id,
            table_id,
            operation: Operation::Delete,
            level: 0,
            key_id: 0,
            encryption_algorithm: ENCRYPTION_ALGORITHM_AES,
            compression: 0,
        }
    }

    pub fn marshal(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < MANIFEST_CHANGE_SIZE {
            return Err(crate::errdata!(
                "cannot marshal manifest change, buffer too small. need: {} got: {}",
                MANIFEST_CHANGE_SIZE,
                dst.len()
            ));
        }
        BigEndian::write_u32(&mut dst[0..4], self.partition_id);
        BigEndian::write_u64(&mut dst[4..12], self.table_id);
        dst[12] = self.operation.into();
        dst[13] = self.level;
        BigEndian::write_u64(&mut dst[14..22], self.key_id);
        dst[22] = self.encryption_algorithm;
        dst[23] = self.compression;
        Ok(())
    }

    pub fn unmarshal(src: &[u8]) -> Result<ManifestChange> {
        if src.len() < MANIFEST_CHANGE_SIZE {
            return Err(crate::errdata!(
                "cannot unmarshal manifest change, buffer too small. need: {} got: {}",
                MANIFEST_CHANGE_SIZE,
                src.len()
            ));
        }
        Ok(ManifestChange {
            partition_id: BigEndian::read_u32(&src[0..4]),
            table_id: BigEndian::read_u64(&src[4..12]),
            operation: Operation::try_from(src[12])?,
            level: src[13],
            key_id: BigEndian::read_u64(&src[14..22]),
            encryption_algorithm: src[22],
            compression: src[23],
        })
    }
}

/// A batch of changes written and replayed as one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestChangeSet {
    pub changes: Vec<ManifestChange>,
}

impl ManifestChangeSet {
    pub fn new(changes: Vec<ManifestChange>) -> ManifestChangeSet {
        ManifestChangeSet { changes }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4 + MANIFEST_CHANGE_SIZE * self.changes.len()];
        BigEndian::write_u32(&mut buf[0..4], self.changes.len() as u32);
        for (i, change) in self.changes.iter().enumerate() {
            let start = 4 + i * MANIFEST_CHANGE_SIZE;
            // The buffer was sized above, marshal cannot fail here.
            change.marshal(&mut buf[start..start + MANIFEST_CHANGE_SIZE]).unwrap();
        }
        buf
    }

    pub fn unmarshal(src: &[u8]) -> Result<ManifestChangeSet> {
        if src.len() < 4 {
            return Err(crate::errdata!(
                "manifest change set must be at least 4 bytes"
            ));
        }
        let count = BigEndian::read_u32(&src[0..4]) as usize;
        let expected = 4 + MANIFEST_CHANGE_SIZE * count;
        if src.len() < expected {
            return Err(crate::errdata!(
                "cannot unmarshal manifest change set, source too short. expected: {} got: {}",
                expected,
                src.len()
            ));
        }
        let mut changes = Vec::with_capacity(count);
        for i in 0..count {
            let start = 4 + i * MANIFEST_CHANGE_SIZE;
            changes.push(ManifestChange::unmarshal(
                &src[start..start + MANIFEST_CHANGE_SIZE],
            )?);
        }
        Ok(ManifestChangeSet { changes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_roundtrip_is_24_bytes() {
        let change = ManifestChange::new_create(7, 42, 3, 99, CompressionType::Snappy);
        let mut buf = [0u8; MANIFEST_CHANGE_SIZE];
        change.marshal(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(ManifestChange::unmarshal(&buf).unwrap(), change);
    }

    #[test]
    fn test_delete_change_roundtrip() {
        let change = ManifestChange::new_delete(1, 1000);
        let mut buf = [0u8; MANIFEST_CHANGE_SIZE];
        change.marshal(&mut buf).unwrap();
        let decoded = ManifestChange::unmarshal(&buf).unwrap();
        assert_eq!(decoded.operation, Operation::Delete);
        assert_eq!(decoded, change);
    }

    #[test]
    fn test_change_set_roundtrip() {
        let set = ManifestChangeSet::new(vec![
            ManifestChange::new_create(0, 1, 0, 0, CompressionType::None),
            ManifestChange::new_delete(0, 0),
        ]);
        let buf = set.marshal();
        assert_eq!(buf.len(), 4 + 2 * MANIFEST_CHANGE_SIZE);
        assert_eq!(ManifestChangeSet::unmarshal(&buf).unwrap(), set);
    }

    #[test]
    fn test_unmarshal_rejects_short_buffer() {
        let change = ManifestChange::new_create(0, 1, 0, 0, CompressionType::None);
        let mut buf = [0u8; MANIFEST_CHANGE_SIZE];
        change.marshal(&mut buf).unwrap();
        assert!(ManifestChange::unmarshal(&buf[..20]).is_err());
    }

    #[test]
    fn test_unmarshal_rejects_bad_operation() {
        let change = ManifestChange::new_create(0, 1, 0, 0, CompressionType::None);
        let mut buf = [0u8; MANIFEST_CHANGE_SIZE];
        change.marshal(&mut buf).unwrap();
        buf[12] = 0xFF;
        assert_eq!(
            ManifestChange::unmarshal(&buf),
            Err(crate::Error::BadOperation)
        );
    }

    #[test]
    fn test_change_set_count_mismatch() {
        let set = ManifestChangeSet::new(vec![ManifestChange::new_delete(0, 3)]);
        let mut buf = set.marshal();
        // Claim two changes while only one is present.
        BigEndian::write_u32(&mut buf[0..4], 2);
        assert!(ManifestChangeSet::unmarshal(&buf).is_err());
    }
}
