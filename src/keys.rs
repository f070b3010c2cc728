//! Timestamped key handling and the wire formats for values and value
//! pointers.
//!
//! A stored key is the user key with an 8 byte big-endian `u64::MAX - ts`
//! suffix, so that newer versions of the same user key sort before older
//! ones while distinct user keys keep their byte order.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

/// Size of the commit-timestamp suffix on every stored key.
pub const TIMESTAMP_SIZE: usize = 8;

/// Encoded size of a [`ValuePointer`].
pub const VALUE_POINTER_SIZE: usize = 12;

/// Appends the inverted commit timestamp to a user key.
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + TIMESTAMP_SIZE);
    out.extend_from_slice(key);
    out.extend_from_slice(&(u64::MAX - ts).to_be_bytes());
    out
}

/// Strips the timestamp suffix, returning the user key.
pub fn parse_key(key: &[u8]) -> &[u8] {
    if key.len() < TIMESTAMP_SIZE {
        return key;
    }
    &key[..key.len() - TIMESTAMP_SIZE]
}

/// Extracts the commit timestamp from a stored key.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() <= TIMESTAMP_SIZE {
        return 0;
    }
    u64::MAX - BigEndian::read_u64(&key[key.len() - TIMESTAMP_SIZE..])
}

/// Compares two stored keys: user prefix first, then the inverted
/// timestamp suffix. Because the suffix stores `u64::MAX - ts`, a higher
/// timestamp sorts strictly before a lower one for the same user key.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert!(a.len() >= TIMESTAMP_SIZE && b.len() >= TIMESTAMP_SIZE);
    let (a_key, a_ts) = a.split_at(a.len() - TIMESTAMP_SIZE);
    let (b_key, b_ts) = b.split_at(b.len() - TIMESTAMP_SIZE);
    match a_key.cmp(b_key) {
        Ordering::Equal => a_ts.cmp(b_ts),
        other => other,
    }
}

/// Checks user-key equality, ignoring the timestamp suffix.
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    parse_key(a) == parse_key(b)
}

/// The value info associated with a stored key, including the internal
/// meta byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStruct {
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
    pub value: Vec<u8>,

    /// Commit timestamp of the key this value was read under. Not
    /// serialized.
    pub version: u64,
}

impl ValueStruct {
    /// Size of this value once marshalled.
    pub fn encoded_size(&self) -> u32 {
        2 + 8 + self.value.len() as u32
    }

    /// Encodes into `dst`, which must hold at least `encoded_size` bytes.
    pub fn marshal(&self, dst: &mut [u8]) {
        dst[0] = self.meta;
        dst[1] = self.user_meta;
        BigEndian::write_u64(&mut dst[2..10], self.expires_at);
        dst[10..10 + self.value.len()].copy_from_slice(&self.value);
    }

    /// Decodes from `src`, which must hold at least 10 bytes.
    pub fn unmarshal(src: &[u8]) -> ValueStruct {
        ValueStruct {
            meta: src[0],
            user_meta: src[1],
            expires_at: BigEndian::read_u64(&src[2..10]),
            value: src[10..].to_vec(),
            version: 0,
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_size() as usize];
        self.marshal(&mut buf);
        buf
    }
}

/// Position of a record inside the value log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValuePointer {
    pub file_id: u32,
    pub len: u32,
    pub offset: u32,
}

impl ValuePointer {
    pub fn is_zero(&self) -> bool {
        self.file_id == 0 && self.len == 0 && self.offset == 0
    }

    pub fn encode(&self) -> [u8; VALUE_POINTER_SIZE] {
        let mut buf = [0u8; VALUE_POINTER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.file_id);
        BigEndian::write_u32(&mut buf[4..8], self.len);
        BigEndian::write_u32(&mut buf[8..12], self.offset);
        buf
    }

    pub fn decode(src: &[u8]) -> ValuePointer {
        ValuePointer {
            file_id: BigEndian::read_u32(&src[0..4]),
            len: BigEndian::read_u32(&src[4..8]),
            offset: BigEndian::read_u32(&src[8..12]),
        }
    }
}

/// Bit on [`ValueStruct::meta`] marking the value as a value pointer into
/// the value log rather than an inline value.
pub const META_VALUE_POINTER: u8 = 1 << 1;

/// A single write submitted by a caller. A batch may span partitions; the
/// whole batch commits under one timestamp.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub partition_id: crate::PartitionId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
    pub expires_at: u64,
    pub(crate) meta: u8,
}

impl Entry {
    pub fn new(partition_id: crate::PartitionId, key: Vec<u8>, value: Vec<u8>) -> Entry {
        Entry {
            partition_id,
            key,
            value,
            ..Default::default()
        }
    }

    /// Contribution of this entry to the write batch size, depending on
    /// whether the value stays inline or moves to the value log.
    pub(crate) fn estimate_size(&self, threshold: usize) -> u64 {
        if self.value.len() < threshold {
            (self.key.len() + self.value.len() + 2) as u64
        } else {
            (self.key.len() + VALUE_POINTER_SIZE + 2) as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_pointer_roundtrip() {
        let vp = ValuePointer {
            file_id: 3049,
            offset: 353928,
            len: 2839,
        };
        let encoded = vp.encode();
        assert_eq!(encoded.len(), VALUE_POINTER_SIZE);
        assert_eq!(ValuePointer::decode(&encoded), vp);
    }

    #[test]
    fn test_value_struct_roundtrip() {
        let vs = ValueStruct {
            meta: 3,
            user_meta: 7,
            expires_at: 1234567890,
            value: b"hello".to_vec(),
            version: 0,
        };
        let buf = vs.to_vec();
        assert_eq!(buf.len(), 10 + 5);
        assert_eq!(ValueStruct::unmarshal(&buf), vs);
    }

    #[test]
    fn test_key_with_ts_roundtrip() {
        let key = key_with_ts(b"alpha", 42);
        assert_eq!(parse_key(&key), b"alpha");
        assert_eq!(parse_ts(&key), 42);
    }

    #[test]
    fn test_newer_versions_sort_first() {
        let old = key_with_ts(b"alpha", 1);
        let new = key_with_ts(b"alpha", 9);
        assert_eq!(compare_keys(&new, &old), Ordering::Less);
        assert_eq!(compare_keys(&old, &new), Ordering::Greater);
        assert_eq!(compare_keys(&new, &new.clone()), Ordering::Equal);
    }

    #[test]
    fn test_user_key_order_dominates() {
        // "a" must sort before "aa" regardless of timestamps.
        let a = key_with_ts(b"a", 1);
        let aa = key_with_ts(b"aa", 100);
        assert_eq!(compare_keys(&a, &aa), Ordering::Less);
    }

    #[test]
    fn test_same_key_ignores_timestamp() {
        let a = key_with_ts(b"alpha", 1);
        let b = key_with_ts(b"alpha", 2);
        let c = key_with_ts(b"beta", 1);
        assert!(same_key(&a, &b));
        assert!(!same_key(&a, &c));
    }
}
