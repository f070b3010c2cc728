use std::hash::Hasher;

use crc::{Crc, CRC_32_ISCSI};
use twox_hash::XxHash32;

/// CRC-32 (Castagnoli) used to frame value log records.
pub const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// xxHash32 with a zero seed, used to frame manifest change sets and key
/// registry records.
pub fn checksum32(data: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(data);
    hasher.finish() as u32
}

/// CRC-32 (Castagnoli) of the given bytes.
pub fn crc32(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}
