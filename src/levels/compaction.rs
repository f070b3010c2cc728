//! Compaction bookkeeping: key ranges, in-flight range locking, and the
//! merge iterator that produces compacted output.
//!
//! Mutual exclusion between compactions is not a per-level mutex: each
//! partition tracks the key ranges currently being compacted per level,
//! and a new compaction is admitted only if its ranges are disjoint from
//! every in-flight one.

use std::sync::Arc;

use crate::keys::compare_keys;
use crate::table::{Table, TableIterator};
use crate::PartitionId;

/// A closed interval of stored keys, or the infinite range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    pub infinite: bool,
}

impl KeyRange {
    pub fn new(left: Vec<u8>, right: Vec<u8>) -> KeyRange {
        KeyRange {
            left,
            right,
            infinite: false,
        }
    }

    pub fn infinite() -> KeyRange {
        KeyRange {
            left: Vec::new(),
            right: Vec::new(),
            infinite: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty() && !self.infinite
    }

    /// Ranges overlap unless strictly disjoint; the infinite range
    /// overlaps everything.
    pub fn overlaps_with(&self, other: &KeyRange) -> bool {
        if self.infinite || other.infinite {
            return true;
        }
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if compare_keys(&self.left, &other.right).is_gt() {
            return false;
        }
        if compare_keys(&self.right, &other.left).is_lt() {
            return false;
        }
        true
    }
}

/// The joint key range covered by a set of tables.
pub fn key_range_of(tables: &[Arc<Table>]) -> KeyRange {
    let mut iter = tables.iter();
    let first = match iter.next() {
        Some(table) => table,
        None => return KeyRange::default(),
    };
    let mut left = first.smallest().to_vec();
    let mut right = first.biggest().to_vec();
    for table in iter {
        if compare_keys(table.smallest(), &left).is_lt() {
            left = table.smallest().to_vec();
        }
        if compare_keys(table.biggest(), &right).is_gt() {
            right = table.biggest().to_vec();
        }
    }
    KeyRange::new(left, right)
}

/// A unit of work the compaction scheduler hands to a worker.
#[derive(Debug, Clone)]
pub struct CompactionPriority {
    pub partition_id: PartitionId,
    pub level: usize,
    pub score: f64,
    pub drop_prefix: Option<Vec<u8>>,
}

/// A fully planned compaction: which tables move from which level to
/// which, and the key ranges reserved while it runs.
pub struct CompactDef {
    pub partition_id: PartitionId,
    pub this_level: usize,
    pub next_level: usize,
    pub top: Vec<Arc<Table>>,
    pub bot: Vec<Arc<Table>>,
    pub this_range: KeyRange,
    pub next_range: KeyRange,
    pub drop_prefix: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct LevelCompactStatus {
    pub ranges: Vec<KeyRange>,
    /// Bytes expected to disappear from the level once the in-flight
    /// compactions commit; subtracted when scoring.
    pub delete_size: u64,
}

impl LevelCompactStatus {
    fn overlaps_with(&self, range: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps_with(range))
    }

    fn remove(&mut self, range: &KeyRange) -> bool {
        let before = self.ranges.len();
        self.ranges.retain(|r| r != range);
        before != self.ranges.len()
    }
}

/// Per-partition record of in-flight compactions.
#[derive(Default)]
pub struct CompactStatus {
    pub levels: Vec<LevelCompactStatus>,
}

impl CompactStatus {
    pub fn new(max_levels: usize) -> CompactStatus {
        let mut levels = Vec::with_capacity(max_levels);
        levels.resize_with(max_levels, LevelCompactStatus::default);
        CompactStatus { levels }
    }

    /// Reserves the compaction's key ranges if they collide with nothing
    /// in flight on either level. Returns false (reserving nothing) on
    /// collision.
    pub fn compare_and_add(&mut self, cd: &CompactDef) -> bool {
        if self.levels[cd.this_level].overlaps_with(&cd.this_range)
            || self.levels[cd.next_level].overlaps_with(&cd.next_range)
        {
            return false;
        }
        self.levels[cd.this_level].ranges.push(cd.this_range.clone());
        if cd.next_level != cd.this_level {
            self.levels[cd.next_level].ranges.push(cd.next_range.clone());
        }
        self.levels[cd.this_level].delete_size +=
            cd.top.iter().map(|t| t.size()).sum::<u64>();
        true
    }

    /// Releases the ranges reserved by `compare_and_add`.
    pub fn delete(&mut self, cd: &CompactDef) {
        let removed = self.levels[cd.this_level].remove(&cd.this_range);
        debug_assert!(removed, "releasing a range that was never reserved");
        if cd.next_level != cd.this_level {
            self.levels[cd.next_level].remove(&cd.next_range);
        }
        self.levels[cd.this_level].delete_size -=
            cd.top.iter().map(|t| t.size()).sum::<u64>();
    }

    pub fn delete_size(&self, level: usize) -> u64 {
        self.levels[level].delete_size
    }
}

/// K-way merge over table iterators in stored-key order.
///
/// Sources must be ordered newest first: when two sources carry the exact
/// same stored key, the entry from the earlier source wins and the
/// duplicates are skipped.
pub struct MergeIterator<'a> {
    sources: Vec<TableIterator<'a>>,
}

impl<'a> MergeIterator<'a> {
    pub fn new(sources: Vec<TableIterator<'a>>) -> MergeIterator<'a> {
        MergeIterator { sources }
    }

    /// Pops the next entry in order, or `None` when drained.
    pub fn next_entry(&mut self) -> Option<(Vec<u8>, crate::keys::ValueStruct)> {
        let mut winner: Option<usize> = None;
        for (i, source) in self.sources.iter().enumerate() {
            if !source.valid() {
                continue;
            }
            match winner {
                None => winner = Some(i),
                Some(w) => {
                    if compare_keys(source.key(), self.sources[w].key()).is_lt() {
                        winner = Some(i);
                    }
                }
            }
        }

        let winner = winner?;
        let key = self.sources[winner].key().to_vec();
        let value = self.sources[winner].value();

        // Advance the winner and every source holding the same stored key.
        for source in self.sources.iter_mut() {
            if source.valid() && source.key() == key.as_slice() {
                source.next();
            }
        }
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{key_with_ts, ValueStruct};
    use crate::table::{new_filename, Builder};
    use tempfile::TempDir;

    fn range(left: &[u8], right: &[u8]) -> KeyRange {
        KeyRange::new(key_with_ts(left, u64::MAX), key_with_ts(right, 0))
    }

    #[test]
    fn test_overlap_rules() {
        assert!(range(b"a", b"m").overlaps_with(&range(b"k", b"z")));
        assert!(!range(b"a", b"c").overlaps_with(&range(b"k", b"z")));
        assert!(KeyRange::infinite().overlaps_with(&range(b"a", b"b")));
        assert!(range(b"a", b"b").overlaps_with(&KeyRange::infinite()));
        // Touching boundaries overlap: only strict disjointness passes.
        assert!(range(b"a", b"k").overlaps_with(&range(b"k", b"z")));
    }

    #[test]
    fn test_empty_range_never_overlaps() {
        assert!(!KeyRange::default().overlaps_with(&range(b"a", b"z")));
        assert!(!range(b"a", b"z").overlaps_with(&KeyRange::default()));
    }

    #[test]
    fn test_compare_and_add_blocks_collisions() {
        let dir = TempDir::new().unwrap();
        let table = sample_table(&dir, 1, &[(b"c", 1), (b"h", 1)]);

        let mut status = CompactStatus::new(3);
        let cd = CompactDef {
            partition_id: 0,
            this_level: 0,
            next_level: 1,
            top: vec![table.clone()],
            bot: vec![],
            this_range: range(b"a", b"m"),
            next_range: range(b"a", b"m"),
            drop_prefix: None,
        };
        assert!(status.compare_and_add(&cd));

        let overlapping = CompactDef {
            this_range: range(b"k", b"z"),
            next_range: range(b"k", b"z"),
            top: vec![table.clone()],
            bot: vec![],
            partition_id: 0,
            this_level: 0,
            next_level: 1,
            drop_prefix: None,
        };
        assert!(!status.compare_and_add(&overlapping));

        status.delete(&cd);
        let mut status2 = status;
        assert!(status2.compare_and_add(&overlapping));
    }

    fn sample_table(dir: &TempDir, file_id: u64, keys: &[(&[u8], u64)]) -> Arc<Table> {
        let mut builder = Builder::new();
        let mut sorted: Vec<_> = keys.to_vec();
        sorted.sort_by(|a, b| compare_keys(&key_with_ts(a.0, a.1), &key_with_ts(b.0, b.1)));
        for (key, ts) in sorted {
            builder.add(
                &key_with_ts(key, ts),
                &ValueStruct {
                    value: key.to_vec(),
                    ..Default::default()
                },
            );
        }
        Arc::new(
            builder
                .finish(&new_filename(0, file_id, dir.path()), None)
                .unwrap(),
        )
    }

    #[test]
    fn test_key_range_of_tables() {
        let dir = TempDir::new().unwrap();
        let t1 = sample_table(&dir, 1, &[(b"d", 1), (b"f", 1)]);
        let t2 = sample_table(&dir, 2, &[(b"a", 1), (b"z", 1)]);

        let kr = key_range_of(&[t1, t2]);
        assert_eq!(crate::keys::parse_key(&kr.left), b"a");
        assert_eq!(crate::keys::parse_key(&kr.right), b"z");
    }

    #[test]
    fn test_merge_iterator_orders_and_dedupes() {
        let dir = TempDir::new().unwrap();
        // Newer table shadows the older one's identical stored key.
        let newer = sample_table(&dir, 2, &[(b"a", 5), (b"c", 5)]);
        let older = sample_table(&dir, 1, &[(b"a", 5), (b"b", 1)]);

        let mut merge = MergeIterator::new(vec![newer.iter(), older.iter()]);
        let mut keys = Vec::new();
        while let Some((key, _)) = merge.next_entry() {
            keys.push((
                crate::keys::parse_key(&key).to_vec(),
                crate::keys::parse_ts(&key),
            ));
        }
        assert_eq!(
            keys,
            vec![
                (b"a".to_vec(), 5),
                (b"b".to_vec(), 1),
                (b"c".to_vec(), 5),
            ]
        );
    }

    #[test]
    fn test_merge_iterator_interleaves_versions() {
        let dir = TempDir::new().unwrap();
        let t1 = sample_table(&dir, 1, &[(b"k", 3)]);
        let t2 = sample_table(&dir, 2, &[(b"k", 7)]);

        let mut merge = MergeIterator::new(vec![t2.iter(), t1.iter()]);
        let mut versions = Vec::new();
        while let Some((key, _)) = merge.next_entry() {
            versions.push(crate::keys::parse_ts(&key));
        }
        // Newest version of the same user key first.
        assert_eq!(versions, vec![7, 3]);
    }
}
