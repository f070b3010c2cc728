//! One level of one partition's LSM tree.

use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::keys::{compare_keys, ValueStruct};
use crate::table::Table;

use super::compaction::KeyRange;

struct HandlerTables {
    /// For level >= 1, sorted by key range; ranges do not overlap.
    /// For level 0, sorted by file id: newest table at the back.
    tables: Vec<Arc<Table>>,
    total_size: u64,
}

pub struct LevelHandler {
    level: u8,
    /// Total-size budget; 0 for level zero, which is bounded by count.
    max_total_size: u64,
    inner: RwLock<HandlerTables>,
}

impl LevelHandler {
    pub fn new(level: u8, max_total_size: u64) -> LevelHandler {
        LevelHandler {
            level,
            max_total_size,
            inner: RwLock::new(HandlerTables {
                tables: Vec::new(),
                total_size: 0,
            }),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn max_total_size(&self) -> u64 {
        self.max_total_size
    }

    /// Replaces the level's tables during startup loading.
    pub fn init_tables(&self, mut tables: Vec<Arc<Table>>) {
        let total_size = tables.iter().map(|t| t.size()).sum();
        if self.level == 0 {
            // Key ranges overlap; newest tables (highest file id) go last.
            tables.sort_by_key(|t| t.file_id());
        } else {
            tables.sort_by(|a, b| compare_keys(a.smallest(), b.smallest()));
        }
        let mut inner = self.inner.write().unwrap();
        inner.tables = tables;
        inner.total_size = total_size;
    }

    pub fn num_tables(&self) -> usize {
        self.inner.read().unwrap().tables.len()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.read().unwrap().total_size
    }

    /// A snapshot of the level's tables.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.inner.read().unwrap().tables.clone()
    }

    /// Appends a freshly flushed table. Level zero only.
    pub fn add_l0_table(&self, table: Arc<Table>) {
        debug_assert_eq!(self.level, 0);
        let mut inner = self.inner.write().unwrap();
        inner.total_size += table.size();
        inner.tables.push(table);
    }

    /// Looks up the newest visible version of the key on this level.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let inner = self.inner.read().unwrap();
        if self.level == 0 {
            // Tables overlap: check all, newest first, and keep the highest
            // version found.
            let mut best: Option<ValueStruct> = None;
            for table in inner.tables.iter().rev() {
                if let Some(found) = table.get(key) {
                    match &best {
                        Some(current) if current.version >= found.version => {}
                        _ => best = Some(found),
                    }
                }
            }
            return Ok(best);
        }

        // Non-overlapping ranges: binary search the covering table.
        let tables = &inner.tables;
        let idx = tables.partition_point(|t| compare_keys(t.biggest(), key).is_lt());
        if idx >= tables.len() {
            return Ok(None);
        }
        let table = &tables[idx];
        if compare_keys(key, table.smallest()).is_lt() {
            return Ok(None);
        }
        Ok(table.get(key))
    }

    /// Index range `[left, right)` of tables overlapping the key range.
    /// Level >= 1 only.
    pub fn overlapping_tables(&self, range: &KeyRange) -> (usize, usize) {
        debug_assert!(self.level > 0);
        if range.left.is_empty() && range.right.is_empty() && !range.infinite {
            return (0, 0);
        }
        let inner = self.inner.read().unwrap();
        if range.infinite {
            return (0, inner.tables.len());
        }
        let left = inner
            .tables
            .partition_point(|t| compare_keys(t.biggest(), &range.left).is_lt());
        let right = inner
            .tables
            .partition_point(|t| compare_keys(t.smallest(), &range.right).is_le());
        (left, right)
    }

    /// Swaps out `to_delete` for `to_add` after a compaction into this
    /// level.
    pub fn replace_tables(&self, to_delete: &[Arc<Table>], to_add: Vec<Arc<Table>>) {
        let mut inner = self.inner.write().unwrap();
        let delete_ids: Vec<u64> = to_delete.iter().map(|t| t.file_id()).collect();
        inner.tables.retain(|t| !delete_ids.contains(&t.file_id()));
        inner.tables.extend(to_add);
        if self.level == 0 {
            inner.tables.sort_by_key(|t| t.file_id());
        } else {
            inner
                .tables
                .sort_by(|a, b| compare_keys(a.smallest(), b.smallest()));
        }
        inner.total_size = inner.tables.iter().map(|t| t.size()).sum();
    }

    /// Removes compacted-away tables from this level.
    pub fn delete_tables(&self, to_delete: &[Arc<Table>]) {
        self.replace_tables(to_delete, Vec::new());
    }

    /// Checks the level's ordering invariants: within every table
    /// smallest <= largest, and adjacent tables on level >= 1 do not
    /// overlap.
    pub fn validate(&self) -> Result<()> {
        if self.level == 0 {
            return Ok(());
        }
        let inner = self.inner.read().unwrap();
        let tables = &inner.tables;
        for j in 1..tables.len() {
            if compare_keys(tables[j - 1].biggest(), tables[j].smallest()).is_ge() {
                return Err(crate::errdata!(
                    "inter: largest(j-1) {:?} >= smallest(j) {:?}: level={} j={} numTables={}",
                    tables[j - 1].biggest(),
                    tables[j].smallest(),
                    self.level,
                    j,
                    tables.len()
                ));
            }
        }
        for (j, table) in tables.iter().enumerate() {
            if compare_keys(table.smallest(), table.biggest()).is_gt() {
                return Err(crate::errdata!(
                    "intra: {:?} vs {:?}: level={} j={} numTables={}",
                    table.smallest(),
                    table.biggest(),
                    self.level,
                    j,
                    tables.len()
                ));
            }
        }
        Ok(())
    }

    /// Drops the level's table handles. Files stay on disk.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.tables.clear();
        inner.total_size = 0;
        Ok(())
    }
}
