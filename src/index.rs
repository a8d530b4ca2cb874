use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bptree::BPlusTree;
use crate::config::DEFAULT_FANOUT;
use crate::rid::Rid;

/// Which structure backs a column index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Hash,
    BPlusTree,
}

/// Per-table index settings: the structure used for new indexes, the
/// B+-tree fanout, and which data columns are indexed up front (the
/// primary key always is).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub kind: IndexKind,
    pub fanout: usize,
    pub index_columns: Vec<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            kind: IndexKind::BPlusTree,
            fanout: DEFAULT_FANOUT,
            index_columns: Vec::new(),
        }
    }
}

/// Hash index: value -> bucket of base RIDs. Point lookups return the
/// whole bucket; range-by-key probes every integer in the range, while
/// range-by-value scans all entries.
#[derive(Debug, Default)]
pub struct HashIndex {
    map: HashMap<i64, Vec<Rid>>,
}

impl HashIndex {
    fn get(&self, value: i64) -> Vec<Rid> {
        self.map.get(&value).cloned().unwrap_or_default()
    }

    fn get_range_key(&self, begin: i64, end: i64) -> Vec<Rid> {
        let mut out = Vec::new();
        for value in begin..=end {
            if let Some(bucket) = self.map.get(&value) {
                out.extend_from_slice(bucket);
            }
        }
        out
    }

    fn get_range_val(&self, begin: i64, end: i64) -> Vec<Rid> {
        let mut out = Vec::new();
        for (value, bucket) in &self.map {
            if (begin..=end).contains(value) {
                out.extend_from_slice(bucket);
            }
        }
        out
    }

    fn insert(&mut self, value: i64, rid: Rid) {
        self.map.entry(value).or_default().push(rid);
    }

    fn delete(&mut self, value: i64, rid: Rid) {
        if let Some(bucket) = self.map.get_mut(&value) {
            if let Some(pos) = bucket.iter().position(|r| *r == rid) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.map.remove(&value);
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn scan_all(&self) -> Vec<(i64, Rid)> {
        let mut out = Vec::new();
        for (value, bucket) in &self.map {
            for rid in bucket {
                out.push((*value, *rid));
            }
        }
        out
    }
}

/// B+-tree index. Point lookups return the latest inserted RID for the
/// key; range queries return the latest RID per key in the range.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    tree: BPlusTree,
}

impl BPlusTreeIndex {
    fn new(fanout: usize) -> BPlusTreeIndex {
        BPlusTreeIndex {
            tree: BPlusTree::new(fanout),
        }
    }

    fn get(&self, value: i64) -> Vec<Rid> {
        match self.tree.get(value).and_then(|bucket| bucket.last()) {
            Some(rid) => vec![*rid],
            None => Vec::new(),
        }
    }

    fn get_range(&self, begin: i64, end: i64) -> Vec<Rid> {
        self.tree
            .range(begin, end)
            .into_iter()
            .filter_map(|(_, bucket)| bucket.last().copied())
            .collect()
    }
}

/// One column's index, dispatched over the configured structure. The
/// capability set is `get`, `get_range_key`, `get_range_val`, `insert`,
/// `update`, `delete`, `clear`, `scan_all`.
#[derive(Debug)]
pub enum ColumnIndex {
    Hash(HashIndex),
    BPlusTree(BPlusTreeIndex),
}

impl ColumnIndex {
    pub fn new(kind: IndexKind, fanout: usize) -> ColumnIndex {
        match kind {
            IndexKind::Hash => ColumnIndex::Hash(HashIndex::default()),
            IndexKind::BPlusTree => ColumnIndex::BPlusTree(BPlusTreeIndex::new(fanout)),
        }
    }

    pub fn get(&self, value: i64) -> Vec<Rid> {
        match self {
            ColumnIndex::Hash(index) => index.get(value),
            ColumnIndex::BPlusTree(index) => index.get(value),
        }
    }

    pub fn get_range_key(&self, begin: i64, end: i64) -> Vec<Rid> {
        match self {
            ColumnIndex::Hash(index) => index.get_range_key(begin, end),
            ColumnIndex::BPlusTree(index) => index.get_range(begin, end),
        }
    }

    pub fn get_range_val(&self, begin: i64, end: i64) -> Vec<Rid> {
        match self {
            ColumnIndex::Hash(index) => index.get_range_val(begin, end),
            ColumnIndex::BPlusTree(index) => index.get_range(begin, end),
        }
    }

    pub fn insert(&mut self, value: i64, rid: Rid) {
        match self {
            ColumnIndex::Hash(index) => index.insert(value, rid),
            ColumnIndex::BPlusTree(index) => index.tree.insert(value, rid),
        }
    }

    /// `update(old, new, rid)` is delete followed by insert.
    pub fn update(&mut self, old: i64, new: i64, rid: Rid) {
        self.delete(old, rid);
        self.insert(new, rid);
    }

    pub fn delete(&mut self, value: i64, rid: Rid) {
        match self {
            ColumnIndex::Hash(index) => index.delete(value, rid),
            ColumnIndex::BPlusTree(index) => index.tree.delete(value, rid),
        }
    }

    pub fn clear(&mut self) {
        match self {
            ColumnIndex::Hash(index) => index.clear(),
            ColumnIndex::BPlusTree(index) => index.tree.clear(),
        }
    }

    pub fn scan_all(&self) -> Vec<(i64, Rid)> {
        match self {
            ColumnIndex::Hash(index) => index.scan_all(),
            ColumnIndex::BPlusTree(index) => index.tree.scan_all(),
        }
    }
}

/// All indexes of one table: one optional slot per data column. The
/// primary key column is always indexed.
#[derive(Debug)]
pub struct Index {
    indexes: Vec<Option<ColumnIndex>>,
    key_column: usize,
    config: IndexConfig,
}

impl Index {
    pub fn new(num_columns: usize, key_column: usize, config: IndexConfig) -> Index {
        let mut indexes: Vec<Option<ColumnIndex>> = (0..num_columns).map(|_| None).collect();
        indexes[key_column] = Some(ColumnIndex::new(config.kind, config.fanout));

        for &col in &config.index_columns {
            if col < num_columns && indexes[col].is_none() {
                indexes[col] = Some(ColumnIndex::new(config.kind, config.fanout));
            }
        }

        Index {
            indexes,
            key_column,
            config,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn has_index(&self, column: usize) -> bool {
        self.indexes.get(column).map_or(false, |slot| slot.is_some())
    }

    pub fn indexed_columns(&self) -> Vec<usize> {
        self.indexes
            .iter()
            .enumerate()
            .filter_map(|(col, slot)| slot.as_ref().map(|_| col))
            .collect()
    }

    /// RIDs whose indexed value equals `value`. Unindexed columns locate
    /// nothing.
    pub fn locate(&self, column: usize, value: i64) -> Vec<Rid> {
        match self.indexes.get(column).and_then(|slot| slot.as_ref()) {
            Some(index) => index.get(value),
            None => {
                debug!(column, "locate on unindexed column");
                Vec::new()
            }
        }
    }

    /// RIDs whose indexed value falls in `[begin, end]`. The primary key
    /// ranges by key; secondary columns range by value.
    pub fn locate_range(&self, begin: i64, end: i64, column: usize) -> Vec<Rid> {
        match self.indexes.get(column).and_then(|slot| slot.as_ref()) {
            Some(index) if column == self.key_column => index.get_range_key(begin, end),
            Some(index) => index.get_range_val(begin, end),
            None => {
                debug!(column, "range locate on unindexed column");
                Vec::new()
            }
        }
    }

    /// Register a freshly inserted row in every live index.
    pub fn insert_row(&mut self, values: &[i64], rid: Rid) {
        for (col, slot) in self.indexes.iter_mut().enumerate() {
            if let Some(index) = slot {
                index.insert(values[col], rid);
            }
        }
    }

    /// Remove a row's values from every live index.
    pub fn remove_row(&mut self, values: &[i64], rid: Rid) {
        for (col, slot) in self.indexes.iter_mut().enumerate() {
            if let Some(index) = slot {
                index.delete(values[col], rid);
            }
        }
    }

    pub fn update_cell(&mut self, column: usize, old: i64, new: i64, rid: Rid) {
        if let Some(index) = self.indexes.get_mut(column).and_then(|slot| slot.as_mut()) {
            index.update(old, new, rid);
        }
    }

    pub fn insert_cell(&mut self, column: usize, value: i64, rid: Rid) {
        if let Some(index) = self.indexes.get_mut(column).and_then(|slot| slot.as_mut()) {
            index.insert(value, rid);
        }
    }

    /// Install a populated index for a column.
    pub fn set_index(&mut self, column: usize, index: ColumnIndex) {
        self.indexes[column] = Some(index);
    }

    /// Drop a secondary index. The primary key index stays.
    pub fn drop_index(&mut self, column: usize) {
        if column != self.key_column {
            self.indexes[column] = None;
        }
    }

    /// Every `(key, rid)` pair in the primary index; drives repopulation
    /// of secondary indexes.
    pub fn scan_primary(&self) -> Vec<(i64, Rid)> {
        self.indexes[self.key_column]
            .as_ref()
            .map(|index| index.scan_all())
            .unwrap_or_default()
    }

    /// Empty every live index ahead of a rebuild from disk.
    pub fn clear_all(&mut self) {
        for slot in self.indexes.iter_mut().flatten() {
            slot.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(uid: u64) -> Rid {
        Rid::from_parts(uid, 0, (uid as usize % 16) * 16, true, false)
    }

    #[test]
    fn hash_index_buckets_duplicates() {
        let mut index = ColumnIndex::new(IndexKind::Hash, DEFAULT_FANOUT);
        index.insert(10, rid(1));
        index.insert(10, rid(2));
        index.insert(20, rid(3));

        assert_eq!(index.get(10).len(), 2);
        assert_eq!(index.get(20), vec![rid(3)]);
        assert!(index.get(30).is_empty());
    }

    #[test]
    fn hash_ranges_by_key_and_value() {
        let mut index = ColumnIndex::new(IndexKind::Hash, DEFAULT_FANOUT);
        for v in [1, 3, 5, 7] {
            index.insert(v, rid(v as u64));
        }

        let mut by_key = index.get_range_key(2, 6);
        let mut by_val = index.get_range_val(2, 6);
        by_key.sort_by_key(|r| r.uid());
        by_val.sort_by_key(|r| r.uid());
        assert_eq!(by_key, vec![rid(3), rid(5)]);
        assert_eq!(by_key, by_val);
    }

    #[test]
    fn btree_point_reads_latest() {
        let mut index = ColumnIndex::new(IndexKind::BPlusTree, 4);
        index.insert(10, rid(1));
        index.insert(10, rid(2));

        assert_eq!(index.get(10), vec![rid(2)]);
    }

    #[test]
    fn update_moves_rid_between_values() {
        for kind in [IndexKind::Hash, IndexKind::BPlusTree] {
            let mut index = ColumnIndex::new(kind, 4);
            index.insert(10, rid(1));
            index.update(10, 99, rid(1));

            assert!(index.get(10).is_empty());
            assert_eq!(index.get(99), vec![rid(1)]);
        }
    }

    #[test]
    fn table_index_maintains_rows() {
        let mut index = Index::new(3, 0, IndexConfig::default());
        index.set_index(2, ColumnIndex::new(IndexKind::Hash, DEFAULT_FANOUT));

        index.insert_row(&[1, 10, 100], rid(1));
        index.insert_row(&[2, 20, 200], rid(2));

        assert_eq!(index.locate(0, 1), vec![rid(1)]);
        assert_eq!(index.locate(2, 200), vec![rid(2)]);
        assert!(index.locate(1, 10).is_empty()); // unindexed column

        index.remove_row(&[1, 10, 100], rid(1));
        assert!(index.locate(0, 1).is_empty());
        assert!(index.locate(2, 100).is_empty());
    }

    #[test]
    fn primary_range_uses_key_scan() {
        let mut index = Index::new(2, 0, IndexConfig::default());
        for k in 0..10 {
            index.insert_row(&[k, -k], rid(k as u64));
        }

        let rids = index.locate_range(3, 5, 0);
        assert_eq!(rids.len(), 3);
    }

    #[test]
    fn scan_primary_feeds_secondary_population() {
        let mut index = Index::new(2, 0, IndexConfig::default());
        for k in 0..5 {
            index.insert_row(&[k, k * 10], rid(k as u64));
        }

        let pairs = index.scan_primary();
        assert_eq!(pairs.len(), 5);
    }
}
