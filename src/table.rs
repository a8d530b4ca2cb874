use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::buffer::Buffer;
use crate::bufferpool::Bufferpool;
use crate::config::Config;
use crate::disk::Disk;
use crate::errors::{DatabaseError, Result};
use crate::index::{ColumnIndex, Index, IndexConfig, IndexKind};
use crate::locks::LockTable;
use crate::merge::{self, MergeHandle};
use crate::rid::{Rid, UidGenerator};

/// A materialized row handed back by selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    /// The value the row was looked up by.
    pub key: i64,
    /// Projected data columns, in column order.
    pub columns: Vec<i64>,
}

impl Record {
    pub fn new(rid: Rid, key: i64, columns: Vec<i64>) -> Record {
        Record { rid, key, columns }
    }
}

/// Index state and the delete tracker share one mutex: both guard the
/// primary-key invariant. Lock order is always this mutex before the pool
/// mutex.
struct IndexState {
    index: Index,
    /// Primary keys whose records are tombstoned; permits re-insert of a
    /// deleted key and is persisted across sessions.
    deleted: HashSet<i64>,
}

/// A fixed-schema table of signed integers. Coordinates the buffer, the
/// per-column indexes, the delete tracker and the background merge, and
/// enforces the primary-key invariants around insert/update/delete.
pub struct Table {
    pub name: String,
    pub num_columns: usize,
    key_column: usize,

    db_path: PathBuf,
    config: Arc<Config>,

    buffer: Buffer,
    state: Mutex<IndexState>,

    update_count: Arc<AtomicUsize>,
    merge_in_flight: Arc<AtomicBool>,
    merge: MergeHandle,

    pub(crate) locks: LockTable,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        num_columns: usize,
        key_column: usize,
        db_path: &Path,
        config: Arc<Config>,
        index_config: IndexConfig,
        rid_gen: Arc<UidGenerator>,
        base_id_gen: Arc<UidGenerator>,
        tail_id_gen: Arc<UidGenerator>,
        deleted: HashSet<i64>,
    ) -> Result<Table> {
        if num_columns == 0 || num_columns > 120 {
            return Err(DatabaseError::Metadata(format!(
                "table must have 1..=120 data columns, got {}",
                num_columns
            )));
        }
        if key_column >= num_columns {
            return Err(DatabaseError::Metadata(format!(
                "key column {} out of range for {} columns",
                key_column, num_columns
            )));
        }

        let pool = Arc::new(Bufferpool::new(
            db_path,
            num_columns,
            config.clone(),
            rid_gen,
            base_id_gen,
            tail_id_gen,
        )?);

        let update_count = Arc::new(AtomicUsize::new(0));
        let merge_in_flight = Arc::new(AtomicBool::new(false));
        let merge = merge::start_merge_worker(
            name.clone(),
            db_path,
            pool.clone(),
            config.clone(),
            update_count.clone(),
            merge_in_flight.clone(),
        );

        info!(table = %name, num_columns, key_column, "table ready");

        Ok(Table {
            name,
            num_columns,
            key_column,
            db_path: db_path.to_path_buf(),
            config,
            buffer: Buffer::new(pool),
            state: Mutex::new(IndexState {
                index: Index::new(num_columns, key_column, index_config),
                deleted,
            }),
            update_count,
            merge_in_flight,
            merge,
            locks: LockTable::new(),
        })
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    fn state(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().expect("table state mutex poisoned")
    }

    fn full_projection(&self) -> Vec<usize> {
        vec![1; self.num_columns]
    }

    fn check_arity(&self, len: usize) -> Result<()> {
        if len != self.num_columns {
            return Err(DatabaseError::Metadata(format!(
                "expected {} columns, got {}",
                self.num_columns, len
            )));
        }
        Ok(())
    }

    /// Count one tail write toward the merge threshold, firing the
    /// background merge when it trips.
    fn note_update(&self) {
        let count = self.update_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.merge_update_threshold
            && !self.merge_in_flight.swap(true, Ordering::SeqCst)
        {
            debug!(table = %self.name, count, "merge threshold reached");
            self.merge.request_merge();
        }
    }

    /// Create a new base record. Fails with `DuplicateKey` if the primary
    /// key is live; a previously deleted key may be reused.
    pub fn insert(&self, values: &[i64]) -> Result<Rid> {
        self.check_arity(values.len())?;
        let key = values[self.key_column];

        let mut state = self.state();
        if !state.index.locate(self.key_column, key).is_empty() {
            return Err(DatabaseError::DuplicateKey(key));
        }

        let rid = self.buffer.insert_record(values)?;
        state.index.insert_row(values, rid);
        state.deleted.remove(&key);
        Ok(rid)
    }

    /// Append a new version of the record with the given key. `None`
    /// columns are unchanged. Returns the base RID (used by rollback).
    pub fn update(&self, key: i64, values: &[Option<i64>]) -> Result<Rid> {
        self.check_arity(values.len())?;

        let mut state = self.state();
        let rid = *state
            .index
            .locate(self.key_column, key)
            .first()
            .ok_or(DatabaseError::MissingKey(key))?;

        let changed: Vec<usize> = values
            .iter()
            .enumerate()
            .filter_map(|(col, v)| v.map(|_| col))
            .collect();

        // A primary key change must not collide with a live key.
        if let Some(new_key) = values[self.key_column] {
            if new_key != key && !state.index.locate(self.key_column, new_key).is_empty() {
                return Err(DatabaseError::DuplicateKey(new_key));
            }
        }

        let old = if changed.is_empty() {
            Vec::new()
        } else {
            let mut projection = vec![0; self.num_columns];
            for &col in &changed {
                projection[col] = 1;
            }
            self.buffer.get_record(rid, &projection, 0)?
        };

        self.buffer.update_record(rid, values)?;

        for (pos, &col) in changed.iter().enumerate() {
            if let Some(new) = values[col] {
                state.index.update_cell(col, old[pos], new, rid);
            }
        }
        drop(state);

        self.note_update();
        Ok(rid)
    }

    /// Tombstone the record with the given key and drop it from every
    /// index. Returns the base RID (used by rollback).
    pub fn delete(&self, key: i64) -> Result<Rid> {
        let mut state = self.state();
        let rid = *state
            .index
            .locate(self.key_column, key)
            .first()
            .ok_or(DatabaseError::MissingKey(key))?;

        let latest = self.buffer.get_record(rid, &self.full_projection(), 0)?;
        self.buffer.delete_record(rid)?;

        state.index.remove_row(&latest, rid);
        state.deleted.insert(key);
        drop(state);

        self.note_update();
        Ok(rid)
    }

    /// Point select at the newest version.
    pub fn select(&self, search_key: i64, search_column: usize, projection: &[usize]) -> Result<Vec<Record>> {
        self.select_version(search_key, search_column, projection, 0)
    }

    /// Point select at a relative version (`0` newest, `-n` previous).
    pub fn select_version(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[usize],
        rel_version: i64,
    ) -> Result<Vec<Record>> {
        let rids = self.state().index.locate(search_column, search_key);
        self.read_records(rids, search_key, projection, rel_version)
    }

    /// Range select over `[begin, end]` on the given column.
    pub fn select_range(
        &self,
        begin: i64,
        end: i64,
        search_column: usize,
        projection: &[usize],
    ) -> Result<Vec<Record>> {
        self.select_range_version(begin, end, search_column, projection, 0)
    }

    pub fn select_range_version(
        &self,
        begin: i64,
        end: i64,
        search_column: usize,
        projection: &[usize],
        rel_version: i64,
    ) -> Result<Vec<Record>> {
        let rids = self.state().index.locate_range(begin, end, search_column);
        // The range scan does not know which key matched; report the range
        // start like the point path reports its search key.
        self.read_records(rids, begin, projection, rel_version)
    }

    fn read_records(
        &self,
        rids: Vec<Rid>,
        key: i64,
        projection: &[usize],
        rel_version: i64,
    ) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(rids.len());
        for rid in rids {
            match self.buffer.get_record(rid, projection, rel_version) {
                Ok(columns) => out.push(Record::new(rid, key, columns)),
                // Tombstoned rows are filtered, not errors.
                Err(DatabaseError::Deleted) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Sum one column over the primary-key range `[begin, end]` at the
    /// newest version. An empty range sums to zero.
    pub fn sum(&self, begin: i64, end: i64, column: usize) -> Result<i64> {
        self.sum_version(begin, end, column, 0)
    }

    pub fn sum_version(&self, begin: i64, end: i64, column: usize, rel_version: i64) -> Result<i64> {
        if column >= self.num_columns {
            return Err(DatabaseError::Metadata(format!(
                "no column {} to aggregate",
                column
            )));
        }
        let rids = self.state().index.locate_range(begin, end, self.key_column);

        let mut projection = vec![0; self.num_columns];
        projection[column] = 1;

        let mut sum = 0i64;
        for rid in rids {
            match self.buffer.get_record(rid, &projection, rel_version) {
                Ok(columns) => sum += columns[0],
                Err(DatabaseError::Deleted) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(sum)
    }

    /// Build a secondary index over `column` from current live data, using
    /// the table's configured index kind.
    pub fn create_index(&self, column: usize) -> Result<()> {
        let kind = self.index_config().kind;
        self.create_index_with(column, kind)
    }

    /// Same, with an explicit structure for this column.
    pub fn create_index_with(&self, column: usize, kind: IndexKind) -> Result<()> {
        if column >= self.num_columns {
            return Err(DatabaseError::Metadata(format!(
                "no column {} to index",
                column
            )));
        }

        let mut state = self.state();
        if state.index.has_index(column) {
            return Ok(());
        }

        let fanout = state.index.config().fanout;
        let mut built = ColumnIndex::new(kind, fanout);

        let mut projection = vec![0; self.num_columns];
        projection[column] = 1;

        for (_, rid) in state.index.scan_primary() {
            match self.buffer.get_record(rid, &projection, 0) {
                Ok(columns) => built.insert(columns[0], rid),
                Err(DatabaseError::Deleted) => continue,
                Err(e) => return Err(e),
            }
        }

        state.index.set_index(column, built);
        Ok(())
    }

    pub fn drop_index(&self, column: usize) {
        self.state().index.drop_index(column);
    }

    /// Undo a committed-but-rolled-back insert: the record is tombstoned
    /// and its key becomes reusable.
    pub fn rollback_insert(&self, key: i64) -> Result<()> {
        self.delete(key).map(|_| ())
    }

    /// Undo the newest update or delete of a record: pop one hop off the
    /// tail chain and repair the indexes.
    pub fn rollback_update(&self, rid: Rid) -> Result<()> {
        let mut state = self.state();
        let projection = self.full_projection();

        match self.buffer.get_record(rid, &projection, 0) {
            Ok(current) => {
                // Rolling back an update: re-point the indexes at the
                // previous values where they differ.
                self.buffer.restore_record(rid)?;
                let previous = self.buffer.get_record(rid, &projection, 0)?;
                for col in 0..self.num_columns {
                    if current[col] != previous[col] {
                        state.index.update_cell(col, current[col], previous[col], rid);
                    }
                }
            }
            Err(DatabaseError::Deleted) => {
                // Rolling back a delete: revive the record.
                self.buffer.restore_record(rid)?;
                let values = self.buffer.get_record(rid, &projection, 0)?;
                state.index.insert_row(&values, rid);
                state.deleted.remove(&values[self.key_column]);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Run one synchronous merge pass. Waits out any background pass first;
    /// only one merge may touch the staging area at a time.
    pub fn force_merge(&self) -> Result<()> {
        while self.merge_in_flight.swap(true, Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        merge::run_and_reset(
            &self.db_path,
            self.buffer.pool(),
            &self.config,
            &self.update_count,
            &self.merge_in_flight,
        )
    }

    /// Write all dirty pages through to disk.
    pub fn flush(&self) -> Result<()> {
        self.buffer.flush()
    }

    /// Stop the background merge thread. Called before the database closes.
    pub(crate) fn shutdown_merge(&self) {
        self.merge.shutdown();
    }

    /// Seal the open base stripe so the closing merge folds every stripe
    /// and the on-disk base records end up carrying latest values.
    pub(crate) fn prepare_for_close(&self) {
        self.buffer.pool().seal_open_base();
    }

    pub(crate) fn base_stripe_ids(&self) -> Vec<u64> {
        self.buffer.pool().base_stripe_ids()
    }

    pub(crate) fn tail_stripe_ids(&self) -> Vec<u64> {
        self.buffer.pool().tail_stripe_ids()
    }

    pub(crate) fn restore_stripes(&self, base_ids: Vec<u64>, tail_ids: Vec<u64>) {
        self.buffer.pool().restore_stripes(base_ids, tail_ids);
    }

    pub(crate) fn index_config(&self) -> IndexConfig {
        self.state.lock().expect("table state mutex poisoned").index.config().clone()
    }

    pub(crate) fn indexed_columns(&self) -> Vec<usize> {
        self.state().index.indexed_columns()
    }

    pub(crate) fn delete_tracker(&self) -> Vec<i64> {
        let state = self.state();
        let mut keys: Vec<i64> = state.deleted.iter().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Rehydrate every index from the base records on disk. Valid right
    /// after open: the closing session merged, so base rows hold latest
    /// values; tombstoned rows are skipped via their indirection cell.
    pub(crate) fn rebuild_indexes(&self) -> Result<()> {
        let disk = Disk::new(&self.db_path, &self.config)?;
        let stripe_ids = self.base_stripe_ids();

        let mut state = self.state();
        let columns = state.index.indexed_columns();
        state.index.clear_all();

        let mut restored = 0usize;
        for scanned in disk.scan_base_records(stripe_ids, columns.clone()) {
            let scanned = scanned?;
            if scanned.indir.tombstone() {
                continue;
            }
            for (pos, &col) in columns.iter().enumerate() {
                state.index.insert_cell(col, scanned.values[pos], scanned.rid);
            }
            restored += 1;
        }

        info!(table = %self.name, records = restored, "indexes rebuilt from disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKind;

    fn table_at(dir: &Path, config: Config, index_config: IndexConfig) -> Table {
        let config = Arc::new(config);
        let batch = config.uid_batch_size;
        Table::new(
            "Grades".to_string(),
            5,
            0,
            dir,
            config,
            index_config,
            Arc::new(UidGenerator::rid(dir, batch).unwrap()),
            Arc::new(UidGenerator::base_pages_id(dir, batch).unwrap()),
            Arc::new(UidGenerator::tail_pages_id(dir, batch).unwrap()),
            HashSet::new(),
        )
        .unwrap()
    }

    fn table() -> (tempfile::TempDir, Table) {
        let dir = tempfile::tempdir().unwrap();
        let table = table_at(dir.path(), Config::default(), IndexConfig::default());
        (dir, table)
    }

    const ALL: [usize; 5] = [1; 5];

    #[test]
    fn insert_and_select() {
        let (_dir, table) = table();
        table.insert(&[1, 10, 20, 30, 40]).unwrap();

        let records = table.select(1, 0, &ALL).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns, vec![1, 10, 20, 30, 40]);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (_dir, table) = table();
        table.insert(&[1, 10, 20, 30, 40]).unwrap();

        let err = table.insert(&[1, 50, 60, 70, 80]).unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateKey(1)));

        let records = table.select(1, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![1, 10, 20, 30, 40]);
    }

    #[test]
    fn update_and_versioned_select() {
        let (_dir, table) = table();
        table.insert(&[1, 10, 20, 30, 40]).unwrap();
        table
            .update(1, &[None, Some(15), None, Some(35), None])
            .unwrap();

        let now = table.select(1, 0, &ALL).unwrap();
        assert_eq!(now[0].columns, vec![1, 15, 20, 35, 40]);

        let before = table.select_version(1, 0, &ALL, -1).unwrap();
        assert_eq!(before[0].columns, vec![1, 10, 20, 30, 40]);
    }

    #[test]
    fn update_of_missing_key_fails() {
        let (_dir, table) = table();
        let err = table.update(9, &[None; 5]).unwrap_err();
        assert!(matches!(err, DatabaseError::MissingKey(9)));
    }

    #[test]
    fn sum_over_key_range() {
        let (_dir, table) = table();
        for k in 1..=3i64 {
            table.insert(&[k, 10 * k, 0, 0, 0]).unwrap();
        }

        assert_eq!(table.sum(1, 3, 1).unwrap(), 60);
        assert_eq!(table.sum(2, 3, 0).unwrap(), 5);
        assert_eq!(table.sum(50, 60, 1).unwrap(), 0);
    }

    #[test]
    fn delete_then_reinsert() {
        let (_dir, table) = table();
        table.insert(&[1, 10, 20, 30, 40]).unwrap();
        table.delete(1).unwrap();

        assert!(table.select(1, 0, &ALL).unwrap().is_empty());

        table.insert(&[1, 99, 0, 0, 0]).unwrap();
        let records = table.select(1, 0, &ALL).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns[1], 99);
    }

    #[test]
    fn updated_values_move_in_secondary_index() {
        let dir = tempfile::tempdir().unwrap();
        let index_config = IndexConfig {
            kind: IndexKind::Hash,
            index_columns: vec![1],
            ..IndexConfig::default()
        };
        let table = table_at(dir.path(), Config::default(), index_config);

        table.insert(&[1, 10, 0, 0, 0]).unwrap();
        table.insert(&[2, 10, 0, 0, 0]).unwrap();

        assert_eq!(table.select(10, 1, &ALL).unwrap().len(), 2);

        table.update(1, &[None, Some(11), None, None, None]).unwrap();
        assert_eq!(table.select(10, 1, &ALL).unwrap().len(), 1);
        assert_eq!(table.select(11, 1, &ALL).unwrap().len(), 1);
    }

    #[test]
    fn create_index_populates_from_live_rows() {
        let (_dir, table) = table();
        table.insert(&[1, 5, 0, 0, 0]).unwrap();
        table.insert(&[2, 6, 0, 0, 0]).unwrap();
        table.delete(2).unwrap();

        table.create_index(1).unwrap();
        assert_eq!(table.select(5, 1, &ALL).unwrap().len(), 1);
        assert!(table.select(6, 1, &ALL).unwrap().is_empty());
    }

    #[test]
    fn rollback_update_restores_values_and_index() {
        let (_dir, table) = table();
        let rid = table.insert(&[1, 10, 20, 30, 40]).unwrap();
        table.update(1, &[None, Some(15), None, None, None]).unwrap();

        table.rollback_update(rid).unwrap();
        let records = table.select(1, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![1, 10, 20, 30, 40]);
    }

    #[test]
    fn rollback_of_delete_revives_record() {
        let (_dir, table) = table();
        let rid = table.insert(&[1, 10, 20, 30, 40]).unwrap();
        table.delete(1).unwrap();

        table.rollback_update(rid).unwrap();
        let records = table.select(1, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![1, 10, 20, 30, 40]);

        // And the key is taken again.
        assert!(matches!(
            table.insert(&[1, 0, 0, 0, 0]),
            Err(DatabaseError::DuplicateKey(1))
        ));
    }

    #[test]
    fn force_merge_preserves_reads_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_at(dir.path(), Config::default(), IndexConfig::default());

        let per_page = Config::default().records_per_page() as i64;
        for k in 0..per_page + 1 {
            table.insert(&[k, k * 2, 0, 0, 0]).unwrap();
        }
        for k in 0..10 {
            table
                .update(k, &[None, Some(1000 + k), None, None, None])
                .unwrap();
        }

        table.force_merge().unwrap();

        for k in 0..10 {
            let records = table.select(k, 0, &ALL).unwrap();
            assert_eq!(records[0].columns[1], 1000 + k);
            let old = table.select_version(k, 0, &ALL, -1).unwrap();
            assert_eq!(old[0].columns[1], k * 2);
        }
        for k in 10..per_page {
            let records = table.select(k, 0, &ALL).unwrap();
            assert_eq!(records[0].columns[1], k * 2);
        }

        // Post-merge updates still layer on top.
        table.update(0, &[None, None, Some(7), None, None]).unwrap();
        let records = table.select(0, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![0, 1000, 7, 0, 0]);

        table.shutdown_merge();
    }

    #[test]
    fn rollback_after_merge_recovers_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_at(dir.path(), Config::default(), IndexConfig::default());

        let per_page = Config::default().records_per_page() as i64;
        for k in 0..per_page + 1 {
            table.insert(&[k, k, 0, 0, 0]).unwrap();
        }
        let rid = *table
            .state()
            .index
            .locate(0, 3)
            .first()
            .expect("key 3 indexed");

        table.update(3, &[None, Some(333), None, None, None]).unwrap();
        table.force_merge().unwrap();

        // The update was folded into the base; rolling it back must still
        // surface the pre-update values.
        table.rollback_update(rid).unwrap();
        let records = table.select(3, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![3, 3, 0, 0, 0]);

        table.shutdown_merge();
    }

    #[test]
    fn merge_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_at(dir.path(), Config::default(), IndexConfig::default());

        let per_page = Config::default().records_per_page() as i64;
        for k in 0..per_page + 1 {
            table.insert(&[k, k, k, k, k]).unwrap();
        }
        table.update(5, &[None, Some(-5), None, None, None]).unwrap();

        table.force_merge().unwrap();
        let first = table.select(5, 0, &ALL).unwrap();

        table.force_merge().unwrap();
        let second = table.select(5, 0, &ALL).unwrap();

        assert_eq!(first, second);
        table.shutdown_merge();
    }
}
