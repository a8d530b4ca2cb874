use std::sync::Arc;

use crate::bufferpool::Bufferpool;
use crate::errors::Result;
use crate::rid::Rid;

/// Thin adapter between the table layer and the bufferpool: the table
/// thinks in records and RIDs, the pool in stripes and cells.
pub struct Buffer {
    pool: Arc<Bufferpool>,
}

impl Buffer {
    pub fn new(pool: Arc<Bufferpool>) -> Buffer {
        Buffer { pool }
    }

    pub fn pool(&self) -> &Arc<Bufferpool> {
        &self.pool
    }

    /// Insert a record, returning the base RID to store in the index.
    pub fn insert_record(&self, values: &[i64]) -> Result<Rid> {
        self.pool.insert(values)
    }

    /// Append a new version; `None` columns keep their previous value.
    pub fn update_record(&self, rid: Rid, values: &[Option<i64>]) -> Result<Rid> {
        self.pool.update(rid, values)
    }

    /// Projected read at a relative version (0 newest, -n previous).
    pub fn get_record(&self, rid: Rid, projection: &[usize], rel_version: i64) -> Result<Vec<i64>> {
        self.pool.read(rid, projection, rel_version)
    }

    /// Mark a record deleted via a tombstone tail.
    pub fn delete_record(&self, rid: Rid) -> Result<Rid> {
        self.pool.delete(rid)
    }

    /// Undo the newest version (single-update rollback).
    pub fn restore_record(&self, rid: Rid) -> Result<()> {
        self.pool.restore(rid)
    }

    pub fn flush(&self) -> Result<()> {
        self.pool.flush()
    }
}
