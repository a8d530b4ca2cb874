use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::{
    Config, EvictionPolicy, INDIR_COL, NUM_METADATA_COLS, RID_COL, SCHEMA_COL, SCHEMA_MERGED,
    TIME_COL,
};
use crate::disk::Disk;
use crate::errors::{DatabaseError, Result};
use crate::page::Page;
use crate::page_table::{PageEntry, PageTable};
use crate::rid::{Rid, UidGenerator};

pub(crate) fn now_millis() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i128)
        .unwrap_or(0)
}

/// A base row captured by the merge while it scans a stripe. Row order
/// matches offset order, so positions double as addresses.
#[derive(Debug, Clone)]
pub(crate) struct SnapRow {
    pub indir: i128,
    pub rid: i128,
    pub time: i128,
    pub schema: i128,
    pub data: Vec<i128>,
}

/// Full snapshot of one base stripe, in row order.
#[derive(Debug)]
pub(crate) struct StripeSnapshot {
    pub pages_id: u64,
    pub rows: Vec<SnapRow>,
}

/// What the merge hands back for finalization: the stripe it rewrote and
/// the indirection values it saw when it snapshotted. Rows whose
/// indirection moved since then were updated mid-merge and keep their live
/// metadata instead of the merged sentinel.
#[derive(Debug)]
pub(crate) struct StagedStripe {
    pub pages_id: u64,
    pub snapshot_indir: Vec<i128>,
}

/// The central storage engine for one table: owns the page table, the disk
/// handle, the eviction queue and the open base/tail stripes, and performs
/// every record write, read, delete-marking and restore.
///
/// All mutations serialize under one coarse mutex.
pub struct Bufferpool {
    inner: Mutex<PoolInner>,
    num_columns: usize,
}

struct PoolInner {
    page_table: PageTable,
    disk: Disk,
    config: Arc<Config>,

    /// `(pages_id, col)` in recency order; front is least recently used.
    queue: VecDeque<(u64, usize)>,
    resident: usize,

    open_base: Option<u64>,
    open_tail: Option<u64>,

    /// Every stripe id this table has ever allocated (or restored from
    /// metadata). Never pruned; drives merges and rebuild scans.
    base_ids: Vec<u64>,
    tail_ids: Vec<u64>,

    num_columns: usize,
    tcols: usize,

    rid_gen: Arc<UidGenerator>,
    base_id_gen: Arc<UidGenerator>,
    tail_id_gen: Arc<UidGenerator>,
}

impl Bufferpool {
    pub fn new(
        db_path: &Path,
        num_columns: usize,
        config: Arc<Config>,
        rid_gen: Arc<UidGenerator>,
        base_id_gen: Arc<UidGenerator>,
        tail_id_gen: Arc<UidGenerator>,
    ) -> Result<Bufferpool> {
        let tcols = num_columns + NUM_METADATA_COLS;
        let disk = Disk::new(db_path, &config)?;

        Ok(Bufferpool {
            inner: Mutex::new(PoolInner {
                page_table: PageTable::new(tcols),
                disk,
                config,
                queue: VecDeque::new(),
                resident: 0,
                open_base: None,
                open_tail: None,
                base_ids: Vec::new(),
                tail_ids: Vec::new(),
                num_columns,
                tcols,
                rid_gen,
                base_id_gen,
                tail_id_gen,
            }),
            num_columns,
        })
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("bufferpool mutex poisoned")
    }

    /// Register stripes allocated in a previous session.
    pub fn restore_stripes(&self, base_ids: Vec<u64>, tail_ids: Vec<u64>) {
        let mut inner = self.lock();
        for pid in base_ids {
            if !inner.base_ids.contains(&pid) {
                inner.base_ids.push(pid);
            }
        }
        for pid in tail_ids {
            if !inner.tail_ids.contains(&pid) {
                inner.tail_ids.push(pid);
            }
        }
    }

    /// Create a base record and its first tail copy. Returns the base RID.
    pub fn insert(&self, values: &[i64]) -> Result<Rid> {
        debug_assert_eq!(values.len(), self.num_columns);
        self.lock().insert(values)
    }

    /// Append a tail version; `None` columns carry forward. Returns the new
    /// tail RID.
    pub fn update(&self, rid: Rid, values: &[Option<i64>]) -> Result<Rid> {
        debug_assert_eq!(values.len(), self.num_columns);
        self.lock().append_tail(rid, values, false)
    }

    /// Mark a record deleted by appending a tombstone tail.
    pub fn delete(&self, rid: Rid) -> Result<Rid> {
        let nones = vec![None; self.num_columns];
        self.lock().append_tail(rid, &nones, true)
    }

    /// Read the projected data columns of a record at a relative version
    /// (`0` newest, `-n` the n-th previous, clamped at the original insert).
    pub fn read(&self, rid: Rid, projection: &[usize], rel_version: i64) -> Result<Vec<i64>> {
        self.lock().read(rid, projection, rel_version)
    }

    /// Undo one hop of the tail chain (rollback of a single update/delete).
    pub fn restore(&self, rid: Rid) -> Result<()> {
        self.lock().restore(rid)
    }

    /// Write every dirty resident page through to disk.
    pub fn flush(&self) -> Result<()> {
        self.lock().flush()
    }

    pub fn base_stripe_ids(&self) -> Vec<u64> {
        self.lock().base_ids.clone()
    }

    pub fn tail_stripe_ids(&self) -> Vec<u64> {
        self.lock().tail_ids.clone()
    }

    /// Seal the open base stripe so a closing merge can fold it too. New
    /// inserts would allocate a fresh stripe; none arrive during close.
    pub(crate) fn seal_open_base(&self) {
        let mut inner = self.lock();
        if let Some(pid) = inner.open_base.take() {
            if let Some(entry) = inner.page_table.get_mut(pid) {
                entry.set_pinned(false);
            }
        }
    }

    /// Base stripes eligible for merging: everything except the one still
    /// accepting inserts.
    pub(crate) fn sealed_base_stripes(&self) -> Vec<u64> {
        let inner = self.lock();
        inner
            .base_ids
            .iter()
            .copied()
            .filter(|pid| Some(*pid) != inner.open_base)
            .collect()
    }

    pub(crate) fn snapshot_stripe(&self, pages_id: u64) -> Result<StripeSnapshot> {
        self.lock().snapshot_stripe(pages_id)
    }

    pub(crate) fn read_cells(&self, pages_id: u64, offset: usize, cols: &[usize]) -> Result<Vec<i128>> {
        let mut inner = self.lock();
        cols.iter()
            .map(|&col| inner.read_cell(pages_id, col, offset))
            .collect()
    }

    /// Foreground step of the merge: under the pool mutex, rebuild the
    /// indirection and schema staging pages from live state, promote every
    /// staged file over its original, and drop the in-memory stripes so
    /// later reads pick up the merged pages from disk.
    pub(crate) fn finalize_merge(&self, staged: &[StagedStripe]) -> Result<()> {
        self.lock().finalize_merge(staged)
    }
}

impl PoolInner {
    fn stripe_mut(&mut self, pages_id: u64) -> Result<&mut PageEntry> {
        self.page_table
            .get_mut(pages_id)
            .ok_or_else(|| DatabaseError::Metadata(format!("stripe {} not resident", pages_id)))
    }

    /// Move a key to the most-recent end of the queue.
    fn touch(&mut self, pages_id: u64, col: usize) {
        if let Some(pos) = self.queue.iter().position(|k| *k == (pages_id, col)) {
            self.queue.remove(pos);
        }
        self.queue.push_back((pages_id, col));
    }

    /// Make one column page resident, loading it from disk if necessary.
    fn ensure_resident(&mut self, pages_id: u64, col: usize) -> Result<()> {
        let present = self
            .page_table
            .get(pages_id)
            .map_or(false, |entry| entry.page(col).is_some());

        if present {
            self.touch(pages_id, col);
            return Ok(());
        }

        let page = self.disk.get_page(pages_id, col)?;

        // Make room first so the incoming page can never be its own victim
        // (it would be, under MRU).
        if let Some(cap) = self.config.max_buffer_pages {
            while self.resident + 1 > cap {
                if !self.evict_one()? {
                    break;
                }
            }
        }

        self.page_table.ensure_entry(pages_id).put_page(col, page);
        self.resident += 1;
        self.touch(pages_id, col);
        Ok(())
    }

    fn read_cell(&mut self, pages_id: u64, col: usize, offset: usize) -> Result<i128> {
        self.ensure_resident(pages_id, col)?;
        let entry = self.stripe_mut(pages_id)?;
        let page = entry
            .page(col)
            .ok_or(DatabaseError::NotFound { pages_id, col })?;
        Ok(page.read(offset))
    }

    fn write_cell(&mut self, pages_id: u64, col: usize, offset: usize, value: i128) -> Result<()> {
        self.ensure_resident(pages_id, col)?;
        let entry = self.stripe_mut(pages_id)?;
        let page = entry
            .page_mut(col)
            .ok_or(DatabaseError::NotFound { pages_id, col })?;
        page.update(value, offset);
        Ok(())
    }

    fn evict_if_needed(&mut self) -> Result<()> {
        let Some(cap) = self.config.max_buffer_pages else {
            return Ok(());
        };

        while self.resident > cap {
            if !self.evict_one()? {
                warn!(resident = self.resident, cap, "no evictable page in pool");
                break;
            }
        }
        Ok(())
    }

    /// Evict one unpinned page in policy order, writing it through to disk
    /// if dirty. Returns false when everything resident is pinned.
    fn evict_one(&mut self) -> Result<bool> {
        let mut victim: Option<(usize, u64, usize)> = None;

        let positions: Vec<usize> = match self.config.eviction_policy {
            EvictionPolicy::Lru => (0..self.queue.len()).collect(),
            EvictionPolicy::Mru => (0..self.queue.len()).rev().collect(),
        };

        for pos in positions {
            let (pages_id, col) = self.queue[pos];
            let evictable = self
                .page_table
                .get(pages_id)
                .and_then(|entry| entry.page(col))
                .map_or(false, |page| page.pin_count == 0);

            if evictable {
                victim = Some((pos, pages_id, col));
                break;
            }
        }

        let Some((pos, pages_id, col)) = victim else {
            return Ok(false);
        };

        self.queue.remove(pos);
        let entry = self.stripe_mut(pages_id)?;
        let page = entry
            .take_page(col)
            .ok_or(DatabaseError::NotFound { pages_id, col })?;
        let vacant = entry.is_vacant();

        if page.dirty {
            self.disk.put_page(&page, pages_id, col)?;
        }
        self.resident -= 1;
        if vacant {
            self.page_table.remove(pages_id);
        }

        debug!(pages_id, col, "page evicted");
        Ok(true)
    }

    /// Stripe with room for one more record, allocating (and sealing the
    /// predecessor) as needed.
    fn ensure_open_stripe(&mut self, base: bool) -> Result<u64> {
        let open = if base { self.open_base } else { self.open_tail };

        if let Some(pid) = open {
            if let Some(entry) = self.page_table.get(pid) {
                if entry.has_capacity(self.config.page_size, self.config.record_size) {
                    return Ok(pid);
                }
            }
        }

        if let Some(pid) = open {
            if let Some(entry) = self.page_table.get_mut(pid) {
                entry.set_pinned(false);
            }
        }

        let pid = if base {
            self.base_id_gen.next()?
        } else {
            self.tail_id_gen.next()?
        };

        self.page_table
            .create_stripe(pid, self.config.page_size, self.config.record_size);
        for col in 0..self.tcols {
            self.queue.push_back((pid, col));
        }
        self.resident += self.tcols;

        if base {
            self.open_base = Some(pid);
            self.base_ids.push(pid);
        } else {
            self.open_tail = Some(pid);
            self.tail_ids.push(pid);
        }

        debug!(pages_id = pid, base, "allocated stripe");
        self.evict_if_needed()?;
        Ok(pid)
    }

    fn insert(&mut self, values: &[i64]) -> Result<Rid> {
        let now = now_millis();

        let base_pid = self.ensure_open_stripe(true)?;
        let tail_pid = self.ensure_open_stripe(false)?;

        let base_off = self.stripe_mut(base_pid)?.bytes_used();
        let tail_off = self.stripe_mut(tail_pid)?.bytes_used();

        let base_rid = Rid::from_parts(self.rid_gen.next()?, base_pid, base_off, true, false);
        let tail_rid = Rid::from_parts(self.rid_gen.next()?, tail_pid, tail_off, false, false);

        let mut row = vec![0i128; self.tcols];
        row[INDIR_COL] = tail_rid.as_value();
        row[RID_COL] = base_rid.as_value();
        row[TIME_COL] = now;
        row[SCHEMA_COL] = 0;
        for (i, value) in values.iter().enumerate() {
            row[NUM_METADATA_COLS + i] = i128::from(*value);
        }
        self.stripe_mut(base_pid)?.write_vals(&row)?;

        // First tail: a copy of the base so updates always have a previous
        // tail to carry values forward from.
        row[INDIR_COL] = Rid::NULL.as_value();
        row[RID_COL] = tail_rid.as_value();
        self.stripe_mut(tail_pid)?.write_vals(&row)?;

        Ok(base_rid)
    }

    fn append_tail(&mut self, rid: Rid, values: &[Option<i64>], tombstone: bool) -> Result<Rid> {
        let (base_pid, base_off) = rid.loc();
        let now = now_millis();

        let indir_val = self.read_cell(base_pid, INDIR_COL, base_off)?;
        let prev = Rid::from_value(indir_val);
        if prev.tombstone() {
            return Err(DatabaseError::Deleted);
        }

        let mut schema = self.read_cell(base_pid, SCHEMA_COL, base_off)?;
        if schema == SCHEMA_MERGED {
            // Post-merge: the live bitmap moved to the newest tail.
            let (prev_pid, prev_off) = prev.loc();
            schema = self.read_cell(prev_pid, SCHEMA_COL, prev_off)?;
        }

        let tail_pid = self.ensure_open_stripe(false)?;
        let tail_off = self.stripe_mut(tail_pid)?.bytes_used();
        let tail_rid = Rid::from_parts(self.rid_gen.next()?, tail_pid, tail_off, false, tombstone);

        let mut row = vec![0i128; self.tcols];
        row[INDIR_COL] = indir_val;
        row[RID_COL] = tail_rid.as_value();
        row[TIME_COL] = now;

        let (prev_pid, prev_off) = prev.loc();
        for (i, value) in values.iter().enumerate() {
            row[NUM_METADATA_COLS + i] = match value {
                Some(v) => {
                    schema |= 1i128 << i;
                    i128::from(*v)
                }
                None => self.read_cell(prev_pid, NUM_METADATA_COLS + i, prev_off)?,
            };
        }
        row[SCHEMA_COL] = schema;

        self.stripe_mut(tail_pid)?.write_vals(&row)?;

        self.write_cell(base_pid, INDIR_COL, base_off, tail_rid.as_value())?;
        self.write_cell(base_pid, SCHEMA_COL, base_off, schema)?;

        Ok(tail_rid)
    }

    fn read(&mut self, rid: Rid, projection: &[usize], rel_version: i64) -> Result<Vec<i64>> {
        let (base_pid, base_off) = rid.loc();

        let indir = Rid::from_value(self.read_cell(base_pid, INDIR_COL, base_off)?);
        if indir.tombstone() {
            return Err(DatabaseError::Deleted);
        }

        let schema = self.read_cell(base_pid, SCHEMA_COL, base_off)?;

        // Never updated, or merged state requested at the newest version:
        // the base row already holds the answer.
        let (pid, off) = if schema == 0 || (schema == SCHEMA_MERGED && rel_version == 0) {
            (base_pid, base_off)
        } else {
            let mut cur = indir;
            let mut hops = rel_version.unsigned_abs();
            while hops > 0 {
                let next = Rid::from_value(self.read_cell(cur.pages_id(), INDIR_COL, cur.offset())?);
                if next.is_null() || next.is_base() {
                    break;
                }
                cur = next;
                hops -= 1;
            }
            cur.loc()
        };

        let mut out = Vec::new();
        for i in 0..self.num_columns {
            if projection.get(i) == Some(&1) {
                out.push(self.read_cell(pid, NUM_METADATA_COLS + i, off)? as i64);
            }
        }
        Ok(out)
    }

    fn restore(&mut self, rid: Rid) -> Result<()> {
        let (base_pid, base_off) = rid.loc();

        let head = Rid::from_value(self.read_cell(base_pid, INDIR_COL, base_off)?);
        if head.is_null() {
            return Ok(());
        }

        let (head_pid, head_off) = head.loc();
        let prev_val = self.read_cell(head_pid, INDIR_COL, head_off)?;
        if prev_val == 0 {
            // Nothing before the first tail; the record has no update to undo.
            warn!(?rid, "restore on a record with no prior version");
            return Ok(());
        }

        let prev = Rid::from_value(prev_val);
        let (prev_pid, prev_off) = prev.loc();
        let prev_schema = self.read_cell(prev_pid, SCHEMA_COL, prev_off)?;

        // If the popped version was folded into the base by a merge, the
        // base data columns no longer match the older state; copy the
        // previous tail back in so the schema shortcut stays truthful.
        let base_schema = self.read_cell(base_pid, SCHEMA_COL, base_off)?;
        if base_schema == SCHEMA_MERGED {
            for c in 0..self.num_columns {
                let value = self.read_cell(prev_pid, NUM_METADATA_COLS + c, prev_off)?;
                self.write_cell(base_pid, NUM_METADATA_COLS + c, base_off, value)?;
            }
        }

        self.write_cell(base_pid, INDIR_COL, base_off, prev_val)?;
        self.write_cell(base_pid, SCHEMA_COL, base_off, prev_schema)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let disk = &self.disk;
        for (pages_id, entry) in self.page_table.iter_mut() {
            for col in 0..entry.num_cols() {
                if let Some(page) = entry.page_mut(col) {
                    if page.dirty {
                        disk.put_page(page, *pages_id, col)?;
                        page.dirty = false;
                    }
                }
            }
        }
        Ok(())
    }

    fn snapshot_stripe(&mut self, pages_id: u64) -> Result<StripeSnapshot> {
        self.ensure_resident(pages_id, RID_COL)?;
        let rows = self
            .page_table
            .get(pages_id)
            .and_then(|entry| entry.page(RID_COL))
            .map(|page| page.num_records())
            .unwrap_or(0);

        let record_size = self.config.record_size;
        let mut out = Vec::with_capacity(rows);

        for i in 0..rows {
            let offset = i * record_size;
            let mut data = Vec::with_capacity(self.num_columns);
            for c in 0..self.num_columns {
                data.push(self.read_cell(pages_id, NUM_METADATA_COLS + c, offset)?);
            }
            out.push(SnapRow {
                indir: self.read_cell(pages_id, INDIR_COL, offset)?,
                rid: self.read_cell(pages_id, RID_COL, offset)?,
                time: self.read_cell(pages_id, TIME_COL, offset)?,
                schema: self.read_cell(pages_id, SCHEMA_COL, offset)?,
                data,
            });
        }

        Ok(StripeSnapshot {
            pages_id,
            rows: out,
        })
    }

    fn finalize_merge(&mut self, staged: &[StagedStripe]) -> Result<()> {
        for stripe in staged {
            debug_assert!(Some(stripe.pages_id) != self.open_base);

            let mut indir_page = Page::new(self.config.page_size, self.config.record_size);
            let mut schema_page = Page::new(self.config.page_size, self.config.record_size);
            let mut changed_offsets: Vec<usize> = Vec::new();

            for (i, snapshot_indir) in stripe.snapshot_indir.iter().enumerate() {
                let offset = i * self.config.record_size;
                let cur_indir = self.read_cell(stripe.pages_id, INDIR_COL, offset)?;

                if cur_indir == *snapshot_indir {
                    indir_page.write(cur_indir)?;
                    schema_page.write(SCHEMA_MERGED)?;
                } else {
                    // Updated while the merge ran: keep the live chain head
                    // and bitmap so the new tail stays reachable.
                    let cur_schema = self.read_cell(stripe.pages_id, SCHEMA_COL, offset)?;
                    indir_page.write(cur_indir)?;
                    schema_page.write(cur_schema)?;
                    changed_offsets.push(offset);
                }
            }

            // Rows that moved while the merge ran were folded from a stale
            // snapshot; their staged data columns are replaced with the live
            // base values (rollback may have rewritten them, and the live
            // schema routes reads through the chain regardless).
            if !changed_offsets.is_empty() {
                for c in 0..self.num_columns {
                    let col = NUM_METADATA_COLS + c;
                    let mut page = self.disk.get_staged(stripe.pages_id, col)?;
                    for &offset in &changed_offsets {
                        let live = self.read_cell(stripe.pages_id, col, offset)?;
                        page.update(live, offset);
                    }
                    self.disk.put_staged(&page, stripe.pages_id, col)?;
                }
            }

            self.disk.put_staged(&indir_page, stripe.pages_id, INDIR_COL)?;
            self.disk.put_staged(&schema_page, stripe.pages_id, SCHEMA_COL)?;
            for col in 0..self.tcols {
                self.disk.promote_staged(stripe.pages_id, col)?;
            }

            if let Some(entry) = self.page_table.remove(stripe.pages_id) {
                self.resident -= entry.resident_pages();
            }
            self.queue.retain(|(pid, _)| *pid != stripe.pages_id);

            debug!(pages_id = stripe.pages_id, "merged stripe promoted");
        }
        Ok(())
    }
}
