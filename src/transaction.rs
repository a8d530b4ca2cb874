use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::rid::Rid;
use crate::table::Table;

/// Process-wide strictly monotone timestamps; wound-wait orders
/// transactions by them.
static TS_ORACLE: Lazy<TimestampOracle> = Lazy::new(TimestampOracle::new);

struct TimestampOracle {
    start: Instant,
    last: AtomicU64,
}

impl TimestampOracle {
    fn new() -> TimestampOracle {
        TimestampOracle {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn next(&self) -> u64 {
        let now = self.start.elapsed().as_nanos() as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let ts = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, ts, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return ts,
                Err(observed) => last = observed,
            }
        }
    }
}

/// One queued operation of a transaction.
enum Operation {
    Insert {
        table: Arc<Table>,
        values: Vec<i64>,
    },
    Update {
        table: Arc<Table>,
        key: i64,
        values: Vec<Option<i64>>,
    },
    Select {
        table: Arc<Table>,
        search_key: i64,
        search_column: usize,
        projection: Vec<usize>,
    },
    SelectVersion {
        table: Arc<Table>,
        search_key: i64,
        search_column: usize,
        projection: Vec<usize>,
        rel_version: i64,
    },
    Sum {
        table: Arc<Table>,
        begin: i64,
        end: i64,
        column: usize,
    },
    SumVersion {
        table: Arc<Table>,
        begin: i64,
        end: i64,
        column: usize,
        rel_version: i64,
    },
    Delete {
        table: Arc<Table>,
        key: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// An ordered list of operations executed atomically: the first failure
/// aborts and rolls back every write the transaction already made, in
/// reverse order.
pub struct Transaction {
    ops: Vec<Operation>,
    state: TxnState,

    /// Keys of successful inserts, for rollback.
    insert_log: Vec<(Arc<Table>, i64)>,

    /// Base RIDs of successful updates/deletes, for rollback.
    update_log: Vec<(Arc<Table>, Rid)>,

    /// Wound-wait ordering; assigned at creation and kept across retries.
    pub(crate) ts: u64,

    /// Raised by an older transaction that wants one of our locks.
    pub(crate) wounded: Arc<AtomicBool>,

    /// Retries consumed so far (the worker bounds these).
    pub(crate) try_count: u8,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            ops: Vec::new(),
            state: TxnState::Active,
            insert_log: Vec::new(),
            update_log: Vec::new(),
            ts: TS_ORACLE.next(),
            wounded: Arc::new(AtomicBool::new(false)),
            try_count: 0,
        }
    }

    /// Add an insert query to this transaction.
    pub fn add_insert(&mut self, table: &Arc<Table>, values: Vec<i64>) {
        self.ops.push(Operation::Insert {
            table: table.clone(),
            values,
        });
    }

    /// Add an update query to this transaction.
    pub fn add_update(&mut self, table: &Arc<Table>, key: i64, values: Vec<Option<i64>>) {
        self.ops.push(Operation::Update {
            table: table.clone(),
            key,
            values,
        });
    }

    /// Add a select query to this transaction.
    pub fn add_select(
        &mut self,
        table: &Arc<Table>,
        search_key: i64,
        search_column: usize,
        projection: Vec<usize>,
    ) {
        self.ops.push(Operation::Select {
            table: table.clone(),
            search_key,
            search_column,
            projection,
        });
    }

    /// Add a versioned select query to this transaction.
    pub fn add_select_version(
        &mut self,
        table: &Arc<Table>,
        search_key: i64,
        search_column: usize,
        projection: Vec<usize>,
        rel_version: i64,
    ) {
        self.ops.push(Operation::SelectVersion {
            table: table.clone(),
            search_key,
            search_column,
            projection,
            rel_version,
        });
    }

    /// Add a sum query to this transaction.
    pub fn add_sum(&mut self, table: &Arc<Table>, begin: i64, end: i64, column: usize) {
        self.ops.push(Operation::Sum {
            table: table.clone(),
            begin,
            end,
            column,
        });
    }

    /// Add a versioned sum query to this transaction.
    pub fn add_sum_version(
        &mut self,
        table: &Arc<Table>,
        begin: i64,
        end: i64,
        column: usize,
        rel_version: i64,
    ) {
        self.ops.push(Operation::SumVersion {
            table: table.clone(),
            begin,
            end,
            column,
            rel_version,
        });
    }

    /// Add a delete query to this transaction.
    pub fn add_delete(&mut self, table: &Arc<Table>, key: i64) {
        self.ops.push(Operation::Delete {
            table: table.clone(),
            key,
        });
    }

    /// The `(table, key)` pairs a worker must lock before running us:
    /// every key written by an insert, update or delete, in ascending key
    /// order.
    pub(crate) fn lock_plan(&self) -> Vec<(Arc<Table>, i64)> {
        let mut plan: Vec<(Arc<Table>, i64)> = Vec::new();
        for op in &self.ops {
            let entry = match op {
                Operation::Insert { table, values } => {
                    values.get(table.key_column()).map(|key| (table.clone(), *key))
                }
                Operation::Update { table, key, .. } | Operation::Delete { table, key } => {
                    Some((table.clone(), *key))
                }
                _ => None,
            };
            if let Some((table, key)) = entry {
                let dup = plan
                    .iter()
                    .any(|(t, k)| *k == key && Arc::ptr_eq(t, &table));
                if !dup {
                    plan.push((table, key));
                }
            }
        }
        plan.sort_by_key(|(_, key)| *key);
        plan
    }

    /// Execute every operation in order. Returns true on commit; any
    /// failure (or a wound) aborts, rolls back, and returns false.
    pub fn run(&mut self) -> bool {
        for i in 0..self.ops.len() {
            if self.wounded.load(Ordering::SeqCst) {
                debug!(ts = self.ts, "transaction wounded; aborting");
                return self.abort();
            }
            if !self.execute(i) {
                return self.abort();
            }
        }
        self.commit()
    }

    fn execute(&mut self, at: usize) -> bool {
        // Writes log only on success: rolling back a failed insert would
        // clobber the pre-existing record that caused the conflict.
        match &self.ops[at] {
            Operation::Insert { table, values } => match table.insert(values) {
                Ok(_) => {
                    let key = values[table.key_column()];
                    self.insert_log.push((table.clone(), key));
                    true
                }
                Err(e) => {
                    debug!(ts = self.ts, error = %e, "insert failed");
                    false
                }
            },
            Operation::Update { table, key, values } => match table.update(*key, values) {
                Ok(rid) => {
                    self.update_log.push((table.clone(), rid));
                    true
                }
                Err(e) => {
                    debug!(ts = self.ts, key, error = %e, "update failed");
                    false
                }
            },
            Operation::Delete { table, key } => match table.delete(*key) {
                Ok(rid) => {
                    self.update_log.push((table.clone(), rid));
                    true
                }
                Err(e) => {
                    debug!(ts = self.ts, key, error = %e, "delete failed");
                    false
                }
            },
            Operation::Select {
                table,
                search_key,
                search_column,
                projection,
            } => table.select(*search_key, *search_column, projection).is_ok(),
            Operation::SelectVersion {
                table,
                search_key,
                search_column,
                projection,
                rel_version,
            } => table
                .select_version(*search_key, *search_column, projection, *rel_version)
                .is_ok(),
            Operation::Sum {
                table,
                begin,
                end,
                column,
            } => table.sum(*begin, *end, *column).is_ok(),
            Operation::SumVersion {
                table,
                begin,
                end,
                column,
                rel_version,
            } => table.sum_version(*begin, *end, *column, *rel_version).is_ok(),
        }
    }

    /// Undo every logged write in reverse order.
    pub fn abort(&mut self) -> bool {
        debug!(ts = self.ts, "transaction aborting");

        for (table, rid) in self.update_log.drain(..).rev() {
            let _ = table.rollback_update(rid);
        }
        for (table, key) in self.insert_log.drain(..).rev() {
            let _ = table.rollback_insert(key);
        }

        self.state = TxnState::Aborted;
        false
    }

    pub fn commit(&mut self) -> bool {
        self.insert_log.clear();
        self.update_log.clear();
        self.state = TxnState::Committed;
        true
    }

    pub fn committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    /// Rearm an aborted transaction so a worker can run it again. The
    /// timestamp is kept: under wound-wait a transaction only ages, so it
    /// eventually wins every conflict.
    pub(crate) fn reset_for_retry(&mut self) {
        self.wounded.store(false, Ordering::SeqCst);
        self.state = TxnState::Active;
    }
}
