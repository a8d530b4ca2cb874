use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::locks::LockAttempt;
use crate::table::Table;
use crate::transaction::Transaction;

/// Full-transaction retries before a conflicted transaction is given up on.
const MAX_TRIES: u8 = 16;

/// Spins waiting for a wounded holder to release a lock.
const LOCK_SPIN_BUDGET: u32 = 500;

const LOCK_SPIN_SLEEP: Duration = Duration::from_millis(1);
const RETRY_SLEEP: Duration = Duration::from_millis(2);

enum Outcome {
    Committed,
    Aborted,
    Retry,
}

/// Executes a queue of transactions on its own OS thread. Before a
/// transaction runs, every key it writes is locked in ascending order
/// (two-phase locking); wound-wait resolves conflicts between workers.
pub struct TransactionWorker {
    transactions: Vec<Transaction>,
    result: Arc<Mutex<usize>>,
    handle: Option<JoinHandle<()>>,
}

impl Default for TransactionWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionWorker {
    pub fn new() -> TransactionWorker {
        TransactionWorker {
            transactions: Vec::new(),
            result: Arc::new(Mutex::new(0)),
            handle: None,
        }
    }

    /// Queue a transaction for this worker.
    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Start executing on a background thread.
    pub fn run(&mut self) {
        let transactions = std::mem::take(&mut self.transactions);
        let result = self.result.clone();

        self.handle = Some(thread::spawn(move || {
            let committed = run_queue(transactions);
            *result.lock().expect("worker result mutex poisoned") = committed;
        }));
    }

    /// Wait for the worker to finish; returns how many transactions
    /// committed.
    pub fn join(&mut self) -> usize {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        *self.result.lock().expect("worker result mutex poisoned")
    }
}

fn run_queue(transactions: Vec<Transaction>) -> usize {
    let mut queue: VecDeque<Transaction> = transactions.into();
    let mut committed = 0;

    while let Some(mut tx) = queue.pop_front() {
        match execute_with_locks(&mut tx) {
            Outcome::Committed => committed += 1,
            Outcome::Aborted => {}
            Outcome::Retry => {
                tx.try_count += 1;
                if tx.try_count < MAX_TRIES {
                    // Back off a little harder each time around.
                    thread::sleep(RETRY_SLEEP * u32::from(tx.try_count));
                    tx.reset_for_retry();
                    queue.push_back(tx);
                } else {
                    debug!(ts = tx.ts, "transaction exceeded retry budget");
                }
            }
        }
    }

    committed
}

/// Acquire the write set in ascending key order, run, then release.
fn execute_with_locks(tx: &mut Transaction) -> Outcome {
    let plan = tx.lock_plan();
    let mut held: Vec<(Arc<Table>, i64)> = Vec::new();

    for (table, key) in plan {
        let mut spins = 0u32;
        loop {
            // An older transaction may wound us while we are still
            // collecting locks; let go of everything right away.
            if tx.wounded.load(Ordering::SeqCst) {
                release(&held, tx.ts);
                return Outcome::Retry;
            }

            match table.locks.try_lock(key, tx.ts, &tx.wounded) {
                LockAttempt::Acquired => {
                    held.push((table.clone(), key));
                    break;
                }
                LockAttempt::Retry => {
                    // We wounded the holder; give it time to back out.
                    spins += 1;
                    if spins > LOCK_SPIN_BUDGET {
                        release(&held, tx.ts);
                        return Outcome::Retry;
                    }
                    thread::sleep(LOCK_SPIN_SLEEP);
                }
                LockAttempt::SelfAbort => {
                    debug!(ts = tx.ts, key, "younger transaction backing off");
                    release(&held, tx.ts);
                    return Outcome::Retry;
                }
            }
        }
    }

    let ok = tx.run();
    let was_wounded = tx.wounded.load(Ordering::SeqCst);
    release(&held, tx.ts);

    if ok {
        Outcome::Committed
    } else if was_wounded {
        // Aborted on behalf of an older transaction, not on its own merit.
        Outcome::Retry
    } else {
        Outcome::Aborted
    }
}

fn release(held: &[(Arc<Table>, i64)], ts: u64) {
    for (table, key) in held {
        table.locks.unlock(*key, ts);
    }
}
