use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Outcome of a non-blocking lock attempt under wound-wait.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LockAttempt {
    Acquired,

    /// The holder is younger and has been wounded; try again shortly.
    Retry,

    /// The holder is older; give up this attempt and retry the whole
    /// transaction later.
    SelfAbort,
}

struct Holder {
    ts: u64,
    wounded: Arc<AtomicBool>,
}

/// Key-level pessimistic locks for one table. Transactions are ordered by
/// their timestamps; conflicts resolve wound-wait style: an older
/// transaction wounds a younger holder (who will abort and retry), a
/// younger transaction backs off on its own.
pub(crate) struct LockTable {
    held: Mutex<HashMap<i64, Holder>>,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable {
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_lock(&self, key: i64, ts: u64, wounded: &Arc<AtomicBool>) -> LockAttempt {
        let mut held = self.held.lock().expect("lock table mutex poisoned");

        match held.get(&key) {
            None => {
                held.insert(
                    key,
                    Holder {
                        ts,
                        wounded: wounded.clone(),
                    },
                );
                LockAttempt::Acquired
            }
            Some(holder) if holder.ts == ts => LockAttempt::Acquired,
            Some(holder) if ts < holder.ts => {
                // We are older: wound the holder and wait for it to let go.
                holder.wounded.store(true, Ordering::SeqCst);
                debug!(key, holder_ts = holder.ts, ts, "wounded lock holder");
                LockAttempt::Retry
            }
            Some(_) => LockAttempt::SelfAbort,
        }
    }

    /// Release a key if this transaction still owns it.
    pub fn unlock(&self, key: i64, ts: u64) {
        let mut held = self.held.lock().expect("lock table mutex poisoned");
        if held.get(&key).map_or(false, |holder| holder.ts == ts) {
            held.remove(&key);
        }
    }
}
