use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::bufferpool::{Bufferpool, StagedStripe};
use crate::config::{Config, NUM_METADATA_COLS, RID_COL, TIME_COL};
use crate::disk::Disk;
use crate::errors::{DatabaseError, Result};
use crate::page::Page;
use crate::rid::Rid;

pub(crate) enum MergeMsg {
    Run,
    Shutdown,
}

/// Handle to a table's background merge thread.
pub(crate) struct MergeHandle {
    sender: Mutex<Sender<MergeMsg>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MergeHandle {
    pub fn request_merge(&self) {
        let sender = self.sender.lock().expect("merge sender mutex poisoned");
        if sender.send(MergeMsg::Run).is_err() {
            warn!("merge thread is gone; request dropped");
        }
    }

    /// Stop the worker and wait for any in-flight pass to finish.
    pub fn shutdown(&self) {
        {
            let sender = self.sender.lock().expect("merge sender mutex poisoned");
            let _ = sender.send(MergeMsg::Shutdown);
        }
        if let Some(handle) = self
            .thread
            .lock()
            .expect("merge thread mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

/// Spawn the merge worker for one table.
pub(crate) fn start_merge_worker(
    table_name: String,
    db_path: &Path,
    pool: Arc<Bufferpool>,
    config: Arc<Config>,
    update_count: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
) -> MergeHandle {
    let (tx, rx) = mpsc::channel::<MergeMsg>();
    let db_path = db_path.to_path_buf();

    let handle = thread::spawn(move || loop {
        match rx.recv() {
            Ok(MergeMsg::Run) => {
                if let Err(e) = run_merge_pass(&db_path, &pool, &config) {
                    warn!(table = %table_name, error = %e, "merge pass failed");
                }
                update_count.store(0, Ordering::SeqCst);
                in_flight.store(false, Ordering::SeqCst);
            }
            Ok(MergeMsg::Shutdown) | Err(_) => break,
        }
    });

    MergeHandle {
        sender: Mutex::new(tx),
        thread: Mutex::new(Some(handle)),
    }
}

/// One merge pass: fold the latest tail values into fresh base pages for
/// every sealed base stripe, staging the results on disk and promoting
/// them batch by batch.
///
/// The long-running fold happens outside the pool mutex; only per-row
/// reads and the final promotion serialize with foreground traffic.
pub(crate) fn run_merge_pass(db_path: &Path, pool: &Arc<Bufferpool>, config: &Config) -> Result<()> {
    let disk = Disk::new(db_path, config)?;
    let sealed = pool.sealed_base_stripes();
    if sealed.is_empty() {
        return Ok(());
    }

    info!(stripes = sealed.len(), "merge pass starting");
    let num_columns = pool.num_columns();
    let data_cols: Vec<usize> = (0..num_columns).map(|c| NUM_METADATA_COLS + c).collect();

    for batch in sealed.chunks(config.merge_batch_size) {
        let mut staged = Vec::new();

        for &pages_id in batch {
            let snapshot = match pool.snapshot_stripe(pages_id) {
                Ok(snapshot) => snapshot,
                // Restored id whose pages never reached disk; nothing to fold.
                Err(DatabaseError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            let mut rid_page = Page::new(config.page_size, config.record_size);
            let mut time_page = Page::new(config.page_size, config.record_size);
            let mut col_pages: Vec<Page> = (0..num_columns)
                .map(|_| Page::new(config.page_size, config.record_size))
                .collect();
            let mut snapshot_indir = Vec::with_capacity(snapshot.rows.len());

            for row in &snapshot.rows {
                let indir = Rid::from_value(row.indir);

                let folded = if row.schema > 0 && !indir.tombstone() {
                    // Overlay the changed columns from the newest tail.
                    let tail = pool.read_cells(indir.pages_id(), indir.offset(), &data_cols)?;
                    let mut merged = row.data.clone();
                    for col in 0..num_columns {
                        if row.schema & (1i128 << col) != 0 {
                            merged[col] = tail[col];
                        }
                    }
                    merged
                } else {
                    // Untouched since insert or last merge, or tombstoned:
                    // the base values stand.
                    row.data.clone()
                };

                rid_page.write(row.rid)?;
                time_page.write(row.time)?;
                for (col, value) in folded.iter().enumerate() {
                    col_pages[col].write(*value)?;
                }
                snapshot_indir.push(row.indir);
            }

            disk.put_staged(&rid_page, pages_id, RID_COL)?;
            disk.put_staged(&time_page, pages_id, TIME_COL)?;
            for (col, page) in col_pages.iter().enumerate() {
                disk.put_staged(page, pages_id, NUM_METADATA_COLS + col)?;
            }

            debug!(pages_id, rows = snapshot.rows.len(), "stripe staged");
            staged.push(StagedStripe {
                pages_id: snapshot.pages_id,
                snapshot_indir,
            });
        }

        pool.finalize_merge(&staged)?;
    }

    info!("merge pass finished");
    Ok(())
}

/// Convenience used by `Table::force_merge` and `Database::close`.
pub(crate) fn run_and_reset(
    db_path: &Path,
    pool: &Arc<Bufferpool>,
    config: &Config,
    update_count: &AtomicUsize,
    in_flight: &AtomicBool,
) -> Result<()> {
    let result = run_merge_pass(db_path, pool, config);
    update_count.store(0, Ordering::SeqCst);
    in_flight.store(false, Ordering::SeqCst);
    result
}
