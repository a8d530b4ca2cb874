//! Transactions, rollback, and worker concurrency.

use std::sync::Arc;

use tailstore::{Database, Table, Transaction, TransactionWorker};

const ALL: [usize; 5] = [1; 5];

fn setup(dir: &tempfile::TempDir) -> (Database, Arc<Table>) {
    let mut db = Database::new();
    db.open(dir.path()).unwrap();
    let table = db.create_table("Accounts", 5, 0).unwrap();
    (db, table)
}

#[test]
fn committed_transaction_applies_everything() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    let mut tx = Transaction::new();
    tx.add_insert(&table, vec![1, 100, 0, 0, 0]);
    tx.add_insert(&table, vec![2, 200, 0, 0, 0]);
    tx.add_update(&table, 1, vec![None, Some(150), None, None, None]);
    tx.add_select(&table, 1, 0, ALL.to_vec());
    tx.add_sum(&table, 1, 2, 1);

    assert!(tx.run());
    assert!(tx.committed());
    assert_eq!(table.select(1, 0, &ALL).unwrap()[0].columns[1], 150);
    assert_eq!(table.sum(1, 2, 1).unwrap(), 350);

    db.close().unwrap();
}

#[test]
fn failed_op_rolls_back_the_whole_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    table.insert(&[9, 900, 0, 0, 0]).unwrap();

    let mut tx = Transaction::new();
    tx.add_insert(&table, vec![1, 100, 0, 0, 0]);
    tx.add_update(&table, 9, vec![None, Some(901), None, None, None]);
    // Duplicate key: this op fails and the transaction aborts.
    tx.add_insert(&table, vec![9, 0, 0, 0, 0]);

    assert!(!tx.run());

    // The earlier insert and update were undone.
    assert!(table.select(1, 0, &ALL).unwrap().is_empty());
    assert_eq!(table.select(9, 0, &ALL).unwrap()[0].columns[1], 900);

    db.close().unwrap();
}

#[test]
fn rollback_unwinds_updates_in_reverse_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    table.insert(&[1, 10, 0, 0, 0]).unwrap();

    let mut tx = Transaction::new();
    tx.add_update(&table, 1, vec![None, Some(11), None, None, None]);
    tx.add_update(&table, 1, vec![None, Some(12), None, None, None]);
    tx.add_delete(&table, 2); // missing key; aborts

    assert!(!tx.run());
    assert_eq!(table.select(1, 0, &ALL).unwrap()[0].columns[1], 10);

    db.close().unwrap();
}

#[test]
fn aborted_delete_revives_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    table.insert(&[1, 10, 0, 0, 0]).unwrap();

    let mut tx = Transaction::new();
    tx.add_delete(&table, 1);
    tx.add_update(&table, 404, vec![None; 5]); // missing key; aborts

    assert!(!tx.run());
    let records = table.select(1, 0, &ALL).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].columns[1], 10);

    db.close().unwrap();
}

#[test]
fn worker_commits_its_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    let mut worker = TransactionWorker::new();
    for k in 0..10i64 {
        let mut tx = Transaction::new();
        tx.add_insert(&table, vec![k, k * 10, 0, 0, 0]);
        worker.add_transaction(tx);
    }

    worker.run();
    assert_eq!(worker.join(), 10);

    for k in 0..10i64 {
        assert_eq!(table.select(k, 0, &ALL).unwrap()[0].columns[1], k * 10);
    }

    db.close().unwrap();
}

#[test]
fn concurrent_workers_on_disjoint_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    let mut workers = Vec::new();
    for w in 0..4i64 {
        let mut worker = TransactionWorker::new();
        for k in 0..25i64 {
            let key = w * 100 + k;
            let mut tx = Transaction::new();
            tx.add_insert(&table, vec![key, key, 0, 0, 0]);
            tx.add_update(&table, key, vec![None, Some(-key), None, None, None]);
            worker.add_transaction(tx);
        }
        worker.run();
        workers.push(worker);
    }

    let committed: usize = workers.iter_mut().map(|w| w.join()).sum();
    assert_eq!(committed, 100);

    for w in 0..4i64 {
        for k in 0..25i64 {
            let key = w * 100 + k;
            assert_eq!(table.select(key, 0, &ALL).unwrap()[0].columns[1], -key);
        }
    }

    db.close().unwrap();
}

#[test]
fn concurrent_updates_to_one_key_stay_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    table.insert(&[1, 0, 0, 0, 0]).unwrap();

    let mut workers = Vec::new();
    for w in 1..=2i64 {
        let mut worker = TransactionWorker::new();
        let mut tx = Transaction::new();
        tx.add_update(&table, 1, vec![None, Some(w * 100), None, None, None]);
        worker.add_transaction(tx);
        worker.run();
        workers.push(worker);
    }

    let committed: usize = workers.iter_mut().map(|w| w.join()).sum();
    assert_eq!(committed, 2);

    // Both updates landed, in some serial order.
    let now = table.select(1, 0, &ALL).unwrap();
    assert!(now[0].columns[1] == 100 || now[0].columns[1] == 200);

    // Two versions back is the original base state.
    let base = table.select_version(1, 0, &ALL, -2).unwrap();
    assert_eq!(base[0].columns[1], 0);

    db.close().unwrap();
}

#[test]
fn workers_contending_on_shared_keys_all_commit() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, table) = setup(&dir);

    for k in 0..5i64 {
        table.insert(&[k, 0, 0, 0, 0]).unwrap();
    }

    let mut workers = Vec::new();
    for w in 0..3i64 {
        let mut worker = TransactionWorker::new();
        for round in 0..5i64 {
            let mut tx = Transaction::new();
            for k in 0..5i64 {
                tx.add_update(
                    &table,
                    k,
                    vec![None, None, Some(w * 1000 + round), None, None],
                );
            }
            worker.add_transaction(tx);
        }
        worker.run();
        workers.push(worker);
    }

    let committed: usize = workers.iter_mut().map(|w| w.join()).sum();
    assert_eq!(committed, 15);

    // Every row converged to some committed transaction's write.
    for k in 0..5i64 {
        let value = table.select(k, 0, &ALL).unwrap()[0].columns[2];
        assert!((0..3000).contains(&value));
    }

    db.close().unwrap();
}
