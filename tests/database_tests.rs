//! End-to-end scenarios through the public `Database` surface.

use tailstore::{Config, Database, DatabaseError, IndexConfig, IndexKind};

const ALL: [usize; 5] = [1; 5];

fn open_db(dir: &tempfile::TempDir) -> Database {
    let mut db = Database::new();
    db.open(dir.path()).unwrap();
    db
}

#[test]
fn insert_then_select_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    assert!(table.insert(&[1, 10, 20, 30, 40]).is_ok());

    let records = table.select(1, 0, &ALL).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].columns, vec![1, 10, 20, 30, 40]);

    db.close().unwrap();
}

#[test]
fn partial_update_and_version_travel() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    table.insert(&[1, 10, 20, 30, 40]).unwrap();
    table
        .update(1, &[None, Some(15), None, Some(35), None])
        .unwrap();

    let now = table.select(1, 0, &ALL).unwrap();
    assert_eq!(now[0].columns, vec![1, 15, 20, 35, 40]);

    let prev = table.select_version(1, 0, &ALL, -1).unwrap();
    assert_eq!(prev[0].columns, vec![1, 10, 20, 30, 40]);

    db.close().unwrap();
}

#[test]
fn versions_replay_every_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    table.insert(&[7, 0, 0, 0, 0]).unwrap();
    for v in 1..=4i64 {
        table.update(7, &[None, Some(v), None, None, None]).unwrap();
    }

    for i in 0..=4i64 {
        let records = table.select_version(7, 0, &ALL, -i).unwrap();
        assert_eq!(records[0].columns[1], 4 - i);
    }
    // Past the beginning of history the base state repeats.
    let records = table.select_version(7, 0, &ALL, -10).unwrap();
    assert_eq!(records[0].columns[1], 0);

    db.close().unwrap();
}

#[test]
fn sum_over_key_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    for k in 1..=3i64 {
        table.insert(&[k, 10 * k, 100 * k, 0, 0]).unwrap();
    }

    assert_eq!(table.sum(1, 3, 1).unwrap(), 60);
    assert_eq!(table.sum(2, 2, 2).unwrap(), 200);
    assert_eq!(table.sum(1, 3, 0).unwrap(), 6);

    // Sums see updates at version 0 and history at older versions.
    table.update(2, &[None, Some(200), None, None, None]).unwrap();
    assert_eq!(table.sum(1, 3, 1).unwrap(), 240);
    assert_eq!(table.sum_version(1, 3, 1, -1).unwrap(), 60);

    db.close().unwrap();
}

#[test]
fn duplicate_insert_fails_and_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    table.insert(&[1, 10, 20, 30, 40]).unwrap();
    assert!(matches!(
        table.insert(&[1, 50, 60, 70, 80]),
        Err(DatabaseError::DuplicateKey(1))
    ));

    let records = table.select(1, 0, &ALL).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].columns, vec![1, 10, 20, 30, 40]);

    db.close().unwrap();
}

#[test]
fn delete_then_reinsert_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    table.insert(&[1, 10, 20, 30, 40]).unwrap();
    table.delete(1).unwrap();
    assert!(table.select(1, 0, &ALL).unwrap().is_empty());

    table.insert(&[1, 99, 98, 97, 96]).unwrap();
    let records = table.select(1, 0, &ALL).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].columns[1], 99);

    db.close().unwrap();
}

#[test]
fn range_select_filters_deleted_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Grades", 5, 0).unwrap();

    for k in 0..10i64 {
        table.insert(&[k, k, 0, 0, 0]).unwrap();
    }
    table.delete(4).unwrap();
    table.delete(7).unwrap();

    let records = table.select_range(0, 9, 0, &ALL).unwrap();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.columns[0] != 4 && r.columns[0] != 7));

    assert_eq!(table.sum(0, 9, 0).unwrap(), 45 - 4 - 7);

    db.close().unwrap();
}

#[test]
fn secondary_index_tracks_updates() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let index_config = IndexConfig {
        kind: IndexKind::Hash,
        index_columns: vec![2],
        ..IndexConfig::default()
    };
    let table = db
        .create_table_with("Grades", 5, 0, index_config)
        .unwrap();

    table.insert(&[1, 0, 55, 0, 0]).unwrap();
    table.insert(&[2, 0, 55, 0, 0]).unwrap();
    table.insert(&[3, 0, 77, 0, 0]).unwrap();

    assert_eq!(table.select(55, 2, &ALL).unwrap().len(), 2);

    table.update(2, &[None, None, Some(77), None, None]).unwrap();
    assert_eq!(table.select(55, 2, &ALL).unwrap().len(), 1);
    assert_eq!(table.select(77, 2, &ALL).unwrap().len(), 2);

    db.close().unwrap();
}

#[test]
fn bptree_index_serves_point_and_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let index_config = IndexConfig {
        kind: IndexKind::BPlusTree,
        fanout: 4,
        index_columns: vec![],
    };
    let table = db
        .create_table_with("Grades", 5, 0, index_config)
        .unwrap();

    for k in 0..200i64 {
        table.insert(&[k, k * 3, 0, 0, 0]).unwrap();
    }

    let records = table.select(150, 0, &ALL).unwrap();
    assert_eq!(records[0].columns[1], 450);

    let range = table.select_range(50, 59, 0, &ALL).unwrap();
    assert_eq!(range.len(), 10);

    assert_eq!(table.sum(0, 199, 0).unwrap(), (0..200).sum::<i64>());

    db.close().unwrap();
}

#[test]
fn persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut db = open_db(&dir);
        let table = db.create_table("Grades", 5, 0).unwrap();
        for k in 0..20i64 {
            table.insert(&[k, 10 * k, 0, 0, 0]).unwrap();
        }
        table.update(3, &[None, Some(-3), None, None, None]).unwrap();
        table.delete(5).unwrap();
        db.close().unwrap();
    }

    let mut db = open_db(&dir);
    let table = db.get_table("Grades").expect("table restored from metadata");
    assert_eq!(table.num_columns, 5);

    let records = table.select(3, 0, &ALL).unwrap();
    assert_eq!(records[0].columns[1], -3);

    assert!(table.select(5, 0, &ALL).unwrap().is_empty());

    for k in [0i64, 10, 19] {
        let records = table.select(k, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![k, 10 * k, 0, 0, 0]);
    }

    // The deleted key is reusable in the new session.
    table.insert(&[5, 1, 2, 3, 4]).unwrap();
    assert_eq!(table.select(5, 0, &ALL).unwrap()[0].columns[1], 1);

    db.close().unwrap();
}

#[test]
fn reopened_database_keeps_keys_unique() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut db = open_db(&dir);
        let table = db.create_table("Grades", 5, 0).unwrap();
        table.insert(&[1, 2, 3, 4, 5]).unwrap();
        db.close().unwrap();
    }

    let mut db = open_db(&dir);
    let table = db.get_table("Grades").unwrap();
    assert!(matches!(
        table.insert(&[1, 0, 0, 0, 0]),
        Err(DatabaseError::DuplicateKey(1))
    ));
    db.close().unwrap();
}

#[test]
fn merge_keeps_results_stable_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::with_config(Config {
        merge_update_threshold: 64,
        ..Config::default()
    });
    db.open(dir.path()).unwrap();
    let table = db.create_table("Grades", 5, 0).unwrap();

    let rows = Config::default().records_per_page() as i64 + 50;
    for k in 0..rows {
        table.insert(&[k, k, k, k, k]).unwrap();
    }
    // Enough updates to trip several background merges.
    for round in 1..=3i64 {
        for k in 0..rows / 2 {
            table
                .update(k, &[None, Some(k * 10 + round), None, None, None])
                .unwrap();
        }
    }
    table.force_merge().unwrap();

    for k in 0..rows / 2 {
        let records = table.select(k, 0, &ALL).unwrap();
        assert_eq!(records[0].columns[1], k * 10 + 3);
    }
    for k in rows / 2..rows {
        let records = table.select(k, 0, &ALL).unwrap();
        assert_eq!(records[0].columns[1], k);
    }

    db.close().unwrap();
}

#[test]
fn eviction_capped_pool_still_serves_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::with_config(Config {
        max_buffer_pages: Some(24),
        ..Config::default()
    });
    db.open(dir.path()).unwrap();
    let table = db.create_table("Grades", 5, 0).unwrap();

    let rows = Config::default().records_per_page() as i64 * 3;
    for k in 0..rows {
        table.insert(&[k, -k, k * 2, 0, 0]).unwrap();
    }

    for k in (0..rows).step_by(37) {
        let records = table.select(k, 0, &ALL).unwrap();
        assert_eq!(records[0].columns, vec![k, -k, k * 2, 0, 0]);
    }

    db.close().unwrap();
}

#[test]
fn drop_table_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir);
    let table = db.create_table("Temp", 3, 0).unwrap();
    table.insert(&[1, 2, 3]).unwrap();
    drop(table);

    db.drop_table("Temp").unwrap();
    assert!(db.get_table("Temp").is_none());
    assert!(db.drop_table("Temp").is_err());

    db.close().unwrap();
}
