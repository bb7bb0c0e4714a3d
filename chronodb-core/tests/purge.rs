//! Snapshot isolation and WAL purge safety

mod common;

use chronodb_core::wal::list_segments;
use common::*;
use tempfile::TempDir;

#[test]
fn test_snapshot_survives_rewrite_and_append() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);

    commit_trades(&engine, (0..10).map(|i| (BASE_TS + i * HOUR, i)));
    apply_all(&engine, &table);
    let first = engine.snapshot(TABLE).unwrap();

    // in-order append past the published size
    commit_trades(&engine, (10..15).map(|i| (BASE_TS + i * HOUR, i)));
    apply_all(&engine, &table);
    let second = engine.snapshot(TABLE).unwrap();

    // O3 rows force a rewrite into a new directory
    commit_trades(&engine, (0..5).map(|i| (BASE_TS + i * HOUR + 1, 100 + i)));
    apply_all(&engine, &table);

    assert_eq!(first.version(), 1);
    assert_eq!(first.rows().unwrap().len(), 10);
    assert_eq!(second.version(), 2);
    assert_eq!(second.rows().unwrap().len(), 15);

    let latest = engine.snapshot(TABLE).unwrap();
    assert_eq!(latest.version(), 3);
    let rows = latest.rows().unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[1].fields["seq"].as_i64(), Some(100));
    assert_eq!(
        latest.partitions().map(|p| p.dir_name()).collect::<Vec<_>>(),
        vec!["2024-01-01.3".to_string()]
    );
}

#[test]
fn test_purge_keeps_versions_pinned_by_readers() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);
    let purge = engine.purge_job();

    commit_trades(&engine, (0..10).map(|i| (BASE_TS + i * HOUR, i)));
    apply_all(&engine, &table);
    let pinned = engine.snapshot(TABLE).unwrap();

    commit_trades(&engine, (0..5).map(|i| (BASE_TS + i * HOUR + 1, 100 + i)));
    apply_all(&engine, &table);

    let stats = purge.purge_table(&table).unwrap().unwrap();
    assert_eq!(stats.segments, 2);
    assert_eq!(stats.wal_dirs, 2);
    assert_eq!(stats.partition_dirs, 0);
    assert!(table.dir().join("2024-01-01.1").is_dir());
    assert_eq!(pinned.rows().unwrap().len(), 10);

    drop(pinned);
    let stats = purge.purge_table(&table).unwrap().unwrap();
    assert_eq!(stats.partition_dirs, 1);
    assert!(!table.dir().join("2024-01-01.1").exists());
    assert!(table.dir().join("2024-01-01.2").is_dir());
    assert_eq!(visible(&engine).len(), 15);
}

#[test]
fn test_purge_never_removes_unapplied_or_open_segments() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);
    let purge = engine.purge_job();

    let mut open_writer = engine.writer(TABLE).unwrap();
    open_writer.append(trade(BASE_TS, 0)).unwrap();
    assert_eq!(open_writer.commit().unwrap(), Some(1));
    commit_trades(&engine, [(BASE_TS + 1, 1)]);

    // nothing applied yet
    let stats = purge.purge_table(&table).unwrap().unwrap();
    assert_eq!(stats.segments, 0);
    assert_eq!(list_segments(table.dir()).unwrap().len(), 2);

    apply_all(&engine, &table);
    let stats = purge.purge_table(&table).unwrap().unwrap();
    assert_eq!(stats.segments, 1);
    assert_eq!(
        list_segments(table.dir()).unwrap(),
        vec![(open_writer.wal_id(), 0)]
    );

    // the open segment goes once its session ends
    open_writer.close().unwrap();
    let stats = purge.purge_table(&table).unwrap().unwrap();
    assert_eq!(stats.segments, 1);
    assert!(list_segments(table.dir()).unwrap().is_empty());

    // purged WAL is not needed to reopen
    drop(purge);
    drop(table);
    drop(engine);
    let engine = open(&dir);
    assert_eq!(visible(&engine), vec![(BASE_TS, 0), (BASE_TS + 1, 1)]);
}

#[test]
fn test_purge_pauses_while_run_lock_held() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);
    commit_trades(&engine, [(BASE_TS, 0)]);

    // hold the run lock: the periodic pass is paused
    let run_lock = engine.purge_run_lock();
    let guard = run_lock.lock();
    assert!(engine.purge_job().run().is_none());
    drop(guard);

    apply_all(&engine, &table);
    let stats = engine.purge_job().run().unwrap();
    assert_eq!(stats.segments, 1);
}
