//! Suspension, quarantine and rejected writes

mod common;

use chronodb_core::sequencer::{TxnRecord, TXN_LOG_FILE};
use chronodb_core::{ChronoError, Engine, JobStatus, Row, TableStatus, Value};
use common::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_failing_merge_suspends_until_resumed() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);

    commit_trades(&engine, (0..10).map(|i| (BASE_TS + i * HOUR, i)));
    apply_all(&engine, &table);

    // txn 2 rewrites the part into `2024-01-01.2`; a file there blocks it
    let blocker = table.dir().join("2024-01-01.2");
    fs::write(&blocker, b"not a directory").unwrap();
    commit_trades(&engine, [(BASE_TS + 1, 100)]);
    apply_all(&engine, &table);

    match table.status() {
        TableStatus::Suspended { txn, .. } => assert_eq!(txn, 2),
        other => panic!("expected suspension, got {:?}", other),
    }
    assert_eq!(engine.snapshot(TABLE).unwrap().version(), 1);
    assert_eq!(engine.apply_job().apply_table(&table), JobStatus::NoWork);

    // writers keep committing while apply is suspended
    assert_eq!(commit_trades(&engine, [(BASE_TS + 20 * HOUR, 101)]), 3);

    fs::remove_file(&blocker).unwrap();
    engine.resume_table(TABLE).unwrap();
    assert!(table.status().is_active());
    apply_all(&engine, &table);

    assert_eq!(engine.snapshot(TABLE).unwrap().version(), 3);
    let rows = visible(&engine);
    assert_eq!(rows.len(), 12);
    assert_eq!(rows[1], (BASE_TS + 1, 100));
    assert_eq!(rows[11], (BASE_TS + 20 * HOUR, 101));
}

#[test]
fn test_log_gap_quarantines_table() {
    let dir = TempDir::new().unwrap();
    let log_path = {
        let engine = open(&dir);
        let table = create_trades(&engine);
        commit_trades(&engine, [(BASE_TS, 0)]);
        commit_trades(&engine, [(BASE_TS + 1, 1)]);
        table.dir().join(TXN_LOG_FILE)
    };

    // rewrite txn 2 as txn 5, with a valid checksum
    let mut log = fs::read(&log_path).unwrap();
    let offset = TxnRecord::file_offset(2) as usize;
    let mut record = TxnRecord::decode(&log[offset..]).unwrap();
    record.txn = 5;
    log[offset..].copy_from_slice(&record.encode());
    fs::write(&log_path, &log).unwrap();

    let engine = open(&dir);
    let table = engine.table(TABLE).unwrap();
    match table.status() {
        TableStatus::Quarantined { reason } => {
            assert!(reason.contains("expected txn 2, found 5"), "{}", reason)
        }
        other => panic!("expected quarantine, got {:?}", other),
    }
    assert_eq!(table.sequencer().last_txn(), 1);
    assert_eq!(engine.apply_job().apply_table(&table), JobStatus::NoWork);
    assert_eq!(engine.snapshot(TABLE).unwrap().version(), 0);

    assert!(matches!(
        engine.resume_table(TABLE),
        Err(ChronoError::TableSuspended { .. })
    ));
    let mut writer = engine.writer(TABLE).unwrap();
    writer.append(trade(BASE_TS + 2, 2)).unwrap();
    assert!(matches!(
        writer.commit(),
        Err(ChronoError::TableSuspended { .. })
    ));
    assert_eq!(writer.pending_rows(), 1);
}

#[test]
fn test_rejected_rows_leave_batch_intact() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);
    let mut writer = engine.writer(TABLE).unwrap();

    writer.append(trade(BASE_TS, 0)).unwrap();
    let err = writer
        .append(Row::new(BASE_TS + 1).with("price", "high"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "table: trades, column: price; cast error from protocol type: STRING to column type: DOUBLE"
    );
    assert!(err.is_client_error());

    let err = writer
        .append(Row::new(BASE_TS + 2).with("ts", BASE_TS))
        .unwrap_err();
    assert!(matches!(err, ChronoError::Schema { .. }));

    // no partition period can hold it, so it never reaches apply
    let err = writer.append(trade(i64::MIN, 1)).unwrap_err();
    assert!(err.is_client_error(), "{}", err);

    assert_eq!(writer.pending_rows(), 1);
    assert_eq!(writer.commit().unwrap(), Some(1));
    writer.close().unwrap();
    apply_all(&engine, &table);
    assert_eq!(visible(&engine), vec![(BASE_TS, 0)]);
    assert!(table.status().is_active());
}

#[test]
fn test_new_columns_read_null_for_older_rows() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let table = create_trades(&engine);
    commit_trades(&engine, [(BASE_TS, 0), (BASE_TS + 1, 1)]);

    let mut writer = engine.writer(TABLE).unwrap();
    writer
        .append(trade(BASE_TS + 2, 2).with("venue", "XNAS"))
        .unwrap();
    // the column is sequenced before the rows that use it
    assert_eq!(writer.commit().unwrap(), Some(3));
    writer.close().unwrap();
    assert_eq!(table.sequencer().structure().version, 1);

    apply_all(&engine, &table);
    let snapshot = engine.snapshot(TABLE).unwrap();
    assert_eq!(snapshot.structure().columns.len(), 4);
    assert_eq!(
        snapshot.column("venue").unwrap().unwrap(),
        vec![Value::Null, Value::Null, Value::Str("XNAS".into())]
    );
    drop(snapshot);

    // the added column survives a restart
    drop(table);
    drop(engine);
    let engine = open(&dir);
    let writer = engine.writer(TABLE).unwrap();
    assert!(writer.structure().column_index("venue").is_some());
}

#[test]
fn test_column_creation_disabled() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.ingest.auto_create_columns = false;
    let engine = Engine::open(cfg).unwrap();
    create_trades(&engine);

    let mut writer = engine.writer(TABLE).unwrap();
    let err = writer
        .append(trade(BASE_TS, 0).with("venue", "XNAS"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "table: trades; column: venue does not exist, creating new columns is disabled"
    );
    assert_eq!(writer.commit().unwrap(), None);
}
