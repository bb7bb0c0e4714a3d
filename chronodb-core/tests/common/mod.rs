#![allow(dead_code)]

use chronodb_core::schema::{ColumnDef, TableStructure};
use chronodb_core::table::TableHandle;
use chronodb_core::{ColumnType, Engine, EngineConfig, JobStatus, PartitionBy, Row, Timestamp};
use std::sync::Arc;
use tempfile::TempDir;

/// 2024-01-01T00:00:00Z
pub const BASE_TS: Timestamp = 1_704_067_200_000_000;
pub const HOUR: Timestamp = 3_600_000_000;
pub const DAY: Timestamp = 24 * HOUR;

pub const TABLE: &str = "trades";

pub fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

pub fn open(dir: &TempDir) -> Arc<Engine> {
    Engine::open(config(dir)).unwrap()
}

/// `trades(price DOUBLE, seq LONG, ts TIMESTAMP)` partitioned by day
pub fn trades_structure() -> TableStructure {
    TableStructure::new(
        TABLE,
        vec![
            ColumnDef::new("price", ColumnType::Double),
            ColumnDef::new("seq", ColumnType::Long),
            ColumnDef::new("ts", ColumnType::Timestamp),
        ],
        "ts",
        PartitionBy::Day,
    )
    .unwrap()
}

pub fn create_trades(engine: &Engine) -> Arc<TableHandle> {
    engine.create_table(trades_structure()).unwrap()
}

pub fn trade(ts: Timestamp, seq: i64) -> Row {
    Row::new(ts).with("price", 100.0 + seq as f64).with("seq", seq)
}

/// Commit one batch of trades through a fresh writer session
pub fn commit_trades(engine: &Engine, rows: impl IntoIterator<Item = (Timestamp, i64)>) -> u64 {
    let mut writer = engine.writer(TABLE).unwrap();
    for (ts, seq) in rows {
        writer.append(trade(ts, seq)).unwrap();
    }
    let txn = writer.commit().unwrap().unwrap();
    writer.close().unwrap();
    txn
}

/// Run the apply job on a table until it stops making progress
pub fn apply_all(engine: &Arc<Engine>, table: &Arc<TableHandle>) {
    let job = engine.apply_job();
    while job.apply_table(table) == JobStatus::DidWork {}
}

/// `(ts, seq)` pairs visible at the latest commit version
pub fn visible(engine: &Engine) -> Vec<(Timestamp, i64)> {
    engine
        .snapshot(TABLE)
        .unwrap()
        .rows()
        .unwrap()
        .into_iter()
        .map(|row| (row.timestamp, row.fields["seq"].as_i64().unwrap()))
        .collect()
}
