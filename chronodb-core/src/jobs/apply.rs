//! WAL apply job

use super::{Job, JobStatus};
use crate::engine::Engine;
use crate::merge::O3MergeEngine;
use crate::sequencer::{TxnCursor, TxnKind, TxnRecord};
use crate::storage::TableState;
use crate::table::TableHandle;
use crate::visibility::TableVisibility;
use crate::wal::read_record_at;
use crate::{ChronoError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drains the apply queue, merging sequenced transactions into storage.
///
/// Each step handles one queued table and applies at most
/// `max_txns_per_run` of its transactions in id order. A table whose apply
/// lock is held elsewhere is re-queued and skipped with
/// [`JobStatus::WouldBlock`].
pub struct WalApplyJob {
    engine: Arc<Engine>,
}

impl WalApplyJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Apply pending transactions of one table
    pub fn apply_table(&self, table: &Arc<TableHandle>) -> JobStatus {
        if !table.status().is_active() {
            return JobStatus::NoWork;
        }
        let Some(guard) = self.engine.locks().try_acquire(table.id()) else {
            // the holder may be purge, which never re-queues
            table.notify();
            return JobStatus::WouldBlock;
        };
        let visibility = match self.engine.table_visibility(table.id()) {
            Ok(v) => v,
            Err(e) => {
                warn!("Cannot apply table {}: {}", table.name(), e);
                return JobStatus::NoWork;
            }
        };

        let applied = self.drain(table, &visibility);
        drop(guard);

        // a commit may have arrived after the cursor caught up
        if table.status().is_active() && table.sequencer().last_txn() > visibility.version() {
            table.notify();
        }
        if applied > 0 {
            JobStatus::DidWork
        } else {
            JobStatus::NoWork
        }
    }

    fn drain(&self, table: &TableHandle, visibility: &TableVisibility) -> usize {
        let config = &self.engine.config().apply;
        let mut state = visibility.state();
        let mut cursor = match TxnCursor::open(table.sequencer(), state.txn) {
            Ok(cursor) => cursor,
            Err(e) => {
                table.suspend(state.txn + 1, format!("cannot read txn log: {}", e));
                return 0;
            }
        };

        let mut applied = 0;
        while applied < config.max_txns_per_run {
            let record = match cursor.next() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) if e.is_corruption() => {
                    table.quarantine(e.to_string());
                    break;
                }
                Err(e) => {
                    table.suspend(cursor.position() + 1, format!("cannot read txn log: {}", e));
                    break;
                }
            };

            match self.apply_with_retries(table, &state, &record) {
                Ok(next) => {
                    visibility.publish(next);
                    state = visibility.state();
                    applied += 1;
                }
                Err(e) if e.is_corruption() || matches!(e, ChronoError::InvalidFormat(_)) => {
                    table.quarantine(format!("txn {}: {}", record.txn, e));
                    break;
                }
                Err(e) => {
                    table.suspend(record.txn, e.to_string());
                    break;
                }
            }
        }

        if applied > 0 {
            info!(
                "Table {} applied {} txns, commit version {}",
                table.name(),
                applied,
                state.txn
            );
        }
        applied
    }

    fn apply_with_retries(
        &self,
        table: &TableHandle,
        state: &TableState,
        record: &TxnRecord,
    ) -> Result<TableState> {
        let retries = self.engine.config().apply.max_merge_retries;
        let mut attempt = 0;
        loop {
            match self.apply_one(table, state, record) {
                Ok(next) => return Ok(next),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Table {} txn {} merge attempt {} failed: {}",
                        table.name(),
                        record.txn,
                        attempt,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Merge one transaction and durably record the result
    fn apply_one(
        &self,
        table: &TableHandle,
        state: &TableState,
        record: &TxnRecord,
    ) -> Result<TableState> {
        let config = &self.engine.config().apply;
        let merge = O3MergeEngine::new(table.dir(), config.o3_split_min_rows, config.max_split_parts);
        let into_merge_error = |e: ChronoError| match e {
            ChronoError::Io(source) => ChronoError::MergeIo {
                table: table.name().to_string(),
                txn: record.txn,
                source,
            },
            other => other,
        };

        let wal_record = read_record_at(
            table.dir(),
            record.wal_id,
            record.segment_id,
            record.segment_offset,
        )
        .map_err(|e| match e {
            ChronoError::Io(source) if source.kind() == std::io::ErrorKind::NotFound => {
                ChronoError::Corruption(format!(
                    "WAL segment {}/{} of txn {} is missing",
                    record.wal_id, record.segment_id, record.txn
                ))
            }
            other => into_merge_error(other),
        })?;

        let next = match record.kind {
            TxnKind::Structure => {
                let change = wal_record.structure_change()?;
                merge.apply_structure(state, record.txn, &change)?
            }
            TxnKind::Data => {
                let batch = wal_record.data_batch()?;
                if batch.row_count != record.row_count {
                    return Err(ChronoError::Corruption(format!(
                        "txn {} logged {} rows, WAL record holds {}",
                        record.txn, record.row_count, batch.row_count
                    )));
                }
                let (next, stats) = merge
                    .apply_data(state, record.txn, batch)
                    .map_err(into_merge_error)?;
                debug!("Table {} txn {}: {:?}", table.name(), record.txn, stats);
                next
            }
        };

        next.persist(table.dir()).map_err(into_merge_error)?;
        Ok(next)
    }
}

impl Job for WalApplyJob {
    fn name(&self) -> &'static str {
        "wal-apply"
    }

    fn try_run_once(&self) -> JobStatus {
        let Ok(table_id) = self.engine.apply_queue().try_recv() else {
            return JobStatus::NoWork;
        };
        let status = match self.engine.table_by_id(table_id) {
            Some(table) => self.apply_table(&table),
            None => JobStatus::NoWork,
        };
        if status == JobStatus::NoWork && !self.engine.apply_queue().is_empty() {
            JobStatus::DidWork
        } else {
            status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::schema::{ColumnDef, TableStructure};
    use crate::{ColumnType, PartitionBy, Row};
    use tempfile::TempDir;

    #[test]
    fn test_blocked_table_stays_queued() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let structure = TableStructure::new(
            "t",
            vec![
                ColumnDef::new("v", ColumnType::Long),
                ColumnDef::new("ts", ColumnType::Timestamp),
            ],
            "ts",
            PartitionBy::Day,
        )
        .unwrap();
        let table = engine.create_table(structure).unwrap();
        let mut writer = engine.writer("t").unwrap();
        writer.append(Row::new(10).with("v", 1i64)).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();

        // held the way a purge pass holds it
        let guard = engine.locks().try_acquire(table.id()).unwrap();
        let job = engine.apply_job();
        while engine.apply_queue().try_recv().is_ok() {}
        assert_eq!(job.apply_table(&table), JobStatus::WouldBlock);
        assert_eq!(engine.apply_queue().try_recv(), Ok(table.id()));
        table.notify();
        drop(guard);

        assert_eq!(job.try_run_once(), JobStatus::DidWork);
        assert_eq!(engine.snapshot("t").unwrap().version(), 1);
    }
}
