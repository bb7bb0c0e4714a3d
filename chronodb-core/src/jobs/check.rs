//! Pending transaction check

use super::{Job, JobStatus};
use crate::engine::Engine;
use std::sync::Arc;
use tracing::debug;

/// Queues every active table whose sequencer is ahead of its commit version.
///
/// Covers notifications lost to a restart or to a table that was suspended
/// and later resumed.
pub struct CheckWalTransactionsJob {
    engine: Arc<Engine>,
}

impl CheckWalTransactionsJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Job for CheckWalTransactionsJob {
    fn name(&self) -> &'static str {
        "check-wal-transactions"
    }

    fn try_run_once(&self) -> JobStatus {
        let mut queued = 0;
        for table in self.engine.all_tables() {
            if !table.status().is_active() {
                continue;
            }
            let version = self.engine.visibility().version(table.id());
            if table.sequencer().last_txn() > version {
                debug!(
                    "Table {} has txns {}..={} pending",
                    table.name(),
                    version + 1,
                    table.sequencer().last_txn()
                );
                table.notify();
                queued += 1;
            }
        }
        if queued > 0 {
            JobStatus::DidWork
        } else {
            JobStatus::NoWork
        }
    }
}
