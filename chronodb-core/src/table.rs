//! Shared per-table handle

use crate::sequencer::TableSequencer;
use crate::{SegmentId, TableId, TxnId, WalId};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Apply status of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    /// Transactions are applied as they arrive
    Active,
    /// Merge kept failing at `txn`; resumable once the cause is fixed
    Suspended { txn: TxnId, reason: String },
    /// Transaction log is inconsistent; needs manual recovery
    Quarantined { reason: String },
}

impl TableStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TableStatus::Active)
    }
}

/// State shared by every writer session, job and reader of one table
pub struct TableHandle {
    id: TableId,
    name: String,
    dir: PathBuf,
    sequencer: Arc<TableSequencer>,
    status: RwLock<TableStatus>,
    next_wal_id: AtomicU32,
    /// Segment currently open by each live writer session
    active_segments: Mutex<HashMap<WalId, Option<SegmentId>>>,
    notifier: Sender<TableId>,
}

impl TableHandle {
    pub(crate) fn new(
        id: TableId,
        name: String,
        dir: PathBuf,
        sequencer: Arc<TableSequencer>,
        first_free_wal: WalId,
        notifier: Sender<TableId>,
    ) -> Self {
        let status = match sequencer.quarantine_reason() {
            Some(reason) => TableStatus::Quarantined { reason },
            None => TableStatus::Active,
        };
        Self {
            id,
            name,
            dir,
            sequencer,
            status: RwLock::new(status),
            next_wal_id: AtomicU32::new(first_free_wal),
            active_segments: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sequencer(&self) -> &Arc<TableSequencer> {
        &self.sequencer
    }

    pub fn status(&self) -> TableStatus {
        self.status.read().clone()
    }

    /// Stop applying after repeated merge failures
    pub fn suspend(&self, txn: TxnId, reason: String) {
        error!("Suspending table {} at txn {}: {}", self.name, txn, reason);
        *self.status.write() = TableStatus::Suspended { txn, reason };
    }

    /// Stop applying because the log cannot be trusted
    pub fn quarantine(&self, reason: String) {
        error!("Quarantining table {}: {}", self.name, reason);
        *self.status.write() = TableStatus::Quarantined { reason };
    }

    /// Clear a suspension. Quarantine is not lifted: the log itself is bad.
    pub fn resume(&self) -> bool {
        let mut status = self.status.write();
        match &*status {
            TableStatus::Suspended { .. } => {
                *status = TableStatus::Active;
                true
            }
            _ => false,
        }
    }

    /// Queue the table for the apply job
    pub fn notify(&self) {
        if self.notifier.send(self.id).is_err() {
            warn!("Apply queue closed, table {} not scheduled", self.name);
        }
    }

    /// Reserve a fresh WAL id for a writer session
    pub(crate) fn register_wal(&self) -> WalId {
        let wal_id = self.next_wal_id.fetch_add(1, Ordering::SeqCst);
        self.active_segments.lock().insert(wal_id, None);
        wal_id
    }

    pub(crate) fn set_active_segment(&self, wal_id: WalId, segment_id: Option<SegmentId>) {
        self.active_segments.lock().insert(wal_id, segment_id);
    }

    pub(crate) fn release_wal(&self, wal_id: WalId) {
        self.active_segments.lock().remove(&wal_id);
    }

    /// Run `f` while no writer can register or switch segments
    pub(crate) fn with_active_segments<R>(
        &self,
        f: impl FnOnce(&HashMap<WalId, Option<SegmentId>>) -> R,
    ) -> R {
        let active = self.active_segments.lock();
        f(&active)
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &*self.status.read())
            .finish()
    }
}
