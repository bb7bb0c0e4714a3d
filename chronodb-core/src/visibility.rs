//! Commit visibility tracking and reader snapshots

use crate::schema::TableStructure;
use crate::storage::{read_partition, PartitionMeta, TableState};
use crate::{Result, Row, TableId, Timestamp, TxnId, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Published commit versions of all tables
#[derive(Default)]
pub struct CommitVisibilityTracker {
    tables: RwLock<HashMap<TableId, Arc<TableVisibility>>>,
}

impl CommitVisibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a table at its recovered state
    pub fn register(&self, table_id: TableId, table_dir: PathBuf, state: TableState) -> Arc<TableVisibility> {
        let visibility = Arc::new(TableVisibility::new(table_dir, state));
        self.tables.write().insert(table_id, visibility.clone());
        visibility
    }

    pub fn table(&self, table_id: TableId) -> Option<Arc<TableVisibility>> {
        self.tables.read().get(&table_id).cloned()
    }

    /// Commit version of a table, 0 if unknown or nothing applied
    pub fn version(&self, table_id: TableId) -> TxnId {
        self.table(table_id).map_or(0, |t| t.version())
    }
}

/// Visibility state of one table
pub struct TableVisibility {
    table_dir: PathBuf,
    version: AtomicU64,
    state: RwLock<Arc<TableState>>,
    /// Snapshot count per pinned version
    pins: Mutex<BTreeMap<TxnId, usize>>,
}

impl TableVisibility {
    fn new(table_dir: PathBuf, state: TableState) -> Self {
        Self {
            table_dir,
            version: AtomicU64::new(state.txn),
            state: RwLock::new(Arc::new(state)),
            pins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Latest fully applied txn
    pub fn version(&self) -> TxnId {
        self.version.load(Ordering::Acquire)
    }

    /// Published state
    pub fn state(&self) -> Arc<TableState> {
        self.state.read().clone()
    }

    /// Expose a newly applied state; versions never go backwards
    pub fn publish(&self, state: TableState) {
        let mut current = self.state.write();
        if state.txn < current.txn {
            return;
        }
        self.version.store(state.txn, Ordering::Release);
        *current = Arc::new(state);
    }

    /// Pin the current version for the lifetime of the returned snapshot
    pub fn current_snapshot(self: &Arc<Self>) -> Snapshot {
        // pin under the state lock so publish cannot slip in between
        let state = self.state.read();
        *self.pins.lock().entry(state.txn).or_insert(0) += 1;
        Snapshot {
            owner: self.clone(),
            state: state.clone(),
        }
    }

    /// Oldest version some snapshot still reads
    pub fn oldest_pinned(&self) -> Option<TxnId> {
        self.pins.lock().keys().next().copied()
    }

    fn unpin(&self, version: TxnId) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
            }
        }
    }
}

/// Consistent view of a table at one commit version
pub struct Snapshot {
    owner: Arc<TableVisibility>,
    state: Arc<TableState>,
}

impl Snapshot {
    /// Commit version the snapshot reads at
    pub fn version(&self) -> TxnId {
        self.state.txn
    }

    pub fn structure(&self) -> &TableStructure {
        &self.state.structure
    }

    pub fn row_count(&self) -> u64 {
        self.state.row_count
    }

    /// Partition parts in time order
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionMeta> {
        self.state.partitions.values()
    }

    /// Every row in timestamp order
    pub fn rows(&self) -> Result<Vec<Row>> {
        let structure = &self.state.structure;
        let mut rows = Vec::with_capacity(self.state.row_count as usize);
        for part in self.partitions() {
            let columns =
                read_partition(&self.owner.table_dir, part, structure, &self.state.symbols)?;
            let count = part.row_count as usize;
            for i in 0..count {
                let timestamp = columns[structure.timestamp_index][i].as_i64().unwrap_or_default();
                let mut row = Row::new(timestamp);
                for (idx, def) in structure.columns.iter().enumerate() {
                    if idx == structure.timestamp_index || columns[idx][i].is_null() {
                        continue;
                    }
                    row.fields.insert(def.name.clone(), columns[idx][i].clone());
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// All values of one column in timestamp order, `None` if unknown
    pub fn column(&self, name: &str) -> Result<Option<Vec<Value>>> {
        let structure = &self.state.structure;
        let Some(idx) = structure.column_index(name) else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(self.state.row_count as usize);
        for part in self.partitions() {
            let mut columns =
                read_partition(&self.owner.table_dir, part, structure, &self.state.symbols)?;
            values.append(&mut columns[idx]);
        }
        Ok(Some(values))
    }

    /// Designated timestamps in storage order
    pub fn timestamps(&self) -> Result<Vec<Timestamp>> {
        let name = self.state.structure.timestamp_column().to_string();
        Ok(self
            .column(&name)?
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_i64)
            .collect())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.owner.unpin(self.state.txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use crate::{ColumnType, PartitionBy};

    fn state(txn: TxnId) -> TableState {
        let mut state = TableState::empty(
            TableStructure::new(
                "t",
                vec![ColumnDef::new("ts", ColumnType::Timestamp)],
                "ts",
                PartitionBy::Day,
            )
            .unwrap(),
        );
        state.txn = txn;
        state
    }

    #[test]
    fn test_snapshot_pins_version() {
        let tracker = CommitVisibilityTracker::new();
        let table = tracker.register(1, PathBuf::from("unused"), state(0));

        let before = table.current_snapshot();
        table.publish(state(3));
        let after = table.current_snapshot();

        assert_eq!(before.version(), 0);
        assert_eq!(after.version(), 3);
        assert_eq!(tracker.version(1), 3);
        assert_eq!(table.oldest_pinned(), Some(0));

        drop(before);
        assert_eq!(table.oldest_pinned(), Some(3));
        drop(after);
        assert_eq!(table.oldest_pinned(), None);
    }

    #[test]
    fn test_publish_never_regresses() {
        let tracker = CommitVisibilityTracker::new();
        let table = tracker.register(1, PathBuf::from("unused"), state(5));
        table.publish(state(4));
        assert_eq!(table.version(), 5);
    }
}
