//! Engine - top-level coordinator of tables, writers and jobs

use crate::jobs::{ApplyConfig, CheckWalTransactionsJob, PurgeConfig, WalApplyJob, WalPurgeJob};
use crate::locks::TableLockRegistry;
use crate::schema::{ColumnDef, TableStructure};
use crate::sequencer::TableSequencer;
use crate::storage::{sync_dir, TableState};
use crate::table::{TableHandle, TableStatus};
use crate::visibility::{CommitVisibilityTracker, Snapshot, TableVisibility};
use crate::wal::{list_wals, SyncPolicy, WalConfig, WalWriter};
use crate::{ChronoError, ColumnType, PartitionBy, Result, Row, TableId, TxnId};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Initial structure file inside a table directory
pub const META_FILE: &str = "_meta";

/// Designated timestamp column of auto-created tables
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "timestamp";

/// Ingestion behaviour for unknown tables and columns
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub auto_create_tables: bool,
    pub auto_create_columns: bool,
    /// Partitioning of auto-created tables
    pub default_partition_by: PartitionBy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            auto_create_tables: true,
            auto_create_columns: true,
            default_partition_by: PartitionBy::Day,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory
    pub data_dir: PathBuf,
    pub wal: WalConfig,
    pub apply: ApplyConfig,
    pub purge: PurgeConfig,
    pub ingest: IngestConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            wal: WalConfig::default(),
            apply: ApplyConfig::default(),
            purge: PurgeConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.wal.segment_size == 0 || self.wal.segment_rows == 0 {
            return Err(ChronoError::Config("WAL segment limits must be positive".into()));
        }
        if matches!(self.wal.sync_policy, SyncPolicy::EveryN(0)) {
            return Err(ChronoError::Config("sync every 0 writes".into()));
        }
        if self.apply.max_txns_per_run == 0 {
            return Err(ChronoError::Config("max_txns_per_run must be positive".into()));
        }
        if self.apply.max_split_parts == 0 {
            return Err(ChronoError::Config("max_split_parts must be positive".into()));
        }
        Ok(())
    }
}

/// Summary of one table for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    #[serde(flatten)]
    pub status: TableStatus,
    /// Last sequenced txn
    pub sequencer_txn: TxnId,
    /// Last applied txn
    pub commit_version: TxnId,
    pub structure_version: u64,
    pub row_count: u64,
    pub partitions: usize,
}

/// ChronoDB engine
pub struct Engine {
    config: EngineConfig,
    tables: RwLock<HashMap<String, Arc<TableHandle>>>,
    by_id: RwLock<HashMap<TableId, Arc<TableHandle>>>,
    next_table_id: AtomicU32,
    create_lock: Mutex<()>,
    visibility: CommitVisibilityTracker,
    locks: TableLockRegistry,
    apply_tx: Sender<TableId>,
    apply_rx: Receiver<TableId>,
    purge_run_lock: Arc<Mutex<()>>,
}

impl Engine {
    /// Open the data directory, recovering every table in it
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let (apply_tx, apply_rx) = crossbeam_channel::unbounded();

        let engine = Arc::new(Self {
            config,
            tables: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            next_table_id: AtomicU32::new(1),
            create_lock: Mutex::new(()),
            visibility: CommitVisibilityTracker::new(),
            locks: TableLockRegistry::new(),
            apply_tx,
            apply_rx,
            purge_run_lock: Arc::new(Mutex::new(())),
        });

        engine.load_tables()?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a table
    pub fn create_table(&self, structure: TableStructure) -> Result<Arc<TableHandle>> {
        check_table_name(&structure.name)?;
        let _creating = self.create_lock.lock();
        if self.tables.read().contains_key(&structure.name) {
            return Err(ChronoError::TableExists(structure.name));
        }

        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let dir = self
            .config
            .data_dir
            .join(format!("{}~{}", structure.name, id));
        fs::create_dir_all(&dir)?;
        write_meta(&dir, &structure)?;

        let handle = self.register(id, dir, TableState::empty(structure))?;
        info!("Created table: {}", handle.name());
        Ok(handle)
    }

    /// Get a table by name
    pub fn table(&self, name: &str) -> Result<Arc<TableHandle>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ChronoError::TableNotFound(name.to_string()))
    }

    /// List table names
    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start a writer session for an existing table
    pub fn writer(&self, name: &str) -> Result<WalWriter> {
        let table = self.table(name)?;
        Ok(WalWriter::open(
            table,
            self.config.wal.clone(),
            self.config.ingest.auto_create_columns,
        ))
    }

    /// Start a writer session, creating the table from `sample` if needed
    pub fn writer_or_create(&self, name: &str, sample: &Row) -> Result<WalWriter> {
        if let Ok(writer) = self.writer(name) {
            return Ok(writer);
        }

        let ingest = &self.config.ingest;
        if !ingest.auto_create_tables {
            return Err(ChronoError::schema(
                name,
                "table does not exist, creating new tables is disabled",
            ));
        }
        if !ingest.auto_create_columns {
            return Err(ChronoError::schema(
                name,
                "table does not exist, cannot create table, creating new columns is disabled",
            ));
        }

        let mut columns: Vec<ColumnDef> = sample
            .fields
            .iter()
            .filter_map(|(column, value)| {
                ColumnType::infer(value).map(|t| ColumnDef::new(column.clone(), t))
            })
            .collect();
        columns.push(ColumnDef::new(DEFAULT_TIMESTAMP_COLUMN, ColumnType::Timestamp));
        let structure = TableStructure::new(
            name,
            columns,
            DEFAULT_TIMESTAMP_COLUMN,
            ingest.default_partition_by,
        )?;

        match self.create_table(structure) {
            Ok(_) | Err(ChronoError::TableExists(_)) => self.writer(name),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of the latest applied version of a table
    pub fn snapshot(&self, name: &str) -> Result<Snapshot> {
        let table = self.table(name)?;
        Ok(self.table_visibility(table.id())?.current_snapshot())
    }

    /// Apply status of a table
    pub fn table_status(&self, name: &str) -> Result<TableStatus> {
        Ok(self.table(name)?.status())
    }

    /// Status summary of every table
    pub fn tables_info(&self) -> Vec<TableInfo> {
        let mut infos: Vec<_> = self
            .all_tables()
            .iter()
            .map(|table| {
                let state = self
                    .visibility
                    .table(table.id())
                    .map(|v| v.state());
                TableInfo {
                    id: table.id(),
                    name: table.name().to_string(),
                    status: table.status(),
                    sequencer_txn: table.sequencer().last_txn(),
                    commit_version: state.as_ref().map_or(0, |s| s.txn),
                    structure_version: table.sequencer().structure().version,
                    row_count: state.as_ref().map_or(0, |s| s.row_count),
                    partitions: state.as_ref().map_or(0, |s| s.partitions.len()),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Clear a suspension and schedule the table again
    pub fn resume_table(&self, name: &str) -> Result<()> {
        let table = self.table(name)?;
        match table.status() {
            TableStatus::Active => Ok(()),
            TableStatus::Suspended { .. } => {
                table.resume();
                info!("Resumed table {}", name);
                table.notify();
                Ok(())
            }
            TableStatus::Quarantined { reason } => Err(ChronoError::TableSuspended {
                table: name.to_string(),
                reason,
            }),
        }
    }

    /// Apply job draining the shared apply queue
    pub fn apply_job(self: &Arc<Self>) -> WalApplyJob {
        WalApplyJob::new(self.clone())
    }

    /// Purge job using the configured interval
    pub fn purge_job(self: &Arc<Self>) -> WalPurgeJob {
        WalPurgeJob::new(self.clone(), self.config.purge.interval)
    }

    pub fn check_job(self: &Arc<Self>) -> CheckWalTransactionsJob {
        CheckWalTransactionsJob::new(self.clone())
    }

    /// Holding this lock pauses the purge job
    pub fn purge_run_lock(&self) -> Arc<Mutex<()>> {
        self.purge_run_lock.clone()
    }

    pub(crate) fn table_by_id(&self, id: TableId) -> Option<Arc<TableHandle>> {
        self.by_id.read().get(&id).cloned()
    }

    pub(crate) fn all_tables(&self) -> Vec<Arc<TableHandle>> {
        self.by_id.read().values().cloned().collect()
    }

    pub(crate) fn table_visibility(&self, id: TableId) -> Result<Arc<TableVisibility>> {
        self.visibility
            .table(id)
            .ok_or_else(|| ChronoError::Internal(format!("table {} has no visibility state", id)))
    }

    pub(crate) fn visibility(&self) -> &CommitVisibilityTracker {
        &self.visibility
    }

    pub(crate) fn locks(&self) -> &TableLockRegistry {
        &self.locks
    }

    pub(crate) fn apply_queue(&self) -> &Receiver<TableId> {
        &self.apply_rx
    }

    fn register(&self, id: TableId, dir: PathBuf, state: TableState) -> Result<Arc<TableHandle>> {
        let sequencer = Arc::new(TableSequencer::open(
            &dir,
            id,
            state.structure.clone(),
            self.config.wal.sync_policy,
        )?);
        let first_free_wal = list_wals(&dir)?
            .into_iter()
            .chain(sequencer.max_wal_id())
            .max()
            .map_or(1, |w| w + 1);

        let handle = Arc::new(TableHandle::new(
            id,
            state.structure.name.clone(),
            dir.clone(),
            sequencer,
            first_free_wal,
            self.apply_tx.clone(),
        ));
        if state.txn > handle.sequencer().last_txn() {
            handle.quarantine(format!(
                "applied txn {} is ahead of sequenced txn {}",
                state.txn,
                handle.sequencer().last_txn()
            ));
        }

        let pending = handle.sequencer().last_txn() > state.txn;
        self.visibility.register(id, dir, state);
        self.tables
            .write()
            .insert(handle.name().to_string(), handle.clone());
        self.by_id.write().insert(id, handle.clone());

        if pending {
            handle.notify();
        }
        Ok(handle)
    }

    fn load_tables(&self) -> Result<()> {
        let mut max_id = 0;
        for entry in fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let Some((name, id)) = parse_table_dir(&dir_name) else {
                continue;
            };
            max_id = max_id.max(id);

            match self.load_table(&entry.path(), id) {
                Ok(handle) => info!(
                    "Loaded table {}: commit version {}, last txn {}",
                    name,
                    self.visibility.version(id),
                    handle.sequencer().last_txn()
                ),
                Err(e) => warn!("Failed to load table {}: {}", name, e),
            }
        }
        self.next_table_id.store(max_id + 1, Ordering::SeqCst);
        Ok(())
    }

    fn load_table(&self, dir: &Path, id: TableId) -> Result<Arc<TableHandle>> {
        let meta = fs::read(dir.join(META_FILE))?;
        let initial: TableStructure = serde_json::from_slice(&meta)
            .map_err(|e| ChronoError::Corruption(format!("{}: {}", META_FILE, e)))?;
        let state = TableState::load(dir)?.unwrap_or_else(|| TableState::empty(initial));
        self.register(id, dir.to_path_buf(), state)
    }
}

fn write_meta(dir: &Path, structure: &TableStructure) -> Result<()> {
    let json = serde_json::to_vec_pretty(structure)
        .map_err(|e| ChronoError::InvalidFormat(e.to_string()))?;
    let tmp = dir.join(format!("{}.tmp", META_FILE));
    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&tmp, dir.join(META_FILE))?;
    sync_dir(dir)
}

fn check_table_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.chars().any(|c| matches!(c, '/' | '\\' | '~' | '\0'))
    {
        return Err(ChronoError::schema(name, "invalid table name"));
    }
    Ok(())
}

/// Parse a `<name>~<id>` table directory name
fn parse_table_dir(dir_name: &str) -> Option<(&str, TableId)> {
    let (name, id) = dir_name.rsplit_once('~')?;
    Some((name, id.parse().ok()?))
}
