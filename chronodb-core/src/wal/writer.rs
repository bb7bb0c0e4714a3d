//! WAL writer session

use super::{segment_dir, DataBatch, SymbolColumn, SyncTracker, WalColumn, WalConfig, WalRecord};
use super::{EVENTS_FILE, SEALED_MARKER};
use crate::schema::{ColumnDef, StructureChange, TableStructure};
use crate::sequencer::{DataSummary, SegmentRef};
use crate::table::TableHandle;
use crate::{ChronoError, ColumnType, Result, Row, SegmentId, Timestamp, TxnId, Value, WalId};
use crate::{MAX_TIMESTAMP, MIN_TIMESTAMP};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Append-only writer session for one table.
///
/// Each session owns its WAL directory, so sessions never contend with each
/// other; they only meet inside the sequencer when committing. Rows are
/// buffered column-wise until `commit`.
pub struct WalWriter {
    table: Arc<TableHandle>,
    config: WalConfig,
    auto_create_columns: bool,
    wal_id: WalId,
    structure: TableStructure,
    segment: Option<Segment>,
    next_segment_id: SegmentId,
    buffer: RowBuffer,
    /// Session-local symbol keys per column index
    symbol_keys: HashMap<usize, HashMap<String, i32>>,
    closed: bool,
}

struct Segment {
    id: SegmentId,
    dir: PathBuf,
    file: BufWriter<File>,
    bytes: u64,
    rows: u64,
    sync: SyncTracker,
}

struct RowBuffer {
    columns: Vec<Vec<Value>>,
    rows: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    ordered: bool,
}

impl RowBuffer {
    fn new(width: usize) -> Self {
        Self {
            columns: vec![Vec::new(); width],
            rows: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
            ordered: true,
        }
    }

    fn push(&mut self, timestamp: Timestamp, values: Vec<Value>) {
        if self.rows > 0 && timestamp < self.max_timestamp {
            self.ordered = false;
        }
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value);
        }
        self.rows += 1;
    }

    fn widen(&mut self, width: usize) {
        while self.columns.len() < width {
            self.columns.push(vec![Value::Null; self.rows as usize]);
        }
    }
}

impl WalWriter {
    /// Start a writer session with a fresh WAL id
    pub fn open(table: Arc<TableHandle>, config: WalConfig, auto_create_columns: bool) -> Self {
        let wal_id = table.register_wal();
        let structure = table.sequencer().structure();
        debug!("Opened WAL writer {} for table {}", wal_id, table.name());
        Self {
            buffer: RowBuffer::new(structure.columns.len()),
            table,
            config,
            auto_create_columns,
            wal_id,
            structure,
            segment: None,
            next_segment_id: 0,
            symbol_keys: HashMap::new(),
            closed: false,
        }
    }

    /// WAL id of this session
    pub fn wal_id(&self) -> WalId {
        self.wal_id
    }

    /// Table structure as seen by this session
    pub fn structure(&self) -> &TableStructure {
        &self.structure
    }

    /// Rows appended since the last commit or rollback
    pub fn pending_rows(&self) -> u64 {
        self.buffer.rows
    }

    /// Buffer a row, returning its offset within the uncommitted batch.
    ///
    /// The row is validated and coerced as a whole first; a rejected row
    /// leaves previously buffered rows untouched.
    pub fn append(&mut self, row: Row) -> Result<u64> {
        let table = self.table.name().to_string();
        if !(MIN_TIMESTAMP..=MAX_TIMESTAMP).contains(&row.timestamp) {
            return Err(ChronoError::column(
                table,
                self.structure.timestamp_column(),
                format!("designated timestamp {} is out of range", row.timestamp),
            ));
        }
        let mut cells = Vec::with_capacity(row.fields.len());
        let mut new_columns = Vec::new();

        for (name, value) in row.fields {
            match self.structure.column_index(&name) {
                Some(idx) if idx == self.structure.timestamp_index => {
                    return Err(ChronoError::column(
                        table,
                        name,
                        "designated timestamp is set through the row timestamp",
                    ));
                }
                Some(idx) => {
                    let def = &self.structure.columns[idx];
                    let value = def
                        .column_type
                        .coerce(value)
                        .map_err(|msg| ChronoError::column(&table, &def.name, msg))?;
                    cells.push((idx, value));
                }
                None if value.is_null() => {}
                None if self.auto_create_columns => {
                    if let Some(column_type) = ColumnType::infer(&value) {
                        new_columns.push((ColumnDef::new(name, column_type), value));
                    }
                }
                None => {
                    return Err(ChronoError::schema(
                        table,
                        format!("column: {} does not exist, creating new columns is disabled", name),
                    ));
                }
            }
        }

        for (idx, def) in self.structure.columns.iter().enumerate() {
            if def.nullable || idx == self.structure.timestamp_index {
                continue;
            }
            if !cells.iter().any(|(i, v)| *i == idx && !v.is_null()) {
                return Err(ChronoError::column(&table, &def.name, "null value for NOT NULL column"));
            }
        }

        for (def, value) in new_columns {
            let name = def.name.clone();
            self.add_column(def)?;
            let idx = self.structure.column_index(&name).ok_or_else(|| {
                ChronoError::Internal(format!("column {} missing after add", name))
            })?;
            let value = self.structure.columns[idx]
                .column_type
                .coerce(value)
                .map_err(|msg| ChronoError::column(&table, &name, msg))?;
            cells.push((idx, value));
        }

        let mut values = vec![Value::Null; self.structure.columns.len()];
        values[self.structure.timestamp_index] = Value::Timestamp(row.timestamp);
        for (idx, value) in cells {
            values[idx] = value;
        }

        let offset = self.buffer.rows;
        self.buffer.push(row.timestamp, values);
        Ok(offset)
    }

    /// Add a column through the sequencer.
    ///
    /// Returns the structure txn, or `None` when the column already exists
    /// with the same type. Buffered rows read as null in the new column.
    pub fn add_column(&mut self, def: ColumnDef) -> Result<Option<TxnId>> {
        let change = StructureChange::AddColumn(def);
        if !self.structure.validate(&change)? {
            return Ok(None);
        }

        let record = WalRecord::structure(&change)?;
        let at = self.write_record(&record, false, true)?;
        let commit = self.table.sequencer().commit_structure(at, &change)?;

        self.buffer.widen(commit.structure.columns.len());
        self.structure = commit.structure;
        if commit.txn.is_some() {
            self.table.notify();
        }
        Ok(commit.txn)
    }

    /// Commit buffered rows as one transaction.
    ///
    /// Returns `None` when nothing is buffered. On error the rows stay
    /// buffered and the caller may retry or roll back.
    pub fn commit(&mut self) -> Result<Option<TxnId>> {
        if self.buffer.rows == 0 {
            return Ok(None);
        }

        let batch = self.build_batch();
        let record = WalRecord::data(&batch)?;
        let at = self.write_record(&record, self.config.compression, false)?;

        let txn = self.table.sequencer().next_txn(
            at,
            DataSummary {
                row_count: batch.row_count,
                min_timestamp: batch.min_timestamp,
                max_timestamp: batch.max_timestamp,
                structure_version: batch.structure_version,
            },
        )?;

        let rows = self.buffer.rows;
        self.buffer = RowBuffer::new(self.structure.columns.len());

        let roll = match self.segment.as_mut() {
            Some(segment) => {
                segment.rows += rows;
                segment.bytes >= self.config.segment_size as u64
                    || segment.rows >= self.config.segment_rows
            }
            None => false,
        };
        if roll {
            if let Err(e) = self.seal_segment() {
                warn!("Failed to seal WAL segment of {}: {}", self.table.name(), e);
            }
        }

        self.table.notify();
        Ok(Some(txn))
    }

    /// Discard buffered rows
    pub fn rollback(&mut self) {
        self.buffer = RowBuffer::new(self.structure.columns.len());
    }

    /// Seal the open segment and end the session. Uncommitted rows are lost.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.buffer.rows > 0 {
            warn!(
                "Discarding {} uncommitted rows of table {} on close",
                self.buffer.rows,
                self.table.name()
            );
        }
        let sealed = self.seal_segment();
        self.table.release_wal(self.wal_id);
        sealed
    }

    fn build_batch(&mut self) -> DataBatch {
        let mut columns = Vec::with_capacity(self.buffer.columns.len());
        for (idx, values) in self.buffer.columns.iter().enumerate() {
            if self.structure.columns[idx].column_type != ColumnType::Symbol {
                columns.push(WalColumn::Values(values.clone()));
                continue;
            }

            let keys_of = self.symbol_keys.entry(idx).or_default();
            let mut keys = Vec::with_capacity(values.len());
            let mut dictionary: Vec<(i32, String)> = Vec::new();
            for value in values {
                match value.as_str() {
                    Some(s) => {
                        let next = keys_of.len() as i32;
                        let key = *keys_of.entry(s.to_string()).or_insert(next);
                        if !dictionary.iter().any(|(k, _)| *k == key) {
                            dictionary.push((key, s.to_string()));
                        }
                        keys.push(key);
                    }
                    None => keys.push(-1),
                }
            }
            columns.push(WalColumn::Symbols(SymbolColumn { keys, dictionary }));
        }

        DataBatch {
            structure_version: self.structure.version,
            row_count: self.buffer.rows,
            min_timestamp: self.buffer.min_timestamp,
            max_timestamp: self.buffer.max_timestamp,
            ordered: self.buffer.ordered,
            columns,
        }
    }

    fn write_record(&mut self, record: &WalRecord, compress: bool, force_sync: bool) -> Result<SegmentRef> {
        let bytes = record.serialize_with_checksum(compress);
        let segment_id = self.ensure_segment()?;
        let Some(segment) = self.segment.as_mut() else {
            return Err(ChronoError::Internal("WAL segment not open".into()));
        };

        let offset = segment.bytes;
        let must_sync = segment.sync.record_write() || force_sync;
        let written = segment.file.write_all(&bytes).and_then(|_| {
            segment.file.flush()?;
            if must_sync {
                segment.file.get_ref().sync_data()?;
            }
            Ok(())
        });

        if let Err(e) = written {
            // the segment may now end in a partial record; never write to it again
            warn!(
                "WAL write failed for table {} segment {}/{}: {}",
                self.table.name(),
                self.wal_id,
                segment_id,
                e
            );
            self.segment = None;
            self.table.set_active_segment(self.wal_id, None);
            return Err(e.into());
        }
        if must_sync {
            segment.sync.synced();
        }
        segment.bytes += bytes.len() as u64;

        Ok(SegmentRef {
            wal_id: self.wal_id,
            segment_id,
            offset,
        })
    }

    fn ensure_segment(&mut self) -> Result<SegmentId> {
        if let Some(segment) = &self.segment {
            return Ok(segment.id);
        }

        let id = self.next_segment_id;
        self.next_segment_id += 1;
        self.table.set_active_segment(self.wal_id, Some(id));

        let dir = segment_dir(self.table.dir(), self.wal_id, id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;

        debug!("Table {} opened WAL segment {}/{}", self.table.name(), self.wal_id, id);
        self.segment = Some(Segment {
            id,
            dir,
            file: BufWriter::new(file),
            bytes: 0,
            rows: 0,
            sync: SyncTracker::new(self.config.sync_policy),
        });
        Ok(id)
    }

    fn seal_segment(&mut self) -> Result<()> {
        let Some(mut segment) = self.segment.take() else {
            return Ok(());
        };
        self.table.set_active_segment(self.wal_id, None);

        segment.file.flush()?;
        segment.file.get_ref().sync_all()?;
        File::create(segment.dir.join(SEALED_MARKER))?.sync_all()?;
        debug!(
            "Table {} sealed WAL segment {}/{} ({} rows, {} bytes)",
            self.table.name(),
            self.wal_id,
            segment.id,
            segment.rows,
            segment.bytes
        );
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Error closing WAL writer {}: {}", self.wal_id, e);
        }
    }
}
