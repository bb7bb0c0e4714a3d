//! Partition directories and their column files

use super::column::{decode_values, encode_values, SymbolTable};
use crate::schema::TableStructure;
use crate::{Result, Timestamp, TxnId, Value};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Column data of a partition, one vector per column
pub type Columns = Vec<Vec<Value>>;

/// Published extent of one column file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFile {
    /// Rows before the column existed; they read as null and are not stored
    pub top: u64,
    /// Bytes of the file that belong to the published version
    pub size: u64,
}

/// Metadata of one partition part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    /// Start of the calendar period the part belongs to
    pub floor: Timestamp,
    /// Lowest timestamp routed to this part
    pub lower: Timestamp,
    pub name: String,
    /// Txn that created this directory version
    pub name_txn: TxnId,
    pub row_count: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub columns: Vec<ColumnFile>,
    /// Rows past `max_timestamp` may be appended in place
    pub appendable: bool,
}

impl PartitionMeta {
    /// Directory name, unique per version
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.name, self.name_txn)
    }

    pub fn dir(&self, table_dir: &Path) -> PathBuf {
        table_dir.join(self.dir_name())
    }
}

/// File holding the values of a column
pub fn column_path(dir: &Path, column: &str) -> PathBuf {
    dir.join(format!("{}.d", column))
}

/// Read every column of a part, padding columns added later with nulls
pub fn read_partition(
    table_dir: &Path,
    meta: &PartitionMeta,
    structure: &TableStructure,
    symbols: &[SymbolTable],
) -> Result<Columns> {
    let dir = meta.dir(table_dir);
    let rows = meta.row_count as usize;
    let mut columns = Vec::with_capacity(structure.columns.len());

    for (idx, def) in structure.columns.iter().enumerate() {
        let file = meta.columns.get(idx).copied().unwrap_or(ColumnFile {
            top: meta.row_count,
            size: 0,
        });
        let top = (file.top as usize).min(rows);
        let mut values = vec![Value::Null; top];

        if top < rows {
            let data = fs::read(column_path(&dir, &def.name))?;
            let stored = &data[..(file.size as usize).min(data.len())];
            let empty = SymbolTable::default();
            let dict = symbols.get(idx).unwrap_or(&empty);
            values.extend(decode_values(def.column_type, stored, rows - top, dict)?);
        }
        columns.push(values);
    }

    Ok(columns)
}

/// Write a new part version into a fresh directory.
///
/// A directory left behind by an interrupted attempt at the same txn is
/// replaced; anything else at that path is an error.
pub fn write_partition(
    table_dir: &Path,
    mut meta: PartitionMeta,
    columns: &Columns,
    structure: &TableStructure,
    symbols: &mut [SymbolTable],
) -> Result<PartitionMeta> {
    let dir = meta.dir(table_dir);
    if dir.is_dir() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir(&dir)?;

    meta.columns = Vec::with_capacity(structure.columns.len());
    for (idx, def) in structure.columns.iter().enumerate() {
        let buf = encode_values(def.column_type, &columns[idx], &mut symbols[idx])?;
        let mut file = File::create(column_path(&dir, &def.name))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        meta.columns.push(ColumnFile {
            top: 0,
            size: buf.len() as u64,
        });
    }
    sync_dir(&dir)?;

    Ok(meta)
}

/// Append rows to the end of an existing part in place.
///
/// Every column file is first cut back to its published size, so bytes from
/// an interrupted earlier attempt are overwritten rather than duplicated.
pub fn append_partition(
    table_dir: &Path,
    meta: &PartitionMeta,
    columns: &Columns,
    structure: &TableStructure,
    symbols: &mut [SymbolTable],
) -> Result<PartitionMeta> {
    let dir = meta.dir(table_dir);
    let mut next = meta.clone();

    for (idx, def) in structure.columns.iter().enumerate() {
        let published = meta.columns.get(idx).copied().unwrap_or(ColumnFile {
            top: meta.row_count,
            size: 0,
        });
        let buf = encode_values(def.column_type, &columns[idx], &mut symbols[idx])?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(column_path(&dir, &def.name))?;
        file.set_len(published.size)?;
        file.seek(SeekFrom::Start(published.size))?;
        file.write_all(&buf)?;
        file.sync_all()?;

        let updated = ColumnFile {
            top: published.top,
            size: published.size + buf.len() as u64,
        };
        match next.columns.get_mut(idx) {
            Some(slot) => *slot = updated,
            None => next.columns.push(updated),
        }
    }

    let rows = columns.first().map_or(0, Vec::len) as u64;
    next.row_count += rows;
    if let Some(ts) = columns
        .get(structure.timestamp_index)
        .and_then(|c| c.last())
        .and_then(Value::as_i64)
    {
        next.max_timestamp = next.max_timestamp.max(ts);
    }
    Ok(next)
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
