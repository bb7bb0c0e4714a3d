//! Out-of-order (O3) merge engine
//!
//! Applies one transaction to a copy of the published [`TableState`]. All
//! file changes go either into new partition directories or past the
//! published end of appendable column files, so the base state stays
//! readable until the caller publishes the returned state.

mod sort;

pub use sort::{merge_sorted, sort_order, timestamps};

use crate::schema::StructureChange;
use crate::storage::{
    append_partition, read_partition, write_partition, ColumnFile, Columns, PartitionMeta,
    SymbolTable, TableState,
};
use crate::wal::DataBatch;
use crate::{ChronoError, Result, Timestamp, TxnId, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::debug;

/// What one merge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Rows appended in place
    pub appended_rows: u64,
    /// Parts rewritten because O3 rows landed inside them
    pub rewritten_parts: u64,
    pub new_partitions: u64,
    pub splits: u64,
    pub squashes: u64,
}

impl MergeStats {
    fn add(&mut self, other: &MergeStats) {
        self.appended_rows += other.appended_rows;
        self.rewritten_parts += other.rewritten_parts;
        self.new_partitions += other.new_partitions;
        self.splits += other.splits;
        self.squashes += other.squashes;
    }
}

/// Merge engine for one table directory
pub struct O3MergeEngine<'a> {
    table_dir: &'a Path,
    /// Minimum untouched prefix for splitting a part instead of rewriting it
    split_min_rows: u64,
    /// Parts per partition before they are squashed back into one
    max_split_parts: usize,
}

impl<'a> O3MergeEngine<'a> {
    pub fn new(table_dir: &'a Path, split_min_rows: u64, max_split_parts: usize) -> Self {
        Self {
            table_dir,
            split_min_rows,
            max_split_parts: max_split_parts.max(1),
        }
    }

    /// Apply a structural change: new columns start with a column top at the
    /// current row count of every part, so existing rows read as null.
    pub fn apply_structure(
        &self,
        base: &TableState,
        txn: TxnId,
        change: &StructureChange,
    ) -> Result<TableState> {
        let mut state = base.clone();
        state.txn = txn;
        if !state.structure.apply(change)? {
            return Ok(state);
        }
        for part in state.partitions.values_mut() {
            part.columns.push(ColumnFile {
                top: part.row_count,
                size: 0,
            });
        }
        state.symbols.push(SymbolTable::default());
        Ok(state)
    }

    /// Merge a row batch, returning the state to publish
    pub fn apply_data(
        &self,
        base: &TableState,
        txn: TxnId,
        batch: DataBatch,
    ) -> Result<(TableState, MergeStats)> {
        let mut state = base.clone();
        state.txn = txn;
        let mut stats = MergeStats::default();

        let rows = self.upgrade(&state, batch)?;
        let ts_index = state.structure.timestamp_index;
        let ts = timestamps(&rows[ts_index])?;
        if ts.is_empty() {
            return Ok((state, stats));
        }
        let partition_by = state.structure.partition_by;
        let floors = ts
            .iter()
            .map(|&t| {
                partition_by.floor(t).ok_or_else(|| {
                    ChronoError::column(
                        &state.structure.name,
                        state.structure.timestamp_column(),
                        format!("timestamp {} is outside the partitionable range", t),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let order = sort_order(&ts);

        // consecutive sorted rows that land in the same part
        let mut touched = BTreeSet::new();
        let mut written = HashSet::new();
        let mut start = 0;
        while start < order.len() {
            let first = ts[order[start]];
            let floor = floors[order[start]];
            let target = state.route(first).map(|p| p.lower);
            let upper = match target {
                Some(lower) => state
                    .partitions
                    .range(lower + 1..)
                    .next()
                    .map(|(&next_lower, _)| next_lower),
                None => None,
            };

            let mut end = start;
            while end < order.len() {
                let t = ts[order[end]];
                if floors[order[end]] != floor {
                    break;
                }
                if upper.is_some_and(|u| t >= u) {
                    break;
                }
                end += 1;
            }

            let incoming = sort::gather(&rows, &order[start..end]);
            let part_stats = match target {
                Some(lower) => self.merge_into(&mut state, lower, incoming, txn, &mut written)?,
                None => self.new_partition(&mut state, floor, incoming, txn, &mut written)?,
            };
            stats.add(&part_stats);
            touched.insert(floor);
            start = end;
        }

        for floor in touched {
            if state.family(floor).count() > self.max_split_parts {
                self.squash(&mut state, floor, txn, &mut written)?;
                stats.squashes += 1;
            }
        }

        state.row_count = state.partitions.values().map(|p| p.row_count).sum();
        debug!(
            "Table {} txn {} merged: {:?}",
            state.structure.name, txn, stats
        );
        Ok((state, stats))
    }

    /// Map the batch onto the current structure, null-filling newer columns
    fn upgrade(&self, state: &TableState, batch: DataBatch) -> Result<Columns> {
        let width = state.structure.columns.len();
        if batch.structure_version > state.structure.version || batch.columns.len() > width {
            return Err(ChronoError::Corruption(format!(
                "batch written against structure version {} with {} columns, table is at version {}",
                batch.structure_version,
                batch.columns.len(),
                state.structure.version
            )));
        }

        let rows = batch.row_count as usize;
        let mut columns = Vec::with_capacity(width);
        for column in batch.columns {
            let values = column.into_values()?;
            if values.len() != rows {
                return Err(ChronoError::Corruption(format!(
                    "column holds {} values, batch has {} rows",
                    values.len(),
                    rows
                )));
            }
            columns.push(values);
        }
        while columns.len() < width {
            columns.push(vec![Value::Null; rows]);
        }
        Ok(columns)
    }

    /// Write a part version; a directory this merge already produced is
    /// never replaced
    fn write_part(
        &self,
        state: &mut TableState,
        meta: PartitionMeta,
        rows: &Columns,
        written: &mut HashSet<String>,
    ) -> Result<PartitionMeta> {
        let dir_name = meta.dir_name();
        if !written.insert(dir_name.clone()) {
            return Err(ChronoError::Internal(format!(
                "partition directory {} written twice by txn {}",
                dir_name, meta.name_txn
            )));
        }
        write_partition(self.table_dir, meta, rows, &state.structure, &mut state.symbols)
    }

    fn new_partition(
        &self,
        state: &mut TableState,
        floor: Timestamp,
        rows: Columns,
        txn: TxnId,
        written: &mut HashSet<String>,
    ) -> Result<MergeStats> {
        let ts = timestamps(&rows[state.structure.timestamp_index])?;
        let meta = PartitionMeta {
            floor,
            lower: floor,
            name: state.structure.partition_by.partition_name(floor),
            name_txn: txn,
            row_count: ts.len() as u64,
            min_timestamp: ts[0],
            max_timestamp: ts[ts.len() - 1],
            columns: Vec::new(),
            appendable: true,
        };
        debug!("Table {} new partition {}", state.structure.name, meta.name);

        let meta = self.write_part(state, meta, &rows, written)?;
        state.partitions.insert(floor, meta);
        Ok(MergeStats {
            new_partitions: 1,
            ..Default::default()
        })
    }

    fn merge_into(
        &self,
        state: &mut TableState,
        lower: Timestamp,
        rows: Columns,
        txn: TxnId,
        written: &mut HashSet<String>,
    ) -> Result<MergeStats> {
        let ts_index = state.structure.timestamp_index;
        let Some(part) = state.partitions.get(&lower).cloned() else {
            return Err(ChronoError::Internal(format!("no partition part at {}", lower)));
        };
        let ts = timestamps(&rows[ts_index])?;
        let (min_new, max_new) = (ts[0], ts[ts.len() - 1]);

        if part.appendable && min_new >= part.max_timestamp {
            let appended = append_partition(
                self.table_dir,
                &part,
                &rows,
                &state.structure,
                &mut state.symbols,
            )?;
            state.partitions.insert(lower, appended);
            return Ok(MergeStats {
                appended_rows: ts.len() as u64,
                ..Default::default()
            });
        }

        let existing = read_partition(self.table_dir, &part, &state.structure, &state.symbols)?;
        let existing_ts = timestamps(&existing[ts_index])?;
        let prefix = existing_ts.partition_point(|&t| t < min_new);
        let is_last = state.family(part.floor).last().map(|p| p.lower) == Some(lower);

        if is_last && prefix > 0 && prefix as u64 >= self.split_min_rows {
            let suffix = merge_sorted(sort::tail(&existing, prefix), rows, ts_index)?;
            let base_name = state.structure.partition_by.partition_name(part.floor);
            let split = PartitionMeta {
                floor: part.floor,
                lower: min_new,
                name: state.structure.partition_by.split_name(&base_name, min_new),
                name_txn: txn,
                row_count: suffix[ts_index].len() as u64,
                min_timestamp: min_new,
                max_timestamp: part.max_timestamp.max(max_new),
                columns: Vec::new(),
                appendable: true,
            };
            debug!(
                "Table {} splitting {} at {} ({} rows kept)",
                state.structure.name,
                part.dir_name(),
                min_new,
                prefix
            );
            let split = self.write_part(state, split, &suffix, written)?;

            let kept = PartitionMeta {
                row_count: prefix as u64,
                max_timestamp: existing_ts[prefix - 1],
                appendable: false,
                ..part
            };
            state.partitions.insert(lower, kept);
            state.partitions.insert(min_new, split);
            return Ok(MergeStats {
                splits: 1,
                ..Default::default()
            });
        }

        let merged = merge_sorted(existing, rows, ts_index)?;
        let merged_ts = timestamps(&merged[ts_index])?;
        let old_dir = part.dir_name();
        let rewritten = PartitionMeta {
            name_txn: txn,
            row_count: merged_ts.len() as u64,
            min_timestamp: merged_ts[0],
            max_timestamp: merged_ts[merged_ts.len() - 1],
            columns: Vec::new(),
            ..part
        };
        debug!(
            "Table {} rewriting {} as {}",
            state.structure.name,
            old_dir,
            rewritten.dir_name()
        );
        let rewritten = self.write_part(state, rewritten, &merged, written)?;
        state.partitions.insert(lower, rewritten);
        Ok(MergeStats {
            rewritten_parts: 1,
            ..Default::default()
        })
    }

    /// Rewrite all parts of a partition into a single part
    fn squash(
        &self,
        state: &mut TableState,
        floor: Timestamp,
        txn: TxnId,
        written: &mut HashSet<String>,
    ) -> Result<()> {
        let parts: Vec<PartitionMeta> = state.family(floor).cloned().collect();
        let mut rows = Columns::new();
        for part in &parts {
            let data = read_partition(self.table_dir, part, &state.structure, &state.symbols)?;
            rows = sort::concat(rows, data);
            // read in full, its directory may be reused by the squashed part
            written.remove(&part.dir_name());
        }
        let ts = timestamps(&rows[state.structure.timestamp_index])?;

        let meta = PartitionMeta {
            floor,
            lower: floor,
            name: state.structure.partition_by.partition_name(floor),
            name_txn: txn,
            row_count: ts.len() as u64,
            min_timestamp: ts[0],
            max_timestamp: ts[ts.len() - 1],
            columns: Vec::new(),
            appendable: true,
        };
        debug!(
            "Table {} squashing {} parts into {}",
            state.structure.name,
            parts.len(),
            meta.dir_name()
        );
        let meta = self.write_part(state, meta, &rows, written)?;

        for part in &parts {
            state.partitions.remove(&part.lower);
        }
        state.partitions.insert(floor, meta);
        Ok(())
    }
}
