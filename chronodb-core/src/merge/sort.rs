//! Ordering helpers for out-of-order merges
//!
//! Equal timestamps keep arrival order: rows already stored come before rows
//! of the transaction being merged, and rows of one transaction keep the
//! order they were appended in.

use crate::storage::Columns;
use crate::{ChronoError, Result, Timestamp, Value};

/// Extract a timestamp column, rejecting nulls
pub fn timestamps(column: &[Value]) -> Result<Vec<Timestamp>> {
    column
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| ChronoError::Corruption("null designated timestamp".into()))
        })
        .collect()
}

/// Stable ordering of row indices by timestamp
pub fn sort_order(ts: &[Timestamp]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..ts.len()).collect();
    order.sort_by_key(|&i| ts[i]);
    order
}

/// Gather rows `indices` from every column
pub fn gather(columns: &Columns, indices: &[usize]) -> Columns {
    columns
        .iter()
        .map(|column| indices.iter().map(|&i| column[i].clone()).collect())
        .collect()
}

/// Rows `from..` of every column
pub fn tail(columns: &Columns, from: usize) -> Columns {
    columns.iter().map(|c| c[from..].to_vec()).collect()
}

/// Two-way merge of sorted row sets; `existing` wins ties
pub fn merge_sorted(existing: Columns, incoming: Columns, ts_index: usize) -> Result<Columns> {
    let left = timestamps(&existing[ts_index])?;
    let right = timestamps(&incoming[ts_index])?;

    let mut picks = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if left[i] <= right[j] {
            picks.push((true, i));
            i += 1;
        } else {
            picks.push((false, j));
            j += 1;
        }
    }
    picks.extend((i..left.len()).map(|k| (true, k)));
    picks.extend((j..right.len()).map(|k| (false, k)));

    Ok(existing
        .iter()
        .zip(incoming.iter())
        .map(|(l, r)| {
            picks
                .iter()
                .map(|&(from_left, k)| if from_left { l[k].clone() } else { r[k].clone() })
                .collect()
        })
        .collect())
}

/// Concatenate row sets column-wise
pub fn concat(mut acc: Columns, next: Columns) -> Columns {
    if acc.is_empty() {
        return next;
    }
    for (column, more) in acc.iter_mut().zip(next) {
        column.extend(more);
    }
    acc
}
