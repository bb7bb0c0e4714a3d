//! Partitioned column storage
//!
//! A table directory holds one sub-directory per partition part version
//! (`<name>.<txn>`), each containing one file per column. The published
//! [`TableState`] decides which versions are live; files are never modified
//! in a way that changes rows a published state already exposes.

mod column;
mod partition;
mod state;

pub use column::{decode_values, encode_values, SymbolTable};
pub use partition::{
    append_partition, column_path, read_partition, write_partition, ColumnFile, Columns,
    PartitionMeta,
};
pub use state::{TableState, STATE_FILE};

pub(crate) use partition::sync_dir;
