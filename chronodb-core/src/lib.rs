//! ChronoDB Core - WAL commit pipeline and out-of-order merge engine
//!
//! Concurrent writers append rows to private WAL segments and commit them
//! through a per-table sequencer that assigns gapless transaction ids. An
//! apply job replays sequenced transactions in id order into partitioned,
//! timestamp-sorted column storage, and readers take snapshots pinned to the
//! last fully applied transaction.
//!
//! # Architecture
//!
//! - **WAL**: per-session segments of framed row batches and structure changes
//! - **Sequencer**: durable transaction log, the only cross-writer critical section
//! - **Txn Cursor**: ordered, resumable reader over the transaction log
//! - **O3 Merge**: append, rewrite, split and squash of partition parts
//! - **Jobs**: apply, purge and pending-transaction check
//! - **Visibility**: published commit versions and pinned snapshots

pub mod engine;
pub mod jobs;
pub mod locks;
pub mod merge;
pub mod schema;
pub mod sequencer;
pub mod storage;
pub mod table;
pub mod visibility;
pub mod wal;

mod error;
mod types;

pub use engine::{Engine, EngineConfig, IngestConfig, TableInfo};
pub use error::{ChronoError, Result};
pub use jobs::{Job, JobStatus};
pub use table::TableStatus;
pub use types::*;
pub use visibility::Snapshot;

/// ChronoDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// WAL segment size before roll-over (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// Rows per WAL segment before roll-over
    pub const WAL_SEGMENT_ROWS: u64 = 1_000_000;

    /// Transactions applied per table per job step
    pub const MAX_TXNS_PER_RUN: usize = 64;

    /// Merge retries before a table is suspended
    pub const MAX_MERGE_RETRIES: u32 = 3;

    /// Untouched prefix rows needed to split a partition part
    pub const O3_SPLIT_MIN_ROWS: u64 = 50_000;

    /// Parts per partition before squashing
    pub const MAX_SPLIT_PARTS: usize = 4;

    /// WAL purge interval (30s)
    pub const PURGE_INTERVAL_MS: u64 = 30_000;
}
