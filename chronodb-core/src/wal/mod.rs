//! Write-Ahead Log (WAL) implementation
//!
//! Every writer session owns a private WAL directory (`wal<id>`) split into
//! numbered segments. A segment holds framed records: row batches and
//! structural changes. Records become transactions only once the table's
//! sequencer has assigned them an id, so a record without a sequencer entry
//! is never applied.

mod reader;
mod record;
mod writer;

pub use reader::read_record_at;
pub use record::{DataBatch, SymbolColumn, WalColumn, WalRecord, WalRecordType};
pub use writer::WalWriter;

use crate::{SegmentId, WalId};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Events file inside a segment directory
pub const EVENTS_FILE: &str = "_events";

/// Marker written when a segment is sealed
pub const SEALED_MARKER: &str = "_sealed";

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// Tracks writes against a [`SyncPolicy`]
#[derive(Debug)]
pub(crate) struct SyncTracker {
    policy: SyncPolicy,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl SyncTracker {
    pub(crate) fn new(policy: SyncPolicy) -> Self {
        Self {
            policy,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        }
    }

    /// Count a write and report whether it must be synced now
    pub(crate) fn record_write(&mut self) -> bool {
        self.writes_since_sync += 1;
        match self.policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => self.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                self.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    pub(crate) fn synced(&mut self) {
        self.writes_since_sync = 0;
        self.last_sync = Instant::now();
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Sync policy for segments and the sequencer log
    pub sync_policy: SyncPolicy,
    /// Segment is sealed once it holds this many bytes
    pub segment_size: usize,
    /// Segment is sealed once it holds this many rows
    pub segment_rows: u64,
    /// Compress row batch payloads with LZ4
    pub compression: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
            segment_rows: crate::config::WAL_SEGMENT_ROWS,
            compression: false,
        }
    }
}

/// Directory of a writer session's WAL
pub fn wal_dir(table_dir: &Path, wal_id: WalId) -> PathBuf {
    table_dir.join(format!("wal{}", wal_id))
}

/// Directory of one segment
pub fn segment_dir(table_dir: &Path, wal_id: WalId, segment_id: SegmentId) -> PathBuf {
    wal_dir(table_dir, wal_id).join(segment_id.to_string())
}

/// Parse a `wal<id>` directory name
pub fn parse_wal_dir(name: &str) -> Option<WalId> {
    name.strip_prefix("wal").and_then(|s| s.parse().ok())
}

/// List `(wal_id, segment_id)` pairs present on disk
pub fn list_segments(table_dir: &Path) -> std::io::Result<Vec<(WalId, SegmentId)>> {
    let mut segments = Vec::new();
    for wal_id in list_wals(table_dir)? {
        for entry in std::fs::read_dir(wal_dir(table_dir, wal_id))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(segment_id) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                segments.push((wal_id, segment_id));
            }
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// List WAL ids present on disk
pub fn list_wals(table_dir: &Path) -> std::io::Result<Vec<WalId>> {
    let mut wals = Vec::new();
    if !table_dir.exists() {
        return Ok(wals);
    }
    for entry in std::fs::read_dir(table_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse_wal_dir) {
            wals.push(id);
        }
    }
    wals.sort_unstable();
    Ok(wals)
}
