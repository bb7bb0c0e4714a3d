//! Per-table transaction sequencer
//!
//! The sequencer is the only place where concurrent writers of one table
//! meet. Inside its critical section it assigns the next transaction id and
//! appends a fixed-size record to `_txnlog` before returning, so a txn id
//! handed to a writer is always durable. The log is also the source of truth
//! for the structure version: structural changes are validated and
//! sequenced here, in the same order as data.

mod cursor;
mod log;

pub use cursor::TxnCursor;
pub use log::{TxnKind, TxnRecord, HEADER_SIZE, RECORD_SIZE};

use crate::schema::{StructureChange, TableStructure};
use crate::wal::{read_record_at, SyncPolicy, SyncTracker};
use crate::{ChronoError, Result, SegmentId, TableId, Timestamp, TxnId, WalId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

/// Sequencer log file name
pub const TXN_LOG_FILE: &str = "_txnlog";

/// Location of a WAL record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRef {
    pub wal_id: WalId,
    pub segment_id: SegmentId,
    pub offset: u64,
}

/// Summary of a committed row batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSummary {
    pub row_count: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub structure_version: u64,
}

/// Result of sequencing a structural change
#[derive(Debug, Clone)]
pub struct StructureCommit {
    /// Assigned txn, `None` when the change was already in place
    pub txn: Option<TxnId>,
    /// Structure after the change
    pub structure: TableStructure,
}

/// Transaction sequencer for one table
pub struct TableSequencer {
    table_name: String,
    table_dir: PathBuf,
    inner: Mutex<SequencerInner>,
    last_txn: AtomicU64,
}

struct SequencerInner {
    file: File,
    len: u64,
    structure: TableStructure,
    /// Highest txn referencing each segment
    segments: HashMap<(WalId, SegmentId), TxnId>,
    max_wal_id: Option<WalId>,
    quarantine: Option<String>,
    sync: SyncTracker,
    /// Bytes of the next record to write before failing
    #[cfg(test)]
    torn_write: Option<usize>,
}

impl TableSequencer {
    /// Open or create the log, rebuilding state by scanning it.
    ///
    /// A torn trailing record was never acknowledged and is truncated. A gap,
    /// duplicate or corrupt record anywhere else quarantines the sequencer:
    /// it keeps the valid prefix for inspection but refuses new commits.
    pub fn open(
        table_dir: &Path,
        table_id: TableId,
        initial: TableStructure,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let path = table_dir.join(TXN_LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let data = fs::read(&path)?;

        let mut inner = SequencerInner {
            file: file.try_clone()?,
            len: data.len() as u64,
            structure: initial,
            segments: HashMap::new(),
            max_wal_id: None,
            quarantine: None,
            sync: SyncTracker::new(sync_policy),
            #[cfg(test)]
            torn_write: None,
        };
        let table_name = inner.structure.name.clone();

        if data.len() < HEADER_SIZE as usize {
            // new table, or a crash while writing the header
            file.set_len(0)?;
            file.write_all(&log::encode_header(table_id))?;
            file.sync_all()?;
            inner.len = HEADER_SIZE;
            return Ok(Self {
                table_name,
                table_dir: table_dir.to_path_buf(),
                inner: Mutex::new(inner),
                last_txn: AtomicU64::new(0),
            });
        }

        let logged_table = log::decode_header(&data)?;
        if logged_table != table_id {
            return Err(ChronoError::Corruption(format!(
                "txn log of table {} belongs to table id {}",
                table_id, logged_table
            )));
        }

        let mut offset = HEADER_SIZE as usize;
        let mut expected: TxnId = 1;
        while offset + RECORD_SIZE as usize <= data.len() {
            let is_last = offset + RECORD_SIZE as usize == data.len();
            match TxnRecord::decode(&data[offset..]) {
                Ok(record) if record.txn == expected => {
                    if let Err(e) = inner.replay(table_dir, &record) {
                        inner.quarantine = Some(e.to_string());
                        break;
                    }
                    expected += 1;
                    offset += RECORD_SIZE as usize;
                }
                Ok(record) => {
                    let err = ChronoError::OrderingViolation {
                        table: table_name.clone(),
                        expected,
                        found: record.txn,
                    };
                    inner.quarantine = Some(err.to_string());
                    break;
                }
                Err(ChronoError::ChecksumMismatch { .. }) if is_last => {
                    // torn final write, never acknowledged
                    break;
                }
                Err(e) => {
                    inner.quarantine = Some(format!("txn {}: {}", expected, e));
                    break;
                }
            }
        }

        if let Some(reason) = &inner.quarantine {
            error!("Sequencer for {} quarantined: {}", table_name, reason);
        } else if offset < data.len() {
            warn!(
                "Truncating {} torn bytes from txn log of {}",
                data.len() - offset,
                table_name
            );
            file.set_len(offset as u64)?;
            file.sync_all()?;
            inner.len = offset as u64;
        }

        let last = expected - 1;
        info!(
            "Sequencer for {} recovered: last txn {}, structure version {}",
            table_name, last, inner.structure.version
        );

        Ok(Self {
            table_name,
            table_dir: table_dir.to_path_buf(),
            inner: Mutex::new(inner),
            last_txn: AtomicU64::new(last),
        })
    }

    /// Table name
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Path of the log file
    pub fn log_path(&self) -> PathBuf {
        self.table_dir.join(TXN_LOG_FILE)
    }

    /// Highest durably sequenced txn
    pub fn last_txn(&self) -> TxnId {
        self.last_txn.load(Ordering::Acquire)
    }

    /// Current structure including sequenced but unapplied changes
    pub fn structure(&self) -> TableStructure {
        self.inner.lock().structure.clone()
    }

    /// Reason the sequencer refuses commits, if any
    pub fn quarantine_reason(&self) -> Option<String> {
        self.inner.lock().quarantine.clone()
    }

    /// Highest txn referencing each segment
    pub fn segment_txns(&self) -> HashMap<(WalId, SegmentId), TxnId> {
        self.inner.lock().segments.clone()
    }

    /// Highest WAL id ever sequenced
    pub fn max_wal_id(&self) -> Option<WalId> {
        self.inner.lock().max_wal_id
    }

    /// Sequence a committed row batch.
    ///
    /// On error nothing was sequenced and the caller must not treat the rows
    /// as committed.
    pub fn next_txn(&self, at: SegmentRef, summary: DataSummary) -> Result<TxnId> {
        let mut inner = self.inner.lock();
        inner.check_open(&self.table_name)?;
        if summary.structure_version > inner.structure.version {
            return Err(ChronoError::schema(
                &self.table_name,
                format!(
                    "batch structure version {} is ahead of table version {}",
                    summary.structure_version, inner.structure.version
                ),
            ));
        }

        let record = TxnRecord {
            txn: self.last_txn() + 1,
            kind: TxnKind::Data,
            wal_id: at.wal_id,
            segment_id: at.segment_id,
            segment_offset: at.offset,
            row_count: summary.row_count,
            min_timestamp: summary.min_timestamp,
            max_timestamp: summary.max_timestamp,
            structure_version: summary.structure_version,
            commit_micros: chrono::Utc::now().timestamp_micros(),
        };
        self.append(&mut inner, &record)
    }

    /// Validate and sequence a structural change
    pub fn commit_structure(
        &self,
        at: SegmentRef,
        change: &StructureChange,
    ) -> Result<StructureCommit> {
        let mut inner = self.inner.lock();
        inner.check_open(&self.table_name)?;

        if !inner.structure.validate(change)? {
            return Ok(StructureCommit {
                txn: None,
                structure: inner.structure.clone(),
            });
        }

        let mut next = inner.structure.clone();
        next.apply(change)?;

        let record = TxnRecord {
            txn: self.last_txn() + 1,
            kind: TxnKind::Structure,
            wal_id: at.wal_id,
            segment_id: at.segment_id,
            segment_offset: at.offset,
            row_count: 0,
            min_timestamp: 0,
            max_timestamp: 0,
            structure_version: next.version,
            commit_micros: chrono::Utc::now().timestamp_micros(),
        };
        let txn = self.append(&mut inner, &record)?;
        inner.structure = next;
        info!(
            "Table {} structure version {} at txn {}",
            self.table_name, inner.structure.version, txn
        );

        Ok(StructureCommit {
            txn: Some(txn),
            structure: inner.structure.clone(),
        })
    }

    fn append(&self, inner: &mut SequencerInner, record: &TxnRecord) -> Result<TxnId> {
        let bytes = record.encode();
        let must_sync = inner.sync.record_write();
        let written = inner.write_record(&bytes).and_then(|_| {
            if must_sync {
                inner.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(source) = written {
            // drop whatever part of the record reached the file
            if let Err(e) = inner.file.set_len(inner.len) {
                warn!("Failed to roll back txn log of {}: {}", self.table_name, e);
            }
            return Err(ChronoError::SequencerIo {
                table: self.table_name.clone(),
                source,
            });
        }
        if must_sync {
            inner.sync.synced();
        }

        inner.len += RECORD_SIZE;
        inner.note_segment(record);
        self.last_txn.store(record.txn, Ordering::Release);
        Ok(record.txn)
    }
}

impl SequencerInner {
    fn write_record(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(partial) = self.torn_write.take() {
            self.file.write_all(&bytes[..partial])?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "torn write"));
        }
        self.file.write_all(bytes)
    }

    fn check_open(&self, table: &str) -> Result<()> {
        match &self.quarantine {
            Some(reason) => Err(ChronoError::TableSuspended {
                table: table.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn note_segment(&mut self, record: &TxnRecord) {
        let entry = self
            .segments
            .entry((record.wal_id, record.segment_id))
            .or_insert(0);
        *entry = (*entry).max(record.txn);
        self.max_wal_id = Some(self.max_wal_id.map_or(record.wal_id, |m| m.max(record.wal_id)));
    }

    fn replay(&mut self, table_dir: &Path, record: &TxnRecord) -> Result<()> {
        if record.kind == TxnKind::Structure && record.structure_version > self.structure.version {
            let change = read_record_at(
                table_dir,
                record.wal_id,
                record.segment_id,
                record.segment_offset,
            )?
            .structure_change()?;
            self.structure.apply(&change)?;
            if self.structure.version != record.structure_version {
                return Err(ChronoError::Corruption(format!(
                    "txn {} expected structure version {}, replay produced {}",
                    record.txn, record.structure_version, self.structure.version
                )));
            }
        }
        self.note_segment(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use crate::{ColumnType, PartitionBy};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn structure() -> TableStructure {
        TableStructure::new(
            "metrics",
            vec![
                ColumnDef::new("v", ColumnType::Double),
                ColumnDef::new("ts", ColumnType::Timestamp),
            ],
            "ts",
            PartitionBy::Day,
        )
        .unwrap()
    }

    fn at(offset: u64) -> SegmentRef {
        SegmentRef {
            wal_id: 1,
            segment_id: 0,
            offset,
        }
    }

    fn summary() -> DataSummary {
        DataSummary {
            row_count: 10,
            min_timestamp: 0,
            max_timestamp: 9,
            structure_version: 0,
        }
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
            assert_eq!(seq.next_txn(at(0), summary()).unwrap(), 1);
            assert_eq!(seq.next_txn(at(100), summary()).unwrap(), 2);
        }
        let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
        assert_eq!(seq.last_txn(), 2);
        assert_eq!(seq.segment_txns().get(&(1, 0)), Some(&2));
        assert_eq!(seq.next_txn(at(200), summary()).unwrap(), 3);
    }

    #[test]
    fn test_concurrent_commits_are_gapless() {
        let dir = TempDir::new().unwrap();
        let seq = Arc::new(
            TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::None).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| seq.next_txn(at(i), summary()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<TxnId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
            seq.next_txn(at(0), summary()).unwrap();
        }
        let path = dir.path().join(TXN_LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[7u8; 30]).unwrap();
        drop(file);

        let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
        assert_eq!(seq.last_txn(), 1);
        assert!(seq.quarantine_reason().is_none());
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            HEADER_SIZE + RECORD_SIZE
        );
        assert_eq!(seq.next_txn(at(10), summary()).unwrap(), 2);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TXN_LOG_FILE);
        {
            let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
            assert_eq!(seq.next_txn(at(0), summary()).unwrap(), 1);

            seq.inner.lock().torn_write = Some(RECORD_SIZE as usize / 2);
            assert!(matches!(
                seq.next_txn(at(100), summary()),
                Err(ChronoError::SequencerIo { .. })
            ));
            assert_eq!(seq.last_txn(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE + RECORD_SIZE);
            assert_eq!(seq.segment_txns().get(&(1, 0)), Some(&1));

            // the id was not used up
            assert_eq!(seq.next_txn(at(100), summary()).unwrap(), 2);
        }

        let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
        assert_eq!(seq.last_txn(), 2);
        assert!(seq.quarantine_reason().is_none());
    }

    #[test]
    fn test_gap_quarantines() {
        let dir = TempDir::new().unwrap();
        {
            let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
            seq.next_txn(at(0), summary()).unwrap();
        }
        // forge txn 3 right after txn 1
        let forged = TxnRecord {
            txn: 3,
            kind: TxnKind::Data,
            wal_id: 1,
            segment_id: 0,
            segment_offset: 0,
            row_count: 1,
            min_timestamp: 0,
            max_timestamp: 0,
            structure_version: 0,
            commit_micros: 0,
        };
        let path = dir.path().join(TXN_LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&forged.encode()).unwrap();
        drop(file);

        let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
        assert_eq!(seq.last_txn(), 1);
        assert!(seq.quarantine_reason().unwrap().contains("expected txn 2, found 3"));
        assert!(matches!(
            seq.next_txn(at(0), summary()),
            Err(ChronoError::TableSuspended { .. })
        ));
    }

    #[test]
    fn test_structure_version_guard() {
        let dir = TempDir::new().unwrap();
        let seq = TableSequencer::open(dir.path(), 1, structure(), SyncPolicy::Immediate).unwrap();
        let ahead = DataSummary {
            structure_version: 5,
            ..summary()
        };
        assert!(matches!(
            seq.next_txn(at(0), ahead),
            Err(ChronoError::Schema { .. })
        ));
        assert_eq!(seq.last_txn(), 0);
    }
}
