//! Forward iteration over sequenced transactions

use super::{TableSequencer, TxnRecord};
use crate::{ChronoError, Result, TxnId};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// Reads transactions of one table in id order.
///
/// The cursor never reads past the sequencer's last durable txn, so a record
/// that is still being appended is invisible to it.
pub struct TxnCursor {
    sequencer: Arc<TableSequencer>,
    file: File,
    position: TxnId,
}

impl TxnCursor {
    /// Open a cursor that yields transactions after `resume_after`
    pub fn open(sequencer: &Arc<TableSequencer>, resume_after: TxnId) -> Result<Self> {
        let file = File::open(sequencer.log_path())?;
        Ok(Self {
            sequencer: sequencer.clone(),
            file,
            position: resume_after,
        })
    }

    /// Last txn returned (or the resume point)
    pub fn position(&self) -> TxnId {
        self.position
    }

    /// Whether more sequenced transactions are available
    pub fn has_next(&self) -> bool {
        self.position < self.sequencer.last_txn()
    }

    /// Next transaction, or `None` when caught up with the sequencer
    pub fn next(&mut self) -> Result<Option<TxnRecord>> {
        if !self.has_next() {
            return Ok(None);
        }
        let expected = self.position + 1;

        let mut buf = [0u8; super::RECORD_SIZE as usize];
        self.file.seek(SeekFrom::Start(TxnRecord::file_offset(expected)))?;
        self.file.read_exact(&mut buf)?;
        let record = TxnRecord::decode(&buf)?;

        if record.txn != expected {
            return Err(ChronoError::OrderingViolation {
                table: self.sequencer.table_name().to_string(),
                expected,
                found: record.txn,
            });
        }
        self.position = expected;
        Ok(Some(record))
    }
}
