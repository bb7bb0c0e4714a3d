//! WAL segment reader

use super::{segment_dir, WalRecord, EVENTS_FILE};
use crate::{ChronoError, Result, SegmentId, WalId};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

/// Read the record a sequencer entry points at.
///
/// The record was durable before its transaction was sequenced, so a missing
/// or torn record here is corruption rather than a crash artifact.
pub fn read_record_at(
    table_dir: &Path,
    wal_id: WalId,
    segment_id: SegmentId,
    offset: u64,
) -> Result<WalRecord> {
    let path = segment_dir(table_dir, wal_id, segment_id).join(EVENTS_FILE);
    let mut file = File::open(&path)?;
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(offset))?;

    let torn = || ChronoError::Corruption(format!("torn WAL record at {:?}:{}", path, offset));
    let eof_is_torn = |e: std::io::Error| match e.kind() {
        ErrorKind::UnexpectedEof => torn(),
        _ => ChronoError::Io(e),
    };

    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf).map_err(eof_is_torn)?;
    let len = u32::from_le_bytes(len_buf) as u64;
    // the length prefix is untrusted until the checksum passes
    if len > file_len.saturating_sub(offset + 4) {
        return Err(torn());
    }
    let len = len as usize;

    let mut data = vec![0u8; 4 + len];
    data[..4].copy_from_slice(&len_buf);
    file.read_exact(&mut data[4..]).map_err(eof_is_torn)?;

    match WalRecord::deserialize_with_checksum(&data)? {
        Some((record, _)) => Ok(record),
        None => Err(torn()),
    }
}
