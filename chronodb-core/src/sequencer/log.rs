//! Fixed-size transaction log records
//!
//! ```text
//! header (16 bytes): magic "CHTL" | format version u32 | table id u32 | reserved u32
//! record (72 bytes): txn u64 | kind u8 | pad[3] | wal u32 | segment u32 | offset u64
//!                    | rows u64 | min ts i64 | max ts i64 | structure version u64
//!                    | commit micros i64 | crc32 u32
//! ```
//!
//! Records are fixed-size so the record of txn `n` lives at
//! `HEADER_SIZE + (n - 1) * RECORD_SIZE`.

use crate::{ChronoError, Result, SegmentId, TableId, Timestamp, TxnId, WalId};
use bytes::{Buf, BufMut, BytesMut};

pub const MAGIC: [u8; 4] = *b"CHTL";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 16;
pub const RECORD_SIZE: u64 = 72;

/// Kind of sequenced transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnKind {
    Data = 1,
    Structure = 2,
}

impl TryFrom<u8> for TxnKind {
    type Error = ChronoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TxnKind::Data),
            2 => Ok(TxnKind::Structure),
            _ => Err(ChronoError::Corruption(format!("invalid txn kind {}", value))),
        }
    }
}

/// Durable metadata of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRecord {
    pub txn: TxnId,
    pub kind: TxnKind,
    pub wal_id: WalId,
    pub segment_id: SegmentId,
    /// Byte offset of the WAL record inside the segment events file
    pub segment_offset: u64,
    pub row_count: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub structure_version: u64,
    pub commit_micros: i64,
}

impl TxnRecord {
    /// Offset of the record for `txn` within the log file
    pub fn file_offset(txn: TxnId) -> u64 {
        HEADER_SIZE + (txn - 1) * RECORD_SIZE
    }

    /// Encode to the fixed 72-byte layout
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RECORD_SIZE as usize);
        buf.put_u64_le(self.txn);
        buf.put_u8(self.kind as u8);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.wal_id);
        buf.put_u32_le(self.segment_id);
        buf.put_u64_le(self.segment_offset);
        buf.put_u64_le(self.row_count);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u64_le(self.structure_version);
        buf.put_i64_le(self.commit_micros);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Decode from the fixed layout, validating the checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE as usize {
            return Err(ChronoError::InvalidFormat("txn record too short".into()));
        }
        let body = &data[..RECORD_SIZE as usize - 4];
        let expected = (&data[RECORD_SIZE as usize - 4..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(ChronoError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let txn = cursor.get_u64_le();
        let kind = TxnKind::try_from(cursor.get_u8())?;
        cursor.advance(3);
        Ok(Self {
            txn,
            kind,
            wal_id: cursor.get_u32_le(),
            segment_id: cursor.get_u32_le(),
            segment_offset: cursor.get_u64_le(),
            row_count: cursor.get_u64_le(),
            min_timestamp: cursor.get_i64_le(),
            max_timestamp: cursor.get_i64_le(),
            structure_version: cursor.get_u64_le(),
            commit_micros: cursor.get_i64_le(),
        })
    }
}

/// Encode the log header
pub fn encode_header(table_id: TableId) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
    buf.put_slice(&MAGIC);
    buf.put_u32_le(FORMAT_VERSION);
    buf.put_u32_le(table_id);
    buf.put_u32_le(0);
    buf
}

/// Validate the log header, returning the table id it was written for
pub fn decode_header(data: &[u8]) -> Result<TableId> {
    if data.len() < HEADER_SIZE as usize || data[..4] != MAGIC {
        return Err(ChronoError::Corruption("invalid txn log header".into()));
    }
    let mut cursor = &data[4..];
    let version = cursor.get_u32_le();
    if version != FORMAT_VERSION {
        return Err(ChronoError::InvalidFormat(format!(
            "Unsupported txn log version: {}",
            version
        )));
    }
    Ok(cursor.get_u32_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = TxnRecord {
            txn: 7,
            kind: TxnKind::Data,
            wal_id: 2,
            segment_id: 1,
            segment_offset: 4096,
            row_count: 100,
            min_timestamp: -5,
            max_timestamp: 900,
            structure_version: 3,
            commit_micros: 1_700_000_000_000_000,
        };
        let encoded = record.encode();
        assert_eq!(encoded.len() as u64, RECORD_SIZE);
        assert_eq!(TxnRecord::decode(&encoded).unwrap(), record);
        assert_eq!(TxnRecord::file_offset(1), HEADER_SIZE);
        assert_eq!(TxnRecord::file_offset(3), HEADER_SIZE + 2 * RECORD_SIZE);

        let mut corrupt = encoded.to_vec();
        corrupt[20] ^= 1;
        assert!(matches!(
            TxnRecord::decode(&corrupt),
            Err(ChronoError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_header() {
        let header = encode_header(42);
        assert_eq!(decode_header(&header).unwrap(), 42);
        assert!(decode_header(b"nope").is_err());
    }
}
