//! WAL record types and serialization

use crate::schema::StructureChange;
use crate::{ChronoError, Result, Timestamp, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const COMPRESSED_FLAG: u8 = 0x80;

/// WAL record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalRecordType {
    /// Batch of rows
    Data = 1,
    /// Structural change
    Structure = 2,
}

impl TryFrom<u8> for WalRecordType {
    type Error = ChronoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalRecordType::Data),
            2 => Ok(WalRecordType::Structure),
            _ => Err(ChronoError::InvalidFormat(format!(
                "Invalid WAL record type: {}",
                value
            ))),
        }
    }
}

/// Symbol column as stored in the WAL: session-local keys plus the
/// dictionary entries this batch refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolColumn {
    /// Local key per row, `-1` for null
    pub keys: Vec<i32>,
    /// Local key to symbol value
    pub dictionary: Vec<(i32, String)>,
}

impl SymbolColumn {
    /// Resolve local keys back to values
    pub fn resolve(&self) -> Result<Vec<Value>> {
        let dict: std::collections::HashMap<i32, &str> = self
            .dictionary
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        self.keys
            .iter()
            .map(|&key| {
                if key < 0 {
                    return Ok(Value::Null);
                }
                dict.get(&key)
                    .map(|s| Value::Symbol(s.to_string()))
                    .ok_or_else(|| {
                        ChronoError::Corruption(format!("symbol key {} missing from WAL dictionary", key))
                    })
            })
            .collect()
    }
}

/// One column of a row batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalColumn {
    Values(Vec<Value>),
    Symbols(SymbolColumn),
}

impl WalColumn {
    /// Number of rows in the column
    pub fn len(&self) -> usize {
        match self {
            WalColumn::Values(v) => v.len(),
            WalColumn::Symbols(s) => s.keys.len(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize values
    pub fn into_values(self) -> Result<Vec<Value>> {
        match self {
            WalColumn::Values(v) => Ok(v),
            WalColumn::Symbols(s) => s.resolve(),
        }
    }
}

/// Column-oriented row batch written by one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    /// Structure version the batch was written against
    pub structure_version: u64,
    pub row_count: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    /// Rows were appended in ascending timestamp order
    pub ordered: bool,
    /// One entry per column of the structure version
    pub columns: Vec<WalColumn>,
}

/// A single WAL record
#[derive(Debug, Clone)]
pub struct WalRecord {
    /// Record type
    pub record_type: WalRecordType,
    /// Record payload (serialized)
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Create a data record
    pub fn data(batch: &DataBatch) -> Result<Self> {
        let payload =
            bincode::serialize(batch).map_err(|e| ChronoError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            record_type: WalRecordType::Data,
            payload,
        })
    }

    /// Create a structure change record
    pub fn structure(change: &StructureChange) -> Result<Self> {
        let payload =
            bincode::serialize(change).map_err(|e| ChronoError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            record_type: WalRecordType::Structure,
            payload,
        })
    }

    /// Serialize the record with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: record length (excluding this field)
    /// - 1 byte: record type, high bit set when the payload is LZ4 compressed
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self, compress: bool) -> Bytes {
        let mut buf = BytesMut::new();

        // Reserve space for length prefix
        buf.put_u32_le(0);

        let compressed;
        let (type_byte, payload) = if compress && self.record_type == WalRecordType::Data {
            compressed = lz4_flex::compress_prepend_size(&self.payload);
            (self.record_type as u8 | COMPRESSED_FLAG, compressed.as_slice())
        } else {
            (self.record_type as u8, self.payload.as_slice())
        };

        buf.put_u8(type_byte);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);

        // Checksum excludes the length prefix
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize a record from bytes, validating the checksum.
    ///
    /// Returns `Ok(None)` when `data` ends before the record does, which is
    /// what a write torn by a crash looks like.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(data);
        let len = cursor.get_u32_le() as usize;
        if len < 9 {
            return Err(ChronoError::InvalidFormat(format!("WAL record too short: {}", len)));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }

        let body = &data[4..4 + len];
        let expected = (&body[len - 4..]).get_u32_le();
        let actual = crc32fast::hash(&body[..len - 4]);
        if expected != actual {
            return Err(ChronoError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = std::io::Cursor::new(body);
        let type_byte = cursor.get_u8();
        let record_type = WalRecordType::try_from(type_byte & !COMPRESSED_FLAG)?;
        let payload_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if pos + payload_len > len - 4 {
            return Err(ChronoError::InvalidFormat("WAL payload overruns record".into()));
        }
        let raw = &body[pos..pos + payload_len];

        let payload = if type_byte & COMPRESSED_FLAG != 0 {
            lz4_flex::decompress_size_prepended(raw)
                .map_err(|e| ChronoError::Corruption(format!("LZ4 payload: {}", e)))?
        } else {
            raw.to_vec()
        };

        Ok(Some((
            WalRecord {
                record_type,
                payload,
            },
            4 + len,
        )))
    }

    /// Get the batch from a data record
    pub fn data_batch(&self) -> Result<DataBatch> {
        if self.record_type != WalRecordType::Data {
            return Err(ChronoError::InvalidFormat("Not a data record".into()));
        }
        bincode::deserialize(&self.payload).map_err(|e| ChronoError::InvalidFormat(e.to_string()))
    }

    /// Get the change from a structure record
    pub fn structure_change(&self) -> Result<StructureChange> {
        if self.record_type != WalRecordType::Structure {
            return Err(ChronoError::InvalidFormat("Not a structure record".into()));
        }
        bincode::deserialize(&self.payload).map_err(|e| ChronoError::InvalidFormat(e.to_string()))
    }
}
