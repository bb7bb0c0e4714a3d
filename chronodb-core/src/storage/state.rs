//! Published table state
//!
//! `_txn` holds the state as of the last applied transaction: structure,
//! partition list and symbol dictionaries. It is replaced atomically by
//! writing a temporary file and renaming it over the old one, which is the
//! commit point of every merge.

use super::column::SymbolTable;
use super::partition::{sync_dir, PartitionMeta};
use crate::schema::TableStructure;
use crate::{ChronoError, Result, Timestamp, TxnId};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Published state file name
pub const STATE_FILE: &str = "_txn";
const STATE_TMP_FILE: &str = "_txn.tmp";
const STATE_MAGIC: u32 = 0x4348_5458;

/// Table state visible to readers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    /// Highest applied txn
    pub txn: TxnId,
    pub structure: TableStructure,
    /// Partition parts keyed by their lower bound
    pub partitions: BTreeMap<Timestamp, PartitionMeta>,
    /// Symbol dictionary per column index
    pub symbols: Vec<SymbolTable>,
    pub row_count: u64,
}

impl TableState {
    /// State of a table nothing has been applied to
    pub fn empty(structure: TableStructure) -> Self {
        Self {
            txn: 0,
            symbols: vec![SymbolTable::default(); structure.columns.len()],
            structure,
            partitions: BTreeMap::new(),
            row_count: 0,
        }
    }

    /// Load the published state, `None` if the table was never applied to
    pub fn load(table_dir: &Path) -> Result<Option<Self>> {
        let path = table_dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.len() < 12 {
            return Err(ChronoError::Corruption(format!("{:?} is truncated", path)));
        }

        let mut cursor = &data[..];
        let magic = cursor.get_u32_le();
        let len = cursor.get_u32_le() as usize;
        let expected = cursor.get_u32_le();
        if magic != STATE_MAGIC || cursor.len() != len {
            return Err(ChronoError::Corruption(format!("{:?} has an invalid header", path)));
        }
        let actual = crc32fast::hash(cursor);
        if expected != actual {
            return Err(ChronoError::ChecksumMismatch { expected, actual });
        }

        let state = bincode::deserialize(cursor)
            .map_err(|e| ChronoError::Corruption(format!("table state: {}", e)))?;
        Ok(Some(state))
    }

    /// Atomically replace the published state
    pub fn persist(&self, table_dir: &Path) -> Result<()> {
        let payload =
            bincode::serialize(self).map_err(|e| ChronoError::InvalidFormat(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(payload.len() + 12);
        buf.put_u32_le(STATE_MAGIC);
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_slice(&payload);

        let tmp = table_dir.join(STATE_TMP_FILE);
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, table_dir.join(STATE_FILE))?;
        sync_dir(table_dir)
    }

    /// Part that owns `ts`, if its partition exists
    pub fn route(&self, ts: Timestamp) -> Option<&PartitionMeta> {
        let floor = self.structure.partition_by.floor(ts)?;
        self.partitions
            .range(..=ts)
            .next_back()
            .map(|(_, p)| p)
            .filter(|p| p.floor == floor)
    }

    /// Parts of the partition whose period starts at `floor`, in order
    pub fn family(&self, floor: Timestamp) -> impl Iterator<Item = &PartitionMeta> {
        self.partitions.range(floor..).map(|(_, p)| p).take_while(move |p| p.floor == floor)
    }

    /// Partition directories this state reads from
    pub fn referenced_dirs(&self) -> HashSet<String> {
        self.partitions.values().map(PartitionMeta::dir_name).collect()
    }
}
