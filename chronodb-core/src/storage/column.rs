//! Column value codec
//!
//! A column file is a plain sequence of values. Each value starts with a
//! presence byte (`0` null, `1` present) followed by the fixed-width or
//! length-prefixed payload of the column type. Symbols are stored as keys
//! into the table's per-column symbol dictionary.

use crate::{ChronoError, ColumnType, Result, Value};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-column symbol dictionary, append-only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    values: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, i32>,
}

impl SymbolTable {
    /// Key of a symbol, adding it when new
    pub fn key_of(&mut self, symbol: &str) -> i32 {
        if self.index.len() != self.values.len() {
            self.index = self
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| (v.clone(), i as i32))
                .collect();
        }
        if let Some(&key) = self.index.get(symbol) {
            return key;
        }
        let key = self.values.len() as i32;
        self.values.push(symbol.to_string());
        self.index.insert(symbol.to_string(), key);
        key
    }

    /// Symbol for a key
    pub fn value(&self, key: i32) -> Option<&str> {
        usize::try_from(key)
            .ok()
            .and_then(|k| self.values.get(k))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Encode values of one column
pub fn encode_values(
    column_type: ColumnType,
    values: &[Value],
    symbols: &mut SymbolTable,
) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(values.len() * 9);
    for value in values {
        if value.is_null() {
            buf.put_u8(0);
            continue;
        }
        buf.put_u8(1);
        match (column_type, value) {
            (ColumnType::Boolean, Value::Boolean(v)) => buf.put_u8(*v as u8),
            (ColumnType::Byte, Value::Byte(v)) => buf.put_i8(*v),
            (ColumnType::Short, Value::Short(v)) => buf.put_i16_le(*v),
            (ColumnType::Int, Value::Int(v)) => buf.put_i32_le(*v),
            (ColumnType::Long, Value::Long(v)) => buf.put_i64_le(*v),
            (ColumnType::Double, Value::Double(v)) => buf.put_f64_le(*v),
            (ColumnType::Timestamp, Value::Timestamp(v)) => buf.put_i64_le(*v),
            (ColumnType::String, Value::Str(s)) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            (ColumnType::Symbol, Value::Symbol(s)) => buf.put_i32_le(symbols.key_of(s)),
            (column_type, value) => {
                return Err(ChronoError::Internal(format!(
                    "value {:?} does not match column type {}",
                    value, column_type
                )))
            }
        }
    }
    Ok(buf)
}

/// Decode exactly `count` values of one column
pub fn decode_values(
    column_type: ColumnType,
    data: &[u8],
    count: usize,
    symbols: &SymbolTable,
) -> Result<Vec<Value>> {
    let mut cursor = data;
    let mut values = Vec::with_capacity(count);

    for _ in 0..count {
        if !cursor.has_remaining() {
            return Err(truncated(column_type));
        }
        if cursor.get_u8() == 0 {
            values.push(Value::Null);
            continue;
        }

        let width = match column_type {
            ColumnType::Boolean | ColumnType::Byte => 1,
            ColumnType::Short => 2,
            ColumnType::Int | ColumnType::Symbol | ColumnType::String => 4,
            ColumnType::Long | ColumnType::Double | ColumnType::Timestamp => 8,
        };
        if cursor.remaining() < width {
            return Err(truncated(column_type));
        }

        let value = match column_type {
            ColumnType::Boolean => Value::Boolean(cursor.get_u8() != 0),
            ColumnType::Byte => Value::Byte(cursor.get_i8()),
            ColumnType::Short => Value::Short(cursor.get_i16_le()),
            ColumnType::Int => Value::Int(cursor.get_i32_le()),
            ColumnType::Long => Value::Long(cursor.get_i64_le()),
            ColumnType::Double => Value::Double(cursor.get_f64_le()),
            ColumnType::Timestamp => Value::Timestamp(cursor.get_i64_le()),
            ColumnType::String => {
                let len = cursor.get_u32_le() as usize;
                if cursor.remaining() < len {
                    return Err(truncated(column_type));
                }
                let s = String::from_utf8(cursor[..len].to_vec())
                    .map_err(|e| ChronoError::Corruption(format!("string column: {}", e)))?;
                cursor.advance(len);
                Value::Str(s)
            }
            ColumnType::Symbol => {
                let key = cursor.get_i32_le();
                let symbol = symbols.value(key).ok_or_else(|| {
                    ChronoError::Corruption(format!("symbol key {} not in dictionary", key))
                })?;
                Value::Symbol(symbol.to_string())
            }
        };
        values.push(value);
    }

    Ok(values)
}

fn truncated(column_type: ColumnType) -> ChronoError {
    ChronoError::Corruption(format!("{} column file is truncated", column_type))
}
