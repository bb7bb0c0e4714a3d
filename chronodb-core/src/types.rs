//! Core types for ChronoDB

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Timestamp in microseconds since Unix epoch
pub type Timestamp = i64;

/// Transaction id assigned by the sequencer, starting at 1
pub type TxnId = u64;

/// Table identifier, unique per data directory
pub type TableId = u32;

/// WAL identifier, one per writer session
pub type WalId = u32;

/// Segment identifier within a WAL
pub type SegmentId = u32;

/// Earliest designated timestamp, 0001-01-01T00:00:00Z
pub const MIN_TIMESTAMP: Timestamp = -62_135_596_800_000_000;

/// Latest designated timestamp, 9999-12-31T23:59:59.999999Z
pub const MAX_TIMESTAMP: Timestamp = 253_402_300_799_999_999;

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Closed set of column kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Double,
    Timestamp,
    String,
    Symbol,
}

impl ColumnType {
    /// Upper-case type name as reported in errors
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Byte => "BYTE",
            ColumnType::Short => "SHORT",
            ColumnType::Int => "INT",
            ColumnType::Long => "LONG",
            ColumnType::Double => "DOUBLE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::String => "STRING",
            ColumnType::Symbol => "SYMBOL",
        }
    }

    /// Column type created for a value of an unknown column
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Byte(_) => Some(ColumnType::Byte),
            Value::Short(_) => Some(ColumnType::Short),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Long(_) => Some(ColumnType::Long),
            Value::Double(_) => Some(ColumnType::Double),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Str(_) => Some(ColumnType::String),
            Value::Symbol(_) => Some(ColumnType::Symbol),
        }
    }

    /// Coerce an ingested value to this column type.
    ///
    /// Integral values narrow with a bounds check, doubles never narrow to
    /// integral columns, strings and symbols are interchangeable.
    pub fn coerce(&self, value: Value) -> std::result::Result<Value, String> {
        let protocol = value.protocol_type();
        let cast_error = || {
            format!(
                "cast error from protocol type: {} to column type: {}",
                protocol,
                self.name()
            )
        };
        let out_of_bounds =
            |v: i64| format!("line protocol value: {} is out bounds of column type: {}", v, self.name());

        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(b)),
            (ColumnType::Byte, v) => match v.as_integral() {
                Some(i) => i8::try_from(i).map(Value::Byte).map_err(|_| out_of_bounds(i)),
                None => Err(cast_error()),
            },
            (ColumnType::Short, v) => match v.as_integral() {
                Some(i) => i16::try_from(i).map(Value::Short).map_err(|_| out_of_bounds(i)),
                None => Err(cast_error()),
            },
            (ColumnType::Int, v) => match v.as_integral() {
                Some(i) => i32::try_from(i).map(Value::Int).map_err(|_| out_of_bounds(i)),
                None => Err(cast_error()),
            },
            (ColumnType::Long, v) => v.as_integral().map(Value::Long).ok_or_else(cast_error),
            (ColumnType::Double, Value::Double(d)) => Ok(Value::Double(d)),
            (ColumnType::Double, v) => match v.as_integral() {
                Some(i) => Ok(Value::Double(i as f64)),
                None => Err(cast_error()),
            },
            (ColumnType::Timestamp, Value::Timestamp(t)) => Ok(Value::Timestamp(t)),
            (ColumnType::Timestamp, Value::Long(t)) => Ok(Value::Timestamp(t)),
            (ColumnType::String, Value::Str(s)) | (ColumnType::String, Value::Symbol(s)) => {
                Ok(Value::Str(s))
            }
            (ColumnType::Symbol, Value::Symbol(s)) | (ColumnType::Symbol, Value::Str(s)) => {
                Ok(Value::Symbol(s))
            }
            _ => Err(cast_error()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Double(f64),
    Timestamp(Timestamp),
    Str(String),
    Symbol(String),
}

impl Value {
    /// Check for null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type name of the value as it arrived from an ingestion protocol
    pub fn protocol_type(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) => "LONG",
            Value::Double(_) => "FLOAT",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Str(_) => "STRING",
            Value::Symbol(_) => "SYMBOL",
        }
    }

    fn as_integral(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as i64 if integral or timestamp
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Timestamp(t) => Some(*t),
            other => other.as_integral(),
        }
    }

    /// Get string content of string and symbol values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Partitioning granularity of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionBy {
    None,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl PartitionBy {
    /// Lower bound of the partition period containing `ts`, `None` when the
    /// period cannot be represented
    pub fn floor(&self, ts: Timestamp) -> Option<Timestamp> {
        match self {
            PartitionBy::None => Some(i64::MIN),
            PartitionBy::Hour => ts.checked_sub(ts.rem_euclid(MICROS_PER_HOUR)),
            PartitionBy::Day => ts.checked_sub(ts.rem_euclid(MICROS_PER_DAY)),
            PartitionBy::Week => {
                let days = ts.div_euclid(MICROS_PER_DAY);
                // 1970-01-01 was a Thursday, weeks start on Monday
                let monday = days.checked_sub((days.checked_add(3)?).rem_euclid(7))?;
                monday.checked_mul(MICROS_PER_DAY)
            }
            PartitionBy::Month | PartitionBy::Year => {
                let dt = DateTime::<Utc>::from_timestamp_micros(ts)?;
                let month = if *self == PartitionBy::Month { dt.month() } else { 1 };
                NaiveDate::from_ymd_opt(dt.year(), month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| d.and_utc().timestamp_micros())
            }
        }
    }

    /// Directory name of the partition whose period starts at `floor`
    pub fn partition_name(&self, floor: Timestamp) -> String {
        if *self == PartitionBy::None {
            return "default".to_string();
        }
        let Some(dt) = DateTime::<Utc>::from_timestamp_micros(floor) else {
            return floor.to_string();
        };
        let pattern = match self {
            PartitionBy::Hour => "%Y-%m-%dT%H",
            PartitionBy::Day => "%Y-%m-%d",
            PartitionBy::Week => "%G-W%V",
            PartitionBy::Month => "%Y-%m",
            PartitionBy::Year => "%Y",
            PartitionBy::None => unreachable!(),
        };
        dt.format(pattern).to_string()
    }

    /// Name of a split part that starts at `lower` inside partition `base`.
    ///
    /// Carries the full date, a partition can span several days.
    pub fn split_name(&self, base: &str, lower: Timestamp) -> String {
        match DateTime::<Utc>::from_timestamp_micros(lower) {
            Some(dt) => format!("{}T{}", base, dt.format("%Y%m%d-%H%M%S-%6f")),
            None => format!("{}T{}", base, lower),
        }
    }
}

impl FromStr for PartitionBy {
    type Err = crate::ChronoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PartitionBy::None),
            "hour" => Ok(PartitionBy::Hour),
            "day" => Ok(PartitionBy::Day),
            "week" => Ok(PartitionBy::Week),
            "month" => Ok(PartitionBy::Month),
            "year" => Ok(PartitionBy::Year),
            _ => Err(crate::ChronoError::Config(format!("unknown partitioning: {}", s))),
        }
    }
}

/// A row as handed to a WAL writer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Designated timestamp
    pub timestamp: Timestamp,
    /// Non-timestamp values by column name
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    /// Create a row with no fields
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field value
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = MICROS_PER_DAY;

    #[test]
    fn test_partition_floor_and_name() {
        // 2024-01-02T13:00:00Z
        let ts = 1_704_200_400_000_000;
        let day = PartitionBy::Day.floor(ts).unwrap();
        assert_eq!(PartitionBy::Day.partition_name(day), "2024-01-02");
        assert_eq!(ts - day, 13 * MICROS_PER_HOUR);

        let month = PartitionBy::Month.floor(ts).unwrap();
        assert_eq!(PartitionBy::Month.partition_name(month), "2024-01");
        assert_eq!(month, 1_704_067_200_000_000);

        let year = PartitionBy::Year.floor(ts).unwrap();
        assert_eq!(PartitionBy::Year.partition_name(year), "2024");
        let hour = PartitionBy::Hour.floor(ts).unwrap();
        assert_eq!(PartitionBy::Hour.partition_name(hour), "2024-01-02T13");
    }

    #[test]
    fn test_floor_at_the_edges() {
        let kinds = [
            PartitionBy::None,
            PartitionBy::Hour,
            PartitionBy::Day,
            PartitionBy::Week,
            PartitionBy::Month,
            PartitionBy::Year,
        ];
        for kind in kinds {
            assert!(kind.floor(MIN_TIMESTAMP).is_some(), "{:?}", kind);
            assert!(kind.floor(MAX_TIMESTAMP).is_some(), "{:?}", kind);
        }
        assert_eq!(PartitionBy::Day.floor(i64::MIN), None);
        assert_eq!(PartitionBy::Week.floor(i64::MIN), None);
        assert_eq!(PartitionBy::Month.floor(i64::MAX), None);
        assert_eq!(PartitionBy::Day.floor(MIN_TIMESTAMP), Some(MIN_TIMESTAMP));
    }

    #[test]
    fn test_split_names_differ_across_days() {
        // 05:20 on two different days
        let first = 1_704_086_400_000_000;
        let second = first + DAY;
        let a = PartitionBy::None.split_name("default", first);
        let b = PartitionBy::None.split_name("default", second);
        assert_eq!(a, "defaultT20240101-052000-000000");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_partition_by() {
        assert_eq!("WEEK".parse::<PartitionBy>().unwrap(), PartitionBy::Week);
        assert_eq!("none".parse::<PartitionBy>().unwrap(), PartitionBy::None);
        assert!(matches!(
            "fortnight".parse::<PartitionBy>(),
            Err(crate::ChronoError::Config(_))
        ));
    }

    #[test]
    fn test_week_starts_on_monday() {
        // 2024-01-03 is a Wednesday, the week starts 2024-01-01
        let wed = 1_704_240_000_000_000;
        let week = PartitionBy::Week.floor(wed).unwrap();
        assert_eq!(week, 1_704_067_200_000_000);
        assert_eq!(PartitionBy::Week.partition_name(week), "2024-W01");
        // negative timestamps floor downwards
        assert_eq!(PartitionBy::Day.floor(-1), Some(-DAY));
    }

    #[test]
    fn test_coerce_rules() {
        assert_eq!(ColumnType::Byte.coerce(Value::Long(12)), Ok(Value::Byte(12)));
        assert_eq!(
            ColumnType::Byte.coerce(Value::Long(1024)),
            Err("line protocol value: 1024 is out bounds of column type: BYTE".to_string())
        );
        assert_eq!(
            ColumnType::Int.coerce(Value::Double(1.5)),
            Err("cast error from protocol type: FLOAT to column type: INT".to_string())
        );
        assert_eq!(
            ColumnType::String.coerce(Value::Double(1.5)),
            Err("cast error from protocol type: FLOAT to column type: STRING".to_string())
        );
        assert_eq!(ColumnType::Double.coerce(Value::Long(3)), Ok(Value::Double(3.0)));
        assert_eq!(
            ColumnType::Symbol.coerce(Value::Str("eu".into())),
            Ok(Value::Symbol("eu".into()))
        );
        assert_eq!(ColumnType::Boolean.coerce(Value::Null), Ok(Value::Null));
    }
}
