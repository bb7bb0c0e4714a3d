//! Versioned table structure

use crate::{ChronoError, ColumnType, PartitionBy, Result};
use serde::{Deserialize, Serialize};

/// Column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    /// Create a nullable column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    /// Mark the column as not nullable
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Column names double as file names inside partition directories
fn check_column_name(table: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ChronoError::schema(table, "column name must not be empty"));
    }
    if name.chars().any(|c| matches!(c, '/' | '\\' | '.' | '~' | '\0')) || name.starts_with('_') {
        return Err(ChronoError::column(table, name, "invalid column name"));
    }
    Ok(())
}

/// A structural change recorded in the WAL and sequenced like data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureChange {
    /// Append a column; rows written before it read as null
    AddColumn(ColumnDef),
}

/// Table definition at a given structure version.
///
/// Columns are only ever appended, so a column keeps its index across
/// versions and a batch written against version `v` maps positionally onto
/// the first columns of any later version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStructure {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub timestamp_index: usize,
    pub partition_by: PartitionBy,
    pub version: u64,
}

impl TableStructure {
    /// Build a version 0 structure, validating the designated timestamp
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        timestamp_column: &str,
        partition_by: PartitionBy,
    ) -> Result<Self> {
        let name = name.into();
        let timestamp_index = columns
            .iter()
            .position(|c| c.name == timestamp_column)
            .ok_or_else(|| {
                ChronoError::column(&name, timestamp_column, "designated timestamp column does not exist")
            })?;
        if columns[timestamp_index].column_type != ColumnType::Timestamp {
            return Err(ChronoError::column(
                &name,
                timestamp_column,
                "designated timestamp column must be of type TIMESTAMP",
            ));
        }
        for (i, col) in columns.iter().enumerate() {
            check_column_name(&name, &col.name)?;
            if columns[..i].iter().any(|c| c.name.eq_ignore_ascii_case(&col.name)) {
                return Err(ChronoError::column(&name, &col.name, "duplicate column name"));
            }
        }

        let mut columns = columns;
        columns[timestamp_index].nullable = false;

        Ok(Self {
            name,
            columns,
            timestamp_index,
            partition_by,
            version: 0,
        })
    }

    /// Index of a column by case-insensitive name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Name of the designated timestamp column
    pub fn timestamp_column(&self) -> &str {
        &self.columns[self.timestamp_index].name
    }

    /// Validate a change against this structure.
    ///
    /// Returns `Ok(false)` when the change is already reflected, which
    /// happens when two sessions add the same column concurrently.
    pub fn validate(&self, change: &StructureChange) -> Result<bool> {
        match change {
            StructureChange::AddColumn(def) => match self.column_index(&def.name) {
                Some(idx) if self.columns[idx].column_type == def.column_type => Ok(false),
                Some(idx) => Err(ChronoError::column(
                    &self.name,
                    &def.name,
                    format!(
                        "column already exists with type {}, cannot add as {}",
                        self.columns[idx].column_type, def.column_type
                    ),
                )),
                None => {
                    check_column_name(&self.name, &def.name)?;
                    if !def.nullable {
                        // existing rows read as null in an added column
                        return Err(ChronoError::column(
                            &self.name,
                            &def.name,
                            "added column must be nullable",
                        ));
                    }
                    Ok(true)
                }
            },
        }
    }

    /// Apply a validated change, bumping the structure version
    pub fn apply(&mut self, change: &StructureChange) -> Result<bool> {
        if !self.validate(change)? {
            return Ok(false);
        }
        match change {
            StructureChange::AddColumn(def) => self.columns.push(def.clone()),
        }
        self.version += 1;
        Ok(true)
    }
}
