use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Value;

/// Primary key of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Int(value) => write!(f, "{value}"),
            RowKey::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for RowKey {
    fn from(value: i64) -> Self {
        RowKey::Int(value)
    }
}

impl From<i32> for RowKey {
    fn from(value: i32) -> Self {
        RowKey::Int(value.into())
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        RowKey::Text(value.to_string())
    }
}

impl From<String> for RowKey {
    fn from(value: String) -> Self {
        RowKey::Text(value)
    }
}

/// A row of a source or target table.
///
/// Columns are kept by name in sorted order, so two rows holding the same values compare equal
/// regardless of the order in which columns were set. The last-modified timestamp is stamped by
/// the change log when the row is written to a tracked table and carried unchanged into targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    key: RowKey,
    columns: BTreeMap<String, Value>,
    last_modified: DateTime<Utc>,
}

impl TableRow {
    /// Creates a row with no columns.
    pub fn new(key: impl Into<RowKey>) -> Self {
        Self {
            key: key.into(),
            columns: BTreeMap::new(),
            last_modified: Utc::now(),
        }
    }

    /// Returns the row with `column` set to `value`.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    /// Returns the value of `column`, or `None` if the column was never set.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn columns(&self) -> &BTreeMap<String, Value> {
        &self.columns
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_modified = at;
    }
}
