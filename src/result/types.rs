//! Result table types.
//!
//! Defines the structures query results are materialized into.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Column type after resolving the service's declared type and date hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Double,
    String,
    Date,
    Timestamp,
}

impl ColumnType {
    /// Maps a declared SQL type (`varchar`, `bigint`, `decimal(10,2)`, ...).
    /// Anything without a dedicated type is kept as text.
    pub fn from_declared(declared: &str) -> Self {
        let lower = declared.trim().to_ascii_lowercase();
        let base = lower
            .split(|c: char| c == '(' || c == ' ')
            .next()
            .unwrap_or_default();
        match base {
            "boolean" => Self::Boolean,
            "tinyint" | "smallint" | "integer" | "int" | "bigint" => Self::Integer,
            "float" | "real" | "double" | "decimal" => Self::Double,
            "date" => Self::Date,
            "timestamp" => Self::Timestamp,
            _ => Self::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::String => "string",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
        })
    }
}

/// A resolved result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Column names whose values are parsed as timestamps regardless of the
/// declared type. Matching ignores ASCII case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFields(HashSet<String>);

impl DateFields {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }

    /// No date hints.
    pub fn none() -> Self {
        Self(HashSet::new())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(&column.to_ascii_lowercase())
    }
}

impl Default for DateFields {
    fn default() -> Self {
        Self::new(["date", "event_date", "report_date"])
    }
}

/// A row of values, one per column.
pub type Row = Vec<Value>;

/// A single cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// NULL, or a cell that could not be parsed as its column type.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        }
    }

    /// Converts to plain JSON: dates and timestamps become strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(_) | Value::Timestamp(_) => {
                serde_json::Value::String(self.to_display_string())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

/// Rows parsed from one chunk, tagged with the chunk's position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableFragment {
    pub index: usize,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

/// One batch of a lazily fetched result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultBatch {
    /// Position of the batch in the result set, starting at 0.
    pub index: usize,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl From<TableFragment> for ResultBatch {
    fn from(fragment: TableFragment) -> Self {
        Self {
            index: fragment.index,
            columns: fragment.columns,
            rows: fragment.rows,
        }
    }
}

/// A complete result set held in memory. Row order is the order the service
/// produced the rows in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaterializedTable {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl MaterializedTable {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the named column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Values of the named column, top to bottom.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| json_row(&self.columns, row))
            .collect()
    }
}

/// One row as a JSON object keyed by column name.
pub fn json_row(columns: &[Column], row: &[Value]) -> serde_json::Map<String, serde_json::Value> {
    columns
        .iter()
        .zip(row)
        .map(|(column, value)| (column.name.clone(), value.to_json()))
        .collect()
}
