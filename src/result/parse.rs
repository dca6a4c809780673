//! Conversion of raw result chunks into typed rows.
//!
//! Page cells arrive as optional strings and are parsed per resolved column
//! type. Parquet objects are decoded through arrow and converted column by
//! column. In both cases a cell that cannot be read as its column type
//! becomes [`Value::Null`].

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Date32Type, Float64Type, Int64Type, TimeUnit, TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{QuarryError, Result};
use crate::service::{ColumnMetadata, ResultPage};

use super::types::{Column, ColumnType, DateFields, Row, TableFragment, Value};

/// Timestamp layouts the service emits, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Resolves service column metadata against the date hints.
pub fn resolve_columns(columns: &[ColumnMetadata], date_fields: &DateFields) -> Vec<Column> {
    columns
        .iter()
        .map(|c| {
            let column_type = if date_fields.contains(&c.name) {
                ColumnType::Timestamp
            } else {
                ColumnType::from_declared(&c.declared_type)
            };
            Column::new(&c.name, column_type)
        })
        .collect()
}

/// Parses one raw cell.
pub fn parse_cell(raw: Option<&str>, column_type: ColumnType) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };

    match column_type {
        ColumnType::String => Value::String(raw.to_string()),
        ColumnType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Null,
        },
        ColumnType::Integer => raw.trim().parse().map(Value::Int).unwrap_or(Value::Null),
        ColumnType::Double => raw.trim().parse().map(Value::Float).unwrap_or(Value::Null),
        ColumnType::Date => parse_date(raw).map(Value::Date).unwrap_or(Value::Null),
        ColumnType::Timestamp => parse_timestamp(raw)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Accepts dates, naive timestamps, and RFC 3339 or zoned timestamps
/// (converted to UTC).
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }

    // "2024-01-01 10:00:00.000 UTC" and similar zoned renderings.
    let naive_part = raw
        .rsplit_once(' ')
        .filter(|(_, zone)| zone.chars().all(|c| c.is_ascii_alphabetic() || c == '/' || c == '_'))
        .map_or(raw, |(ts, _)| ts);

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive_part, format).ok())
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Parses a result page into a fragment.
///
/// With `drop_header`, a first row equal to the column names is skipped: the
/// service repeats the header at the top of SELECT results.
pub fn parse_page(
    index: usize,
    page: ResultPage,
    date_fields: &DateFields,
    drop_header: bool,
) -> TableFragment {
    let columns = resolve_columns(&page.columns, date_fields);
    let mut rows = page.rows.into_iter().peekable();

    if drop_header {
        let is_header = rows.peek().is_some_and(|first| {
            first.len() == page.columns.len()
                && first
                    .iter()
                    .zip(&page.columns)
                    .all(|(cell, column)| cell.as_deref() == Some(column.name.as_str()))
        });
        if is_header {
            rows.next();
        }
    }

    let rows = rows
        .map(|cells| {
            columns
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    parse_cell(
                        cells.get(i).and_then(|c| c.as_deref()),
                        column.column_type,
                    )
                })
                .collect()
        })
        .collect();

    TableFragment {
        index,
        columns,
        rows,
    }
}

fn parquet_error(e: impl std::fmt::Display) -> QuarryError {
    QuarryError::internal(format!("Parquet: {e}"))
}

/// Decodes a Parquet object into a fragment.
pub fn parse_parquet(index: usize, data: Bytes, date_fields: &DateFields) -> Result<TableFragment> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data).map_err(parquet_error)?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(parquet_error)?;

    let columns: Vec<Column> = schema
        .fields()
        .iter()
        .map(|field| {
            let column_type = if date_fields.contains(field.name()) {
                ColumnType::Timestamp
            } else {
                arrow_column_type(field.data_type())
            };
            Column::new(field.name(), column_type)
        })
        .collect();

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(parquet_error)?;
        append_batch_rows(&batch, &columns, &mut rows)?;
    }

    Ok(TableFragment {
        index,
        columns,
        rows,
    })
}

fn arrow_column_type(data_type: &DataType) -> ColumnType {
    match data_type {
        DataType::Boolean => ColumnType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnType::Integer,
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => ColumnType::Double,
        DataType::Date32 | DataType::Date64 => ColumnType::Date,
        DataType::Timestamp(_, _) => ColumnType::Timestamp,
        _ => ColumnType::String,
    }
}

fn append_batch_rows(batch: &RecordBatch, columns: &[Column], rows: &mut Vec<Row>) -> Result<()> {
    let mut converted: Vec<Vec<Value>> = Vec::with_capacity(columns.len());
    for (array, column) in batch.columns().iter().zip(columns) {
        converted.push(convert_array(array, column.column_type)?);
    }

    for row in 0..batch.num_rows() {
        rows.push(
            converted
                .iter()
                .map(|values| values.get(row).cloned().unwrap_or_default())
                .collect(),
        );
    }
    Ok(())
}

fn convert_array(array: &ArrayRef, column_type: ColumnType) -> Result<Vec<Value>> {
    let len = array.len();
    let cast_to = |data_type: &DataType| cast(array, data_type).map_err(parquet_error);

    let values = match (column_type, array.data_type()) {
        (ColumnType::Boolean, _) => {
            let array = array.as_boolean();
            (0..len)
                .map(|i| non_null(array, i).map_or(Value::Null, |i| Value::Bool(array.value(i))))
                .collect()
        }
        (ColumnType::Integer, _) => {
            let cast = cast_to(&DataType::Int64)?;
            let array = cast.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| non_null(array, i).map_or(Value::Null, |i| Value::Int(array.value(i))))
                .collect()
        }
        (ColumnType::Double, _) => {
            let cast = cast_to(&DataType::Float64)?;
            let array = cast.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| non_null(array, i).map_or(Value::Null, |i| Value::Float(array.value(i))))
                .collect()
        }
        (ColumnType::Date, _) => {
            let cast = cast_to(&DataType::Date32)?;
            let array = cast.as_primitive::<Date32Type>();
            (0..len)
                .map(|i| {
                    non_null(array, i)
                        .and_then(|i| array.value_as_date(i))
                        .map_or(Value::Null, Value::Date)
                })
                .collect()
        }
        // Date-hinted text columns are parsed like page cells.
        (ColumnType::Timestamp, DataType::Utf8 | DataType::LargeUtf8) => display_values(array)?
            .into_iter()
            .map(|raw| parse_cell(raw.as_deref(), ColumnType::Timestamp))
            .collect(),
        (ColumnType::Timestamp, DataType::Date32 | DataType::Date64 | DataType::Timestamp(_, _)) => {
            let cast = cast_to(&DataType::Timestamp(TimeUnit::Microsecond, None))?;
            let array = cast.as_primitive::<TimestampMicrosecondType>();
            (0..len)
                .map(|i| {
                    non_null(array, i)
                        .and_then(|i| array.value_as_datetime(i))
                        .map_or(Value::Null, Value::Timestamp)
                })
                .collect()
        }
        (ColumnType::Timestamp, _) => vec![Value::Null; len],
        (ColumnType::String, _) => display_values(array)?
            .into_iter()
            .map(|raw| raw.map_or(Value::Null, Value::String))
            .collect(),
    };
    Ok(values)
}

fn non_null(array: &dyn Array, i: usize) -> Option<usize> {
    (!array.is_null(i)).then_some(i)
}

fn display_values(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(array.as_ref(), &options).map_err(parquet_error)?;
    Ok((0..array.len())
        .map(|i| (!array.is_null(i)).then(|| formatter.value(i).to_string()))
        .collect())
}
