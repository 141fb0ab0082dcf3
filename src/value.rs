// ABOUTME: Type marshaller - converts between generic values and native bound/extracted values
// ABOUTME: Dispatches exhaustively on the declared column type tag; one shared LOB drain utility

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::io::Read;
use tracing::warn;

use crate::catalog::{ColType, Column};
use crate::conn::SourceRow;
use crate::error::{ReplicationError, Result};

/// Generic column value as carried in change events.
///
/// Temporal values are epoch milliseconds (`BigInt`); the native
/// representation only reappears when a value is bound. Large objects
/// have already been drained into owned buffers by the time a `Value`
/// exists.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Render into JSON for the event envelope.
    ///
    /// Decimals become strings so their declared scale survives the
    /// trip through JSON; binary becomes base64.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::TinyInt(v) => JsonValue::from(*v),
            Self::SmallInt(v) => JsonValue::from(*v),
            Self::Int(v) => JsonValue::from(*v),
            Self::BigInt(v) => JsonValue::from(*v),
            Self::Float(v) => JsonValue::from(*v),
            Self::Double(v) => JsonValue::from(*v),
            Self::Decimal(d) => JsonValue::String(d.to_string()),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Bytes(b) => {
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }

    /// Human-readable rendering for log messages (key descriptions).
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::TinyInt(v) => v.to_string(),
            Self::SmallInt(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::BigInt(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::Text(s) => format!("'{s}'"),
            Self::Bytes(b) => {
                format!("'{}'", base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

/// Native value ready for positional binding.
///
/// Nulls carry the column's type tag so drivers can send typed nulls.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null(ColType),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Text(String),
    Bytes(Vec<u8>),
}

/// Drain a binary stream fully into one owned buffer.
pub fn drain_bytes(reader: &mut dyn Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 * 1024);
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Drain a character stream fully into one owned string.
pub fn drain_text(reader: &mut dyn Read) -> std::io::Result<String> {
    let mut buf = String::with_capacity(8 * 1024);
    reader.read_to_string(&mut buf)?;
    Ok(buf)
}

fn date_to_millis(d: NaiveDate) -> i64 {
    // Midnight UTC; a legacy date promoted to timestamp keeps a zero fraction.
    d.and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
        .timestamp_millis()
}

fn millis_to_timestamp(ms: i64, column: &str) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| {
            ReplicationError::sql_msg(format!("binding out-of-range epoch millis for {column}"))
        })
}

/// Extract one column from a source row into a generic value.
///
/// Dispatches on the column's declared type tag. Null source values
/// always extract to `Value::Null`, never a zero value. Decimals are
/// rescaled to the declared scale. Large objects are drained here,
/// while the row cursor is still positioned on this row; a drain
/// failure is logged and null-substituted per the error taxonomy.
pub fn extract(row: &dyn SourceRow, idx: usize, col: &Column) -> Result<Value> {
    let value = match col.col_type() {
        ColType::TinyInt => row.get_i8(idx)?.map(Value::TinyInt),
        ColType::SmallInt => row.get_i16(idx)?.map(Value::SmallInt),
        ColType::Integer => row.get_i32(idx)?.map(Value::Int),
        ColType::BigInt => row.get_i64(idx)?.map(Value::BigInt),
        ColType::Float => row.get_f32(idx)?.map(Value::Float),
        ColType::Double => row.get_f64(idx)?.map(Value::Double),
        ColType::Decimal => row.get_decimal(idx)?.map(|mut d| {
            d.rescale(col.scale());
            Value::Decimal(d)
        }),
        ColType::Date => row.get_date(idx)?.map(|d| Value::BigInt(date_to_millis(d))),
        ColType::DateAsTimestamp => {
            // Legacy date column promoted to a zero-fraction timestamp.
            row.get_date(idx)?.map(|d| Value::BigInt(date_to_millis(d)))
        }
        ColType::Timestamp => row
            .get_timestamp(idx)?
            .map(|ts| Value::BigInt(ts.and_utc().timestamp_millis())),
        ColType::Char | ColType::Varchar | ColType::NChar | ColType::NVarchar => {
            row.get_string(idx)?.map(Value::Text)
        }
        ColType::Binary | ColType::Varbinary => row.get_bytes(idx)?.map(Value::Bytes),
        ColType::Blob => match row.binary_stream(idx)? {
            None => None,
            Some(mut reader) => match drain_bytes(reader.as_mut()) {
                Ok(buf) if buf.is_empty() => None,
                Ok(buf) => Some(Value::Bytes(buf)),
                Err(e) => {
                    let err = ReplicationError::Io {
                        column: col.name().to_string(),
                        source: e,
                    };
                    warn!("{err}; substituting null");
                    None
                }
            },
        },
        ColType::Clob => match row.character_stream(idx)? {
            None => None,
            Some(mut reader) => match drain_text(reader.as_mut()) {
                Ok(s) if s.is_empty() => None,
                Ok(s) => Some(Value::Text(s)),
                Err(e) => {
                    let err = ReplicationError::Io {
                        column: col.name().to_string(),
                        source: e,
                    };
                    warn!("{err}; substituting null");
                    None
                }
            },
        },
        // Out-of-set tags fall back to string extraction.
        ColType::Other => row.get_string(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Convert a generic value into the native bound form for a column.
///
/// The inverse of `extract`: epoch-millisecond integers become native
/// temporal values, decimals are rescaled to the declared scale, and
/// out-of-set tags bind as strings. A value shape that cannot be bound
/// into the declared type is an execution error (it aborts the batch;
/// nothing here is silently coerced to zero).
pub fn bind(col: &Column, value: &Value) -> Result<BindValue> {
    if value.is_null() {
        return Ok(BindValue::Null(col.col_type()));
    }
    let mismatch = || {
        ReplicationError::sql_msg(format!(
            "binding {:?} into column {} declared as {:?}",
            value,
            col.name(),
            col.col_type()
        ))
    };
    match (col.col_type(), value) {
        (ColType::TinyInt, Value::TinyInt(v)) => Ok(BindValue::TinyInt(*v)),
        (ColType::SmallInt, Value::SmallInt(v)) => Ok(BindValue::SmallInt(*v)),
        (ColType::Integer, Value::Int(v)) => Ok(BindValue::Int(*v)),
        (ColType::BigInt, Value::BigInt(v)) => Ok(BindValue::BigInt(*v)),
        (ColType::Float, Value::Float(v)) => Ok(BindValue::Float(*v)),
        (ColType::Double, Value::Double(v)) => Ok(BindValue::Double(*v)),
        (ColType::Decimal, Value::Decimal(d)) => {
            let mut d = *d;
            d.rescale(col.scale());
            Ok(BindValue::Decimal(d))
        }
        (ColType::Date, Value::BigInt(ms)) => {
            Ok(BindValue::Date(millis_to_timestamp(*ms, col.name())?.date()))
        }
        (ColType::Timestamp | ColType::DateAsTimestamp, Value::BigInt(ms)) => {
            Ok(BindValue::Timestamp(millis_to_timestamp(*ms, col.name())?))
        }
        (
            ColType::Char | ColType::Varchar | ColType::NChar | ColType::NVarchar | ColType::Clob,
            Value::Text(s),
        ) => Ok(BindValue::Text(s.clone())),
        (ColType::Binary | ColType::Varbinary | ColType::Blob, Value::Bytes(b)) => {
            Ok(BindValue::Bytes(b.clone()))
        }
        (ColType::Other, v) => Ok(BindValue::Text(v.render())),
        _ => Err(mismatch()),
    }
}
