//! Typed column values and rows.
//!
//! Every value that flows through the write layer is one of three tagged
//! variants. The same representation is used for bound statement parameters,
//! for rows read back from the database, and for the JSON text stored in the
//! rollback log, so a value survives the log without losing its type:
//!
//! ```text
//! {"type":"bytes","data":[222,173,190,239]}
//! {"type":"date","data":1700000000000}
//! {"type":"raw","data":{"any":"json"}}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// A row: column name → value. Column order is the map's sort order.
pub type Row = BTreeMap<String, Value>;

/// A single column value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Value {
    /// Binary blob (`BYTEA` / `BLOB`).
    Bytes(Vec<u8>),
    /// Point in time, stored with millisecond precision.
    Date(#[serde(with = "chrono::serde::ts_milliseconds")] DateTime<Utc>),
    /// Anything JSON can represent: null, booleans, numbers, text, arrays, objects.
    Raw(serde_json::Value),
}

impl Value {
    pub const NULL: Value = Value::Raw(serde_json::Value::Null);

    /// Build a date value from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Value::Date)
    }

    /// Encode as the tagged JSON form used by the rollback log.
    pub fn serialize(&self) -> serde_json::Value {
        match self {
            Value::Bytes(b) => serde_json::json!({ "type": "bytes", "data": b }),
            Value::Date(d) => serde_json::json!({ "type": "date", "data": d.timestamp_millis() }),
            Value::Raw(v) => serde_json::json!({ "type": "raw", "data": v }),
        }
    }

    /// Decode the tagged JSON form produced by [`Value::serialize`].
    pub fn deserialize(v: serde_json::Value) -> Result<Self, DbError> {
        Ok(serde_json::from_value(v)?)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Raw(serde_json::Value::Null))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Raw(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|n| u64::try_from(n).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Raw(v) => v.as_str(),
            _ => None,
        }
    }

    /// Booleans come back from SQLite as `0` / `1`, so integers are accepted too.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Raw(serde_json::Value::Bool(b)) => Some(*b),
            Value::Raw(v) => v.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Dates may also be stored as integer epoch milliseconds.
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Raw(v) => v
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }
}

/// Type-aware equality: tags must match, bytes compare element-wise, dates by
/// millisecond, and JSON values by content.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a.timestamp_millis() == b.timestamp_millis(),
            (Value::Raw(a), Value::Raw(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Raw(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Raw(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Raw(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Raw(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Raw(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Raw(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Raw(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Raw(v.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::NULL)
    }
}

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<'a, I, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (&'a str, V)>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}

/// Columns of `current` whose value differs from `previous`, ignoring the
/// primary key. A column absent from `previous` counts as changed.
pub fn diff_columns(current: &Row, previous: &Row, primary_key: &[String]) -> Vec<String> {
    current
        .iter()
        .filter(|(col, _)| !primary_key.iter().any(|pk| pk == *col))
        .filter(|(col, value)| previous.get(*col) != Some(*value))
        .map(|(col, _)| col.clone())
        .collect()
}
